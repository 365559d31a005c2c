// kiln/src/cli/info.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::keg::{InstallationRecord, InstallationRegistry};
use kiln_common::model::formula::{SuffixKeyword, SuffixSpec};
use kiln_common::Formula;
use prettytable::{format, row, Table};

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,
}

impl Info {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let formulary = Formulary::new(config);
        let formula = formulary.load_formula(&self.name)?;
        let installed = InstallationRegistry::new(config).find_by_name(&self.name)?;
        print_formula_info(&formula, &installed);
        Ok(())
    }
}

fn suffix_description(spec: &SuffixSpec) -> String {
    match spec {
        SuffixSpec::Keyword(SuffixKeyword::None) => "none".to_string(),
        SuffixSpec::Keyword(SuffixKeyword::Version) => "from version".to_string(),
        SuffixSpec::Probe { probe, pattern } => {
            format!("probe `{}` ({})", probe.join(" "), pattern)
        }
    }
}

fn print_formula_info(formula: &Formula, installed: &[InstallationRecord]) {
    println!("{}", format!("Formula: {}", formula.name()).green().bold());

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.add_row(row!["Version", formula.version_str_full()]);
    table.add_row(row![
        "Homepage",
        formula.homepage.as_deref().unwrap_or("N/A")
    ]);
    table.add_row(row![
        "Source",
        formula
            .source
            .as_ref()
            .map(|s| s.locator())
            .unwrap_or_else(|| "N/A".to_string())
    ]);
    table.add_row(row!["Link suffix", suffix_description(&formula.link.suffix)]);
    if formula.keg_only {
        table.add_row(row!["Keg-only", "yes"]);
    }
    table.printstd();

    if let Some(desc) = formula.desc.as_deref().filter(|d| !d.is_empty()) {
        println!("\n{}", "Description".blue().bold());
        println!("  {desc}");
    }

    if !formula.options().is_empty() {
        println!("\n{}", "Options".blue().bold());
        let mut options = Table::new();
        options.set_format(*format::consts::FORMAT_CLEAN);
        for option in formula.options() {
            options.add_row(row![
                format!("--{}", option.name).cyan(),
                format!("[{}]", option.default),
                option.description
            ]);
        }
        options.printstd();
    }

    if !formula.dependencies().is_empty() {
        println!("\n{}", "Dependencies".blue().bold());
        let mut deps = Table::new();
        deps.set_format(*format::consts::FORMAT_CLEAN);
        for dep in formula.dependencies() {
            let mut notes = Vec::new();
            if let Some(when) = &dep.when {
                notes.push(format!("when {when}"));
            }
            if let Some(graft) = &dep.graft {
                notes.push(format!("grafted at {graft}"));
            }
            if !dep.flags.is_empty() {
                notes.push(format!("with {}", dep.flags.join(" ")));
            }
            deps.add_row(row![dep.name, format!("({})", dep.strength), notes.join("; ")]);
        }
        deps.printstd();
    }

    if !formula.caveats.is_empty() {
        println!("\n{}", "Caveats".blue().bold());
        for caveat in &formula.caveats {
            match &caveat.when {
                Some(when) => println!("  [{when}] {}", caveat.text.trim()),
                None => println!("  {}", caveat.text.trim()),
            }
        }
    }

    println!("\n{}", "Installations".blue().bold());
    if installed.is_empty() {
        println!("  Not installed");
    } else {
        for record in installed {
            println!(
                "  {} {} ({} links) {}",
                record.prefix.display(),
                if record.suffix.is_empty() {
                    "no suffix".dimmed().to_string()
                } else {
                    format!("suffix {}", record.suffix)
                },
                record.entries.len(),
                record.options.to_string().dimmed()
            );
        }
    }

    println!("\n{}", "Installation".blue().bold());
    println!("  {} install {}", "kiln".cyan(), formula.name());
}
