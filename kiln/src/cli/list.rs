// kiln/src/cli/list.rs
use std::collections::HashMap;

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::{InstallationRecord, InstallationRegistry};
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct List {
    /// Show every installed version and variant, not just the newest per name
    #[arg(long)]
    pub all: bool,

    /// Also list the linked entry points of each installation
    #[arg(long)]
    pub links: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let installed = InstallationRegistry::new(config).load()?;
        let mut records: Vec<&InstallationRecord> = if self.all {
            installed.iter().collect()
        } else {
            let mut latest: HashMap<&str, &InstallationRecord> = HashMap::new();
            for record in &installed {
                let entry = latest.entry(record.name()).or_insert(record);
                if record.installed_at > entry.installed_at {
                    *entry = record;
                }
            }
            latest.into_values().collect()
        };
        records.sort_by(|a, b| {
            a.key
                .name
                .cmp(&b.key.name)
                .then(a.key.version.cmp(&b.key.version))
        });

        if records.is_empty() {
            println!("{}", "0 formulae installed".yellow());
            return Ok(());
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Name").style_spec("b"),
            Cell::new("Version").style_spec("b"),
            Cell::new("Suffix").style_spec("b"),
            Cell::new("Fingerprint").style_spec("b"),
            Cell::new("Links").style_spec("b"),
            Cell::new("Installed").style_spec("b"),
        ]));
        for record in &records {
            table.add_row(Row::new(vec![
                Cell::new(&record.key.name).style_spec("Fg"),
                Cell::new(&record.key.version),
                Cell::new(if record.suffix.is_empty() {
                    "-"
                } else {
                    record.suffix.as_str()
                }),
                Cell::new(&record.key.fingerprint),
                Cell::new(&record.entries.len().to_string()),
                Cell::new(&record.installed_at.format("%Y-%m-%d %H:%M").to_string()),
            ]));
        }
        table.printstd();

        if self.links {
            for record in &records {
                if record.entries.is_empty() {
                    continue;
                }
                println!("\n{}", record.key.to_string().blue().bold());
                for entry in &record.entries {
                    println!(
                        "  {} -> {}",
                        entry.link.display(),
                        entry.target.display().to_string().dimmed()
                    );
                }
            }
        }

        println!(
            "\n{}",
            format!("{} installations", records.len()).bold()
        );
        Ok(())
    }
}
