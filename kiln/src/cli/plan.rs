// kiln/src/cli/plan.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::keg::{InstallationRegistry, RecordKey};
use prettytable::{format, Cell, Row, Table};
use serde_json::json;

use crate::pipeline::{resolve_plan, PipelineFlags};

#[derive(Args, Debug)]
pub struct Plan {
    /// Also include the test dependencies of the requested formula
    #[arg(long)]
    include_test: bool,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,

    /// Formula to plan
    name: String,

    /// Formula options, as for `kiln install`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "OPTIONS")]
    options: Vec<String>,
}

impl Plan {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let formulary = Formulary::new(config);
        let flags = PipelineFlags {
            include_test: self.include_test,
        };
        let plan = resolve_plan(&formulary, &self.name, &self.options, &flags)?;
        let registry = InstallationRegistry::new(config);

        if self.json {
            let entries: Vec<_> = plan
                .entries
                .iter()
                .map(|entry| {
                    let options: serde_json::Map<_, _> = entry
                        .options
                        .iter()
                        .map(|(k, v)| (k.clone(), json!(v)))
                        .collect();
                    let grafts: Vec<_> = entry
                        .grafts
                        .iter()
                        .map(|g| json!({ "formula": g.formula, "path": g.path }))
                        .collect();
                    json!({
                        "name": entry.name(),
                        "version": entry.formula.version_str_full(),
                        "fingerprint": entry.fingerprint(),
                        "options": options,
                        "dependencies": entry.dependencies,
                        "grafts": grafts,
                        "requested": entry.requested,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("#").style_spec("b"),
            Cell::new("Formula").style_spec("b"),
            Cell::new("Version").style_spec("b"),
            Cell::new("Options").style_spec("b"),
            Cell::new("Grafts").style_spec("b"),
            Cell::new("Status").style_spec("b"),
        ]));
        for (index, entry) in plan.entries.iter().enumerate() {
            let version = entry.formula.version_str_full();
            let non_default: Vec<String> = entry
                .options
                .non_default(entry.formula.options())
                .into_iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            let grafts: Vec<String> = entry
                .grafts
                .iter()
                .map(|g| format!("{} -> {}", g.formula, g.path))
                .collect();
            let key = RecordKey {
                name: entry.name().to_string(),
                version: version.clone(),
                fingerprint: entry.fingerprint(),
            };
            let status = if registry.find(&key)?.is_some() {
                "installed".green().to_string()
            } else {
                "build".yellow().to_string()
            };
            let name = if entry.requested {
                entry.name().bold().to_string()
            } else {
                entry.name().to_string()
            };
            table.add_row(Row::new(vec![
                Cell::new(&(index + 1).to_string()),
                Cell::new(&name),
                Cell::new(&version),
                Cell::new(&non_default.join(" ")),
                Cell::new(&grafts.join(", ")),
                Cell::new(&status),
            ]));
        }
        table.printstd();
        Ok(())
    }
}
