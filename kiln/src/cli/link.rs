// kiln/src/cli/link.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_core::install::{installed_prefixes, relink_prefix};
use kiln_core::LinkRepository;
use tracing::{error, instrument};

#[derive(Args, Debug)]
#[command(arg_required_else_help = true)]
pub struct Link {
    /// Formulae whose private prefixes should be relinked
    names: Vec<String>,

    /// Relink every prefix that has a receipt but no installation record
    #[arg(long, conflicts_with = "names")]
    all: bool,
}

impl Link {
    #[instrument(skip(self, config), fields(names = ?self.names))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let mut prefixes = Vec::new();
        if self.all {
            prefixes = installed_prefixes(config, None)?;
        } else {
            for name in &self.names {
                let found = installed_prefixes(config, Some(name))?;
                if found.is_empty() {
                    return Err(KilnError::InstallError(format!(
                        "No installed prefix found for {name}"
                    )));
                }
                prefixes.extend(found);
            }
        }

        let linker = LinkRepository::new(config);
        let mut failures = 0;
        for (prefix, receipt) in prefixes {
            let key = receipt.key();
            if linker.registry().find(&key)?.is_some() {
                println!("{} {} is already linked", "==>".bold().blue(), key);
                continue;
            }
            match relink_prefix(&linker, &prefix).await {
                Ok(record) => println!(
                    "{} Linked {} ({} entries)",
                    "==>".bold().blue(),
                    key.to_string().cyan(),
                    record.entries.len()
                ),
                Err(e) => {
                    error!("Failed to link {}: {}", prefix.display(), e);
                    eprintln!("{} {}: {}", "✗".red().bold(), key.to_string().cyan(), e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(KilnError::InstallError(format!(
                "{failures} prefix(es) could not be linked"
            )));
        }
        Ok(())
    }
}
