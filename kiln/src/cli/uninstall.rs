// kiln/src/cli/uninstall.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_core::{uninstall_formula, LinkRepository, UninstallOptions};
use tracing::error;

#[derive(Args, Debug)]
pub struct Uninstall {
    /// The names of the formulae to uninstall
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Only remove installations of this version
    #[arg(long)]
    pub version: Option<String>,

    /// Only remove the installation with this option fingerprint
    #[arg(long)]
    pub fingerprint: Option<String>,
}

impl Uninstall {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let linker = LinkRepository::new(config);
        let options = UninstallOptions {
            version: self.version.clone(),
            fingerprint: self.fingerprint.clone(),
        };
        let mut errors: Vec<(String, KilnError)> = Vec::new();

        for name in &self.names {
            if name.contains('/') || name.contains("..") {
                let msg = format!("Invalid formula name '{name}' contains disallowed characters");
                error!("✖ {msg}");
                errors.push((name.to_string(), KilnError::Generic(msg)));
                continue;
            }

            println!("Uninstalling {name}...");
            match uninstall_formula(&linker, name, &options).await {
                Ok(removed) => {
                    for record in removed {
                        println!(
                            "✓ Uninstalled {} ({} links removed)",
                            record.key.to_string().green(),
                            record.entries.len()
                        );
                    }
                }
                Err(e) => {
                    error!("✖ Failed to uninstall '{}': {}", name.cyan(), e);
                    errors.push((name.to_string(), e));
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0).1),
            n => {
                let names: Vec<&str> = errors.iter().map(|(n, _)| n.as_str()).collect();
                Err(KilnError::InstallError(format!(
                    "{n} formulae failed to uninstall: {}",
                    names.join(", ")
                )))
            }
        }
    }
}
