// kiln-core/src/uninstall.rs
use std::fs;

use kiln_common::error::{KilnError, Result};
use kiln_common::keg::InstallationRecord;
use tracing::{debug, error, warn};

use crate::install::LinkRepository;

/// Which installations of a formula to remove.
#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    /// Only installations of this version.
    pub version: Option<String>,
    /// Only the installation with this option fingerprint.
    pub fingerprint: Option<String>,
}

/// Unlink and delete the matching installations of `name`. Returns the removed
/// records.
pub async fn uninstall_formula(
    linker: &LinkRepository,
    name: &str,
    options: &UninstallOptions,
) -> Result<Vec<InstallationRecord>> {
    let matching: Vec<InstallationRecord> = linker
        .registry()
        .find_by_name(name)?
        .into_iter()
        .filter(|r| options.version.as_ref().is_none_or(|v| &r.key.version == v))
        .filter(|r| {
            options
                .fingerprint
                .as_ref()
                .is_none_or(|f| &r.key.fingerprint == f)
        })
        .collect();
    if matching.is_empty() {
        return Err(KilnError::InstallError(format!("{name} is not installed")));
    }

    let mut removed = Vec::with_capacity(matching.len());
    for record in matching {
        debug!("Uninstalling {} from {}", record.key, record.prefix.display());
        let Some(record) = linker.unlink(&record.key).await? else {
            continue;
        };
        if record.prefix.exists() {
            fs::remove_dir_all(&record.prefix).map_err(|e| {
                error!("Failed to remove prefix {}: {}", record.prefix.display(), e);
                KilnError::InstallError(format!(
                    "Failed to remove prefix {}: {e}",
                    record.prefix.display()
                ))
            })?;
        } else {
            warn!(
                "Prefix {} not found during uninstall. It might have been already removed.",
                record.prefix.display()
            );
        }
        removed.push(record);
    }
    Ok(removed)
}
