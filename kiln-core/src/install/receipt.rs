// kiln-core/src/install/receipt.rs
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::RecordKey;
use kiln_common::model::option::ResolvedOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Metadata stored inside every private prefix; enough to relink the prefix
/// without the recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub options: ResolvedOptions,
    pub suffix: String,
    #[serde(default)]
    pub keg_only: bool,
    #[serde(default = "yes")]
    pub link_bin: bool,
    #[serde(default = "yes")]
    pub link_man: bool,
    /// Binding names staged under `<prefix>/site-packages`.
    #[serde(default)]
    pub bindings: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

fn yes() -> bool {
    true
}

impl InstallReceipt {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: self.name.clone(),
            version: self.version.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

pub fn write_receipt(prefix: &Path, receipt: &InstallReceipt) -> Result<()> {
    let receipt_path = prefix.join(RECEIPT_FILE);
    debug!("Writing install receipt to: {}", receipt_path.display());
    let json = serde_json::to_string_pretty(receipt).map_err(|e| {
        error!("Failed to serialize install receipt: {}", e);
        KilnError::Json(std::sync::Arc::new(e))
    })?;
    fs::write(&receipt_path, json).map_err(|e| {
        error!("Failed to write install receipt {}: {}", receipt_path.display(), e);
        KilnError::Io(std::sync::Arc::new(e))
    })
}

pub fn read_receipt(prefix: &Path) -> Result<InstallReceipt> {
    let receipt_path = prefix.join(RECEIPT_FILE);
    let raw = fs::read(&receipt_path)?;
    Ok(serde_json::from_slice(&raw)?)
}
