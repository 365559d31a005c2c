// kiln-common/src/keg.rs
//! On-disk installation records: which (formula, version, option fingerprint)
//! lives in which private prefix and which shared links point into it.
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::option::ResolvedOptions;

/// Identity of one installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.name, self.version, self.fingerprint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Executable,
    ManPage,
    Binding,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Executable => f.write_str("bin"),
            EntryKind::ManPage => f.write_str("man"),
            EntryKind::Binding => f.write_str("binding"),
        }
    }
}

/// A shared symlink created for an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedEntry {
    pub kind: EntryKind,
    pub link: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRecord {
    #[serde(flatten)]
    pub key: RecordKey,
    pub prefix: PathBuf,
    pub suffix: String,
    pub options: ResolvedOptions,
    #[serde(default)]
    pub entries: Vec<LinkedEntry>,
    pub installed_at: DateTime<Utc>,
}

impl InstallationRecord {
    pub fn name(&self) -> &str {
        &self.key.name
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    records: Vec<InstallationRecord>,
}

/// The record store at `<root>/var/kiln/installed.json`.
///
/// Reads are cheap snapshots; every mutation rewrites the whole file
/// through a temporary file in the same directory and a rename.
#[derive(Debug, Clone)]
pub struct InstallationRegistry {
    path: PathBuf,
}

impl InstallationRegistry {
    pub fn new(config: &Config) -> Self {
        Self::at(config.records_path())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<InstallationRecord>> {
        if !self.path.exists() {
            debug!("No installation records at {}", self.path.display());
            return Ok(Vec::new());
        }
        let raw = fs::read(&self.path)?;
        let file: RecordFile = serde_json::from_slice(&raw)?;
        Ok(file.records)
    }

    fn save(&self, records: &[InstallationRecord]) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            KilnError::Config(format!("record path {} has no parent", self.path.display()))
        })?;
        fs::create_dir_all(parent)?;
        let bytes = serde_json::to_vec_pretty(&RecordFile {
            records: records.to_vec(),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| KilnError::Io(std::sync::Arc::new(e.error)))?;
        debug!("Wrote {} installation records to {}", records.len(), self.path.display());
        Ok(())
    }

    pub fn find(&self, key: &RecordKey) -> Result<Option<InstallationRecord>> {
        Ok(self.load()?.into_iter().find(|r| &r.key == key))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Vec<InstallationRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.key.name == name)
            .collect())
    }

    /// Append a record, replacing an older record with the same key.
    pub fn append(&self, record: InstallationRecord) -> Result<()> {
        let mut records = self.load()?;
        if let Some(pos) = records.iter().position(|r| r.key == record.key) {
            warn!("Replacing existing installation record for {}", record.key);
            records.remove(pos);
        }
        records.push(record);
        self.save(&records)
    }

    pub fn remove(&self, key: &RecordKey) -> Result<Option<InstallationRecord>> {
        let mut records = self.load()?;
        let Some(pos) = records.iter().position(|r| &r.key == key) else {
            return Ok(None);
        };
        let removed = records.remove(pos);
        self.save(&records)?;
        Ok(Some(removed))
    }

    /// Record whose entries already claim `link`, if any.
    pub fn owner_of(&self, link: &Path) -> Result<Option<RecordKey>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|r| r.entries.iter().any(|e| e.link == link))
            .map(|r| r.key))
    }
}
