// kiln-core/src/install/link.rs
//! The installation linker.
//!
//! [`LinkRepository`] owns every shared directory (`bin`, `share/man/man1`,
//! site-packages) and the installation records. Callers get at those
//! directories only through it. All mutations run under one async mutex, held
//! from the first conflict check until the record is written, so concurrent
//! builds never interleave link creation.
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::Utc;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{EntryKind, InstallationRecord, InstallationRegistry, LinkedEntry, RecordKey};
use kiln_common::model::option::ResolvedOptions;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::receipt::InstallReceipt;

/// What to link for one finished installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub key: RecordKey,
    pub prefix: PathBuf,
    pub suffix: String,
    pub options: ResolvedOptions,
    pub keg_only: bool,
    pub link_bin: bool,
    pub link_man: bool,
    /// Names of bindings staged under `<prefix>/site-packages`.
    pub bindings: Vec<String>,
}

impl LinkRequest {
    pub fn from_receipt(receipt: &InstallReceipt, prefix: &Path) -> Self {
        Self {
            key: receipt.key(),
            prefix: prefix.to_path_buf(),
            suffix: receipt.suffix.clone(),
            options: receipt.options.clone(),
            keg_only: receipt.keg_only,
            link_bin: receipt.link_bin,
            link_man: receipt.link_man,
            bindings: receipt.bindings.clone(),
        }
    }
}

/// `clang` + `3.4` -> `clang-3.4`; an empty suffix keeps the plain name.
pub fn suffixed_name(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{base}-{suffix}")
    }
}

/// `clang.1` + `3.4` -> `clang-3.4.1`.
pub fn suffixed_man_page(page: &str, suffix: &str) -> String {
    match page.strip_suffix(".1") {
        Some(stem) => format!("{}.1", suffixed_name(stem, suffix)),
        None => suffixed_name(page, suffix),
    }
}

/// Directory name of a staged binding, shared by the prefix and site-packages.
pub fn binding_dir_name(name: &str, suffix: &str) -> String {
    suffixed_name(name, suffix)
}

fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        entries.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
    }
    entries.sort();
    Ok(entries)
}

fn remove_links(links: &[PathBuf]) {
    for link in links.iter().rev() {
        if let Err(e) = fs::remove_file(link) {
            warn!("Failed to roll back link {}: {}", link.display(), e);
        } else {
            debug!("Rolled back link {}", link.display());
        }
    }
}

#[derive(Debug)]
pub struct LinkRepository {
    config: Config,
    registry: InstallationRegistry,
    lock: Mutex<()>,
}

impl LinkRepository {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            registry: InstallationRegistry::new(config),
            lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &InstallationRegistry {
        &self.registry
    }

    fn plan_links(&self, request: &LinkRequest) -> Result<Vec<LinkedEntry>> {
        let mut planned = Vec::new();
        if request.keg_only {
            debug!("{} is keg-only; no entry points linked", request.key);
            return Ok(planned);
        }

        let bin = request.prefix.join("bin");
        if request.link_bin && bin.is_dir() {
            for (name, target) in sorted_entries(&bin)? {
                planned.push(LinkedEntry {
                    kind: EntryKind::Executable,
                    link: self
                        .config
                        .bin_dir()
                        .join(suffixed_name(&name, &request.suffix)),
                    target,
                });
            }
        }

        let man1 = request.prefix.join("share").join("man").join("man1");
        if request.link_man && man1.is_dir() {
            for (name, target) in sorted_entries(&man1)? {
                planned.push(LinkedEntry {
                    kind: EntryKind::ManPage,
                    link: self
                        .config
                        .man1_dir()
                        .join(suffixed_man_page(&name, &request.suffix)),
                    target,
                });
            }
        }

        for name in &request.bindings {
            let dir_name = binding_dir_name(name, &request.suffix);
            let target = request.prefix.join("site-packages").join(&dir_name);
            if !target.exists() {
                return Err(KilnError::InstallError(format!(
                    "binding '{}' was not staged at {}",
                    name,
                    target.display()
                )));
            }
            planned.push(LinkedEntry {
                kind: EntryKind::Binding,
                link: self.config.site_packages_dir().join(&dir_name),
                target,
            });
        }
        Ok(planned)
    }

    /// Check every planned link before touching the filesystem. Returns the
    /// links that still need creating; links already pointing at the same
    /// target are reused.
    fn check_conflicts<'a>(&self, planned: &'a [LinkedEntry]) -> Result<Vec<&'a LinkedEntry>> {
        let mut missing = Vec::new();
        for entry in planned {
            match fs::symlink_metadata(&entry.link) {
                Ok(meta) => {
                    let existing = if meta.file_type().is_symlink() {
                        fs::read_link(&entry.link)?
                    } else {
                        entry.link.clone()
                    };
                    if meta.file_type().is_symlink() && existing == entry.target {
                        debug!("Reusing existing link {}", entry.link.display());
                        continue;
                    }
                    return Err(KilnError::LinkConflict {
                        link: entry.link.clone(),
                        existing,
                        requested: entry.target.clone(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::NotFound => missing.push(entry),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }

    fn create_links(entries: &[&LinkedEntry]) -> Result<Vec<PathBuf>> {
        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = entry
                .link
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| symlink(&entry.target, &entry.link));
            if let Err(e) = result {
                warn!("Failed to link {}: {}", entry.link.display(), e);
                remove_links(&created);
                return Err(e.into());
            }
            debug!("Linked {} -> {}", entry.link.display(), entry.target.display());
            created.push(entry.link.clone());
        }
        Ok(created)
    }

    /// Link a finished installation and append its record. On any failure the
    /// links created by this call are removed and no record is written.
    #[instrument(skip_all, fields(key = %request.key))]
    pub async fn link(&self, request: LinkRequest) -> Result<InstallationRecord> {
        let _guard = self.lock.lock().await;

        let planned = self.plan_links(&request)?;
        let missing = self.check_conflicts(&planned)?;
        let created = Self::create_links(&missing)?;

        let record = InstallationRecord {
            key: request.key,
            prefix: request.prefix,
            suffix: request.suffix,
            options: request.options,
            entries: planned,
            installed_at: Utc::now(),
        };
        if let Err(e) = self.registry.append(record.clone()) {
            remove_links(&created);
            return Err(e);
        }
        debug!(
            "Recorded {} with {} linked entries ({} new)",
            record.key,
            record.entries.len(),
            created.len()
        );
        Ok(record)
    }

    /// Remove the links of a record that still point into its prefix, then the
    /// record itself.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn unlink(&self, key: &RecordKey) -> Result<Option<InstallationRecord>> {
        let _guard = self.lock.lock().await;
        let Some(record) = self.registry.find(key)? else {
            return Ok(None);
        };
        for entry in &record.entries {
            match fs::read_link(&entry.link) {
                Ok(target) if target.starts_with(&record.prefix) => {
                    fs::remove_file(&entry.link)?;
                    debug!("Removed link {}", entry.link.display());
                }
                Ok(target) => debug!(
                    "Leaving {} alone; it now points to {}",
                    entry.link.display(),
                    target.display()
                ),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Not removing {}: {}", entry.link.display(), e),
            }
        }
        self.registry.remove(key)
    }
}
