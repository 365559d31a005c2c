// kiln-core/src/install/mod.rs
// Everything that happens after a formula's install steps succeeded.
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::InstallationRecord;
use kiln_common::model::formula::Formula;
use kiln_common::model::option::ResolvedOptions;
use kiln_common::model::procedure::resolve_inside;
use tracing::{debug, warn};

pub mod link;
pub mod receipt;
pub mod suffix;

pub use link::{LinkRepository, LinkRequest};
pub use receipt::{read_receipt, write_receipt, InstallReceipt, RECEIPT_FILE};
pub use suffix::compute_suffix;

use crate::build::copy_tree;

/// Copy each active binding from the build tree to
/// `<prefix>/site-packages/<name>-<suffix>`. Returns the staged binding names.
pub fn stage_bindings(
    formula: &Formula,
    options: &ResolvedOptions,
    buildpath: &Path,
    prefix: &Path,
    suffix: &str,
) -> Result<Vec<String>> {
    let mut staged = Vec::new();
    for binding in formula.active_bindings(options) {
        let from = resolve_inside(buildpath, &binding.from)?;
        if !from.is_dir() {
            return Err(KilnError::InstallError(format!(
                "{}: binding source {} does not exist",
                formula.name(),
                from.display()
            )));
        }
        let dest: PathBuf = prefix
            .join("site-packages")
            .join(link::binding_dir_name(&binding.name, suffix));
        copy_tree(&from, &dest)?;
        debug!("[{}] Staged binding {} at {}", formula.name(), binding.name, dest.display());
        staged.push(binding.name.clone());
    }
    Ok(staged)
}

/// Relink an installed prefix from its receipt, e.g. after its links were removed.
pub async fn relink_prefix(linker: &LinkRepository, prefix: &Path) -> Result<InstallationRecord> {
    let receipt = read_receipt(prefix)?;
    linker.link(LinkRequest::from_receipt(&receipt, prefix)).await
}

/// Private prefixes under `<root>/lib` that carry an install receipt,
/// optionally only those of formula `name`. Sorted by prefix path.
pub fn installed_prefixes(
    config: &Config,
    name: Option<&str>,
) -> Result<Vec<(PathBuf, InstallReceipt)>> {
    let lib_dir = config.lib_dir();
    if !lib_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(&lib_dir)? {
        let path = entry?.path();
        if !path.is_dir() || !path.join(RECEIPT_FILE).is_file() {
            continue;
        }
        match read_receipt(&path) {
            Ok(receipt) if name.is_none_or(|n| receipt.name == n) => found.push((path, receipt)),
            Ok(_) => {}
            Err(e) => warn!("Ignoring unreadable receipt in {}: {}", path.display(), e),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kiln_common::model::formula::Binding;
    use kiln_common::model::option::OptionValue;
    use kiln_common::model::predicate::Predicate;

    use super::*;

    fn llvm() -> Formula {
        let mut f = Formula::new("llvm", "3.4");
        f.options.push(kiln_common::model::option::FormulaOption::switch(
            "with-python",
            "Build Python bindings",
            false,
        ));
        f.link.bindings.push(Binding {
            from: "bindings/python/llvm".into(),
            name: "llvm".into(),
            when: Some(Predicate::Enabled("with-python".into())),
        });
        f
    }

    #[test]
    fn bindings_are_staged_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        fs::create_dir_all(build.join("bindings/python/llvm")).unwrap();
        fs::write(build.join("bindings/python/llvm/core.py"), "").unwrap();
        let prefix = dir.path().join("prefix");

        let f = llvm();
        let mut options = f.default_options();
        assert!(stage_bindings(&f, &options, &build, &prefix, "3.4")
            .unwrap()
            .is_empty());

        options.insert("with-python", OptionValue::Bool(true));
        let staged = stage_bindings(&f, &options, &build, &prefix, "3.4").unwrap();
        assert_eq!(staged, vec!["llvm".to_string()]);
        assert!(prefix.join("site-packages/llvm-3.4/core.py").is_file());
    }

    #[tokio::test]
    async fn relink_uses_the_receipt() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let prefix = config.formula_prefix("llvm", "3.4", None);
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::write(prefix.join("bin/llc"), "").unwrap();
        let options = ResolvedOptions::new();
        write_receipt(
            &prefix,
            &InstallReceipt {
                name: "llvm".into(),
                version: "3.4".into(),
                fingerprint: options.fingerprint(),
                options,
                suffix: "3.4".into(),
                keg_only: false,
                link_bin: true,
                link_man: true,
                bindings: Vec::new(),
                installed_at: chrono::Utc::now(),
            },
        )
        .unwrap();

        let linker = LinkRepository::new(&config);
        let record = relink_prefix(&linker, &prefix).await.unwrap();
        assert_eq!(record.entries.len(), 1);
        assert!(config.bin_dir().join("llc-3.4").symlink_metadata().is_ok());
    }

    #[test]
    fn prefixes_are_found_by_receipt_name() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        for (name, version) in [("llvm", "3.4"), ("llvm", "3.5"), ("clang", "3.4")] {
            let prefix = config.formula_prefix(name, version, None);
            fs::create_dir_all(&prefix).unwrap();
            let options = ResolvedOptions::new();
            write_receipt(
                &prefix,
                &InstallReceipt {
                    name: name.into(),
                    version: version.into(),
                    fingerprint: options.fingerprint(),
                    options,
                    suffix: version.into(),
                    keg_only: false,
                    link_bin: true,
                    link_man: true,
                    bindings: Vec::new(),
                    installed_at: chrono::Utc::now(),
                },
            )
            .unwrap();
        }
        // site-packages and half-written prefixes have no receipt.
        fs::create_dir_all(config.lib_dir().join("llvm-4.0")).unwrap();

        let llvm = installed_prefixes(&config, Some("llvm")).unwrap();
        let versions: Vec<_> = llvm.iter().map(|(_, r)| r.version.as_str()).collect();
        assert_eq!(versions, vec!["3.4", "3.5"]);
        assert_eq!(installed_prefixes(&config, None).unwrap().len(), 3);
    }
}
