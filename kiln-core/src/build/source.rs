// kiln-core/src/build/source.rs
// Fills a build workspace with a formula's sources.
use std::fs;
use std::path::Path;

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::{Formula, SourceSpec};
use kiln_net::{clone_repo, extract_archive, fetch_source_archive, flatten_single_dir, is_archive};
use tracing::debug;

use super::graft::copy_tree;

/// Materialize the formula's source into `buildpath`, which must exist and be empty.
/// Formulae without a source leave the workspace empty.
pub async fn materialize_source(formula: &Formula, buildpath: &Path, config: &Config) -> Result<()> {
    let Some(source) = &formula.source else {
        debug!("[{}] No source declared", formula.name());
        return Ok(());
    };
    match source {
        SourceSpec::Path { path } => {
            if !path.is_dir() {
                return Err(KilnError::InstallError(format!(
                    "source directory {} for '{}' does not exist",
                    path.display(),
                    formula.name()
                )));
            }
            let copied = copy_tree(path, buildpath)?;
            debug!("[{}] Copied {} files from {}", formula.name(), copied, path.display());
        }
        SourceSpec::Git { git, branch } => {
            clone_repo(git, branch.as_deref(), buildpath).await?;
        }
        SourceSpec::Archive {
            url,
            sha256,
            mirrors,
        } => {
            let download =
                fetch_source_archive(formula.name(), url, sha256.as_deref(), mirrors, config)
                    .await?;
            if is_archive(&download) {
                extract_archive(&download, buildpath).await?;
                flatten_single_dir(buildpath)?;
            } else {
                // Plain files (a single script, a patch) are placed as-is.
                let file_name = download
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.split_once("--").map(|(_, tail)| tail.to_string()))
                    .unwrap_or_else(|| formula.name().to_string());
                fs::copy(&download, buildpath.join(file_name))?;
            }
        }
    }
    Ok(())
}

/// Install step for formulae without an install procedure: the prepared source
/// tree becomes the prefix contents.
pub fn stage_into_prefix(buildpath: &Path, prefix: &Path) -> Result<()> {
    let copied = copy_tree(buildpath, prefix)?;
    debug!("Staged {} files from {} into {}", copied, buildpath.display(), prefix.display());
    Ok(())
}
