// kiln-core/src/build/workspace.rs
use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::error::Result;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Scratch directory for one formula build, created under `<root>/tmp`.
///
/// The directory is removed when the workspace is dropped unless `keep_tmp`
/// is set, in which case it is left behind for inspection.
#[derive(Debug)]
pub struct BuildWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl BuildWorkspace {
    pub fn create(config: &Config, formula_name: &str) -> Result<Self> {
        let tmp_root = config.tmp_dir();
        fs::create_dir_all(&tmp_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{formula_name}-"))
            .tempdir_in(&tmp_root)?;
        let path = dir.path().to_path_buf();
        debug!("Created build workspace {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            keep: config.keep_tmp,
        })
    }

    /// Root of the source tree the install procedure runs in.
    pub fn buildpath(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildWorkspace {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if self.keep {
            let kept = dir.keep();
            warn!("Keeping build workspace {}", kept.display());
        } else if let Err(e) = dir.close() {
            warn!("Failed to remove build workspace {}: {}", self.path.display(), e);
        }
    }
}
