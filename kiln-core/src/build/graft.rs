// kiln-core/src/build/graft.rs
// Copies installed sub-formulae into a parent's build tree before it builds.
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::procedure::resolve_inside;
use tracing::debug;
use walkdir::WalkDir;

/// Recursively copy `src` into `dest`, keeping symlinks as symlinks.
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry =
            entry.map_err(|e| KilnError::Generic(format!("walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KilnError::Generic(e.to_string()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link_target, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Place the installed files of a sub-formula at `<buildpath>/<graft_path>`.
pub fn graft_into(sub_prefix: &Path, buildpath: &Path, graft_path: &str) -> Result<PathBuf> {
    if !sub_prefix.is_dir() {
        return Err(KilnError::InstallError(format!(
            "cannot graft '{}': prefix {} does not exist",
            graft_path,
            sub_prefix.display()
        )));
    }
    let dest = resolve_inside(buildpath, graft_path)?;
    let copied = copy_tree(sub_prefix, &dest)?;
    debug!(
        "Grafted {} files from {} into {}",
        copied,
        sub_prefix.display(),
        dest.display()
    );
    Ok(dest)
}
