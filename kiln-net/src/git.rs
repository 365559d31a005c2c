// kiln-net/src/git.rs
// Clones head-only sources with git2. Blocking work runs on the blocking pool.
use std::path::{Path, PathBuf};

use git2::build::RepoBuilder;
use git2::FetchOptions;
use kiln_common::error::{KilnError, Result};
use tracing::{debug, error};

fn is_network_remote(url: &str) -> bool {
    ["https://", "http://", "git://", "ssh://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
        || url.contains('@')
}

fn clone_blocking(url: &str, branch: Option<&str>, dest: &Path) -> Result<()> {
    debug!("Cloning {} (branch: {:?}) into {}", url, branch, dest.display());
    let mut fetch_options = FetchOptions::new();
    if is_network_remote(url) {
        fetch_options.depth(1);
    }
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder.clone(url, dest).map_err(|e| {
        error!("Failed to clone {}: {}", url, e);
        KilnError::Git(format!("Failed to clone '{url}': {e}"))
    })?;
    Ok(())
}

/// Clone `url` into `dest`, which must not exist yet or be empty.
pub async fn clone_repo(url: &str, branch: Option<&str>, dest: &Path) -> Result<PathBuf> {
    let url = url.to_string();
    let branch = branch.map(str::to_string);
    let dest = dest.to_path_buf();
    let out = dest.clone();
    tokio::task::spawn_blocking(move || clone_blocking(&url, branch.as_deref(), &dest))
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError in git clone: {e}")))??;
    Ok(out)
}
