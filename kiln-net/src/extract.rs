// kiln-net/src/extract.rs
// Unpacks downloaded source archives into a build workspace.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tracing::debug;
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz") || name.ends_with(".tbz2") {
        Some(ArchiveKind::TarBz2)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Some(ArchiveKind::TarXz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// Whether `path` names a tarball this module knows how to unpack.
pub fn is_archive(path: &Path) -> bool {
    archive_kind(path).is_some()
}

fn unpack<R: Read>(reader: R, target_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    // `unpack` refuses entries that would land outside target_dir.
    archive
        .unpack(target_dir)
        .map_err(|e| KilnError::Generic(format!("Failed to unpack archive: {e}")))
}

fn extract_blocking(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let kind = archive_kind(archive_path).ok_or_else(|| {
        KilnError::Generic(format!(
            "Unsupported archive type: '{}'",
            archive_path.display()
        ))
    })?;
    debug!(
        "Extracting archive '{}' ({:?}) to '{}'",
        archive_path.display(),
        kind,
        target_dir.display()
    );
    fs::create_dir_all(target_dir)?;
    let reader = BufReader::new(File::open(archive_path)?);
    match kind {
        ArchiveKind::Tar => unpack(reader, target_dir),
        ArchiveKind::TarGz => unpack(GzDecoder::new(reader), target_dir),
        ArchiveKind::TarBz2 => unpack(BzDecoder::new(reader), target_dir),
        ArchiveKind::TarXz => unpack(XzDecoder::new(reader), target_dir),
    }
}

/// Extract a tarball into `target_dir`, inferring compression from the file name.
pub async fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &target_dir))
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError in archive extraction: {e}")))?
}

/// If `dir` holds exactly one directory and nothing else, move that directory's
/// contents up into `dir`. Returns the directory now holding the sources.
pub fn flatten_single_dir(dir: &Path) -> Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<std::result::Result<_, _>>()?;
    let [only] = entries.as_slice() else {
        return Ok(dir.to_path_buf());
    };
    if !only.file_type()?.is_dir() {
        return Ok(dir.to_path_buf());
    }
    let nested = only.path();
    // Rename the wrapper first so a child with the same name can move up.
    let parked = dir.join(format!(".kiln-flatten-{}", std::process::id()));
    fs::rename(&nested, &parked)?;
    let children: Vec<walkdir::DirEntry> = walkdir::WalkDir::new(&parked)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| KilnError::Generic(format!("walk {}: {e}", parked.display())))?;
    for entry in children {
        fs::rename(entry.path(), dir.join(entry.file_name()))?;
    }
    fs::remove_dir(&parked)?;
    debug!("Flattened single top-level directory in {}", dir.display());
    Ok(dir.to_path_buf())
}
