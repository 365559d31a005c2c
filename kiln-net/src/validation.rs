// kiln-net/src/validation.rs
use std::fs::File;
use std::io;
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes_copied = io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    tracing::debug!("Calculated SHA256: {} ({} bytes read)", actual, bytes_copied);
    Ok(actual)
}

pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    tracing::debug!("Verifying checksum for: {}", path.display());
    let actual = sha256_file(path)?;
    tracing::debug!("Expected SHA256:   {}", expected);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(KilnError::ChecksumError(format!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )))
    }
}

/// Accept `https` downloads and local `file` URLs.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| KilnError::Generic(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        other => Err(KilnError::DownloadError(
            url_str.to_string(),
            url_str.to_string(),
            format!("Invalid URL scheme: must be https or file, but got '{other}'"),
        )),
    }
}
