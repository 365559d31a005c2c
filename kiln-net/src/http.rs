use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::validation::{validate_url, verify_checksum};

const DOWNLOAD_TIMEOUT_SECS: u64 = 600;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "kiln build orchestrator (Rust)";

/// Name of the cached download for `url`, prefixed with the formula name so two
/// formulae shipping `src.tar.gz` do not share a cache slot.
fn cache_file_name(formula_name: &str, url: &str) -> String {
    let tail = url
        .split(['?', '#'])
        .next()
        .and_then(|u| u.split('/').next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download");
    format!("{formula_name}--{tail}")
}

/// Download a source archive into the cache, trying mirrors in order, and verify it
/// against `sha256` when one is declared. A valid cached copy is reused.
pub async fn fetch_source_archive(
    formula_name: &str,
    url: &str,
    sha256_expected: Option<&str>,
    mirrors: &[String],
    config: &Config,
) -> Result<PathBuf> {
    let cache_path = config.cache_dir().join(cache_file_name(formula_name, url));
    debug!(
        "Preparing to fetch source for '{}' from URL: {} (cache: {})",
        formula_name,
        url,
        cache_path.display()
    );

    if cache_path.is_file() {
        match sha256_expected {
            Some(expected) => match verify_checksum(&cache_path, expected) {
                Ok(()) => {
                    debug!("Using valid cached file: {}", cache_path.display());
                    return Ok(cache_path);
                }
                Err(e) => {
                    debug!(
                        "Cached file checksum mismatch ({}): {}. Redownloading.",
                        cache_path.display(),
                        e
                    );
                    if let Err(remove_err) = fs::remove_file(&cache_path) {
                        debug!(
                            "Failed to remove corrupted cached file {}: {}",
                            cache_path.display(),
                            remove_err
                        );
                    }
                }
            },
            None => {
                debug!("Using cached file (no checksum provided): {}", cache_path.display());
                return Ok(cache_path);
            }
        }
    }

    fs::create_dir_all(config.cache_dir())?;
    let client = build_http_client()?;

    let mut last_error: Option<KilnError> = None;
    for current_url in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
        debug!("Attempting download from: {}", current_url);
        match download_and_verify(&client, current_url, &cache_path, sha256_expected).await {
            Ok(path) => {
                debug!("Successfully downloaded and verified: {}", path.display());
                return Ok(path);
            }
            Err(e) => {
                error!("Download attempt failed from {}: {}", current_url, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        KilnError::DownloadError(
            formula_name.to_string(),
            url.to_string(),
            "All download attempts failed.".to_string(),
        )
    }))
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| KilnError::Generic(format!("Failed to build HTTP client: {e}")))
}

async fn download_and_verify(
    client: &Client,
    url: &str,
    final_path: &Path,
    sha256_expected: Option<&str>,
) -> Result<PathBuf> {
    let parsed = validate_url(url)?;
    let file_label = final_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = final_path.with_file_name(format!(".{file_label}.download"));
    if temp_path.exists() {
        if let Err(e) = fs::remove_file(&temp_path) {
            warn!("Could not remove existing temporary file {}: {}", temp_path.display(), e);
        }
    }

    if parsed.scheme() == "file" {
        let local = parsed.to_file_path().map_err(|_| {
            KilnError::DownloadError(file_label.clone(), url.to_string(), "bad file URL".into())
        })?;
        tokio::fs::copy(&local, &temp_path).await?;
    } else {
        let response = client.get(url).send().await.map_err(|e| {
            KilnError::DownloadError(file_label.clone(), url.to_string(), e.to_string())
        })?;
        let status = response.status();
        debug!("Received HTTP status: {} for {}", status, url);
        if !status.is_success() {
            let reason = match status {
                StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
                StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
                other => format!("HTTP error {other}"),
            };
            return Err(KilnError::DownloadError(file_label, url.to_string(), reason));
        }

        let mut temp_file = TokioFile::create(&temp_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                KilnError::DownloadError(file_label.clone(), url.to_string(), e.to_string())
            })?;
            temp_file.write_all(&chunk).await?;
        }
        temp_file.flush().await?;
        drop(temp_file);
    }

    match sha256_expected {
        Some(expected) => {
            if let Err(e) = verify_checksum(&temp_path, expected) {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
            debug!("Checksum verified for temporary file: {}", temp_path.display());
        }
        None => warn!("Skipping checksum verification for {} - none provided.", url),
    }

    fs::rename(&temp_path, final_path)?;
    debug!("Moved verified file to final location: {}", final_path.display());
    Ok(final_path.to_path_buf())
}
