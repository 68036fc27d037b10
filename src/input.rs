//! Input resolution: turn the `plan` argument into a local PDF path.
//!
//! A local path is checked for existence, read permission and the `%PDF`
//! magic bytes. An HTTP(S) URL is downloaded to `<job_dir>/source.pdf`, so the
//! job keeps its own copy of the catalog and the paths in `state.json` stay
//! valid after the process exits.

use crate::error::CatalogError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// File name used for downloaded catalogs inside the job directory.
pub const DOWNLOADED_SOURCE: &str = "source.pdf";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a local, absolute PDF path.
pub async fn resolve_input(input: &str, job_dir: &Path, timeout_secs: u64) -> Result<PathBuf, CatalogError> {
    if is_url(input) {
        download_url(input, &job_dir.join(DOWNLOADED_SOURCE), timeout_secs).await
    } else {
        resolve_local(Path::new(input))
    }
}

/// Validate a local file and return its canonical path.
pub fn resolve_local(path: &Path) -> Result<PathBuf, CatalogError> {
    if !path.exists() {
        return Err(CatalogError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    match std::fs::File::open(path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(CatalogError::NotAPdf {
                    path: path.to_path_buf(),
                    magic,
                });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(CatalogError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(CatalogError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    }

    let resolved = path
        .canonicalize()
        .map_err(|e| CatalogError::io(path, e))?;
    debug!("Resolved local PDF: {}", resolved.display());
    Ok(resolved)
}

async fn download_url(url: &str, dest: &Path, timeout_secs: u64) -> Result<PathBuf, CatalogError> {
    info!("Downloading catalog from: {}", url);

    let failed = |reason: String| CatalogError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            CatalogError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    if bytes.len() >= 4 && &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(CatalogError::NotAPdf {
            path: dest.to_path_buf(),
            magic,
        });
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CatalogError::io(parent, e))?;
    }
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| CatalogError::io(dest, e))?;

    info!("Downloaded {} bytes to {}", bytes.len(), dest.display());
    resolve_local(dest)
}
