//! Error types for the catalog-extractor library.
//!
//! Two error types mirror the two places a job can break:
//!
//! * [`CatalogError`] (**fatal**): the command cannot proceed at all (missing
//!   input PDF, missing or corrupt `state.json`, provider not configured).
//!   Returned as `Err(CatalogError)` from [`crate::planner::plan_job`],
//!   [`crate::runner::Runner::run`] and the [`crate::state::StateStore`].
//!
//! * [`ChunkError`] (**per chunk**): one chunk failed (converter crashed,
//!   model returned garbage) but the job as a whole is fine. The runner
//!   records it on the chunk, marks the chunk `FAILED` and moves on.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the catalog-extractor library.
#[derive(Debug, Error)]
pub enum CatalogError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// The PDF opened fine but has no pages to plan.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    /// Slicing or text extraction failed for a chunk while planning.
    #[error("Failed to slice pages {start}-{end}: {detail}")]
    SliceFailed {
        start: usize,
        end: usize,
        detail: String,
    },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium for your platform, or set PDFIUM_LIB_PATH=/path/to/libpdfium\n\
to point at an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Job state errors ──────────────────────────────────────────────────
    /// No `state.json` in the job directory.
    #[error("Job state not found at '{path}'\nRun `catalog-extractor plan` first.")]
    StateNotFound { path: PathBuf },

    /// `state.json` exists but cannot be parsed.
    #[error("Job state '{path}' is corrupt: {detail}")]
    StateCorrupt { path: PathBuf, detail: String },

    /// Another process held the state lock for too long.
    #[error("Timed out after {waited_secs}s waiting for lock '{path}'\nIs another runner active on this job?")]
    StateLocked { path: PathBuf, waited_secs: u64 },

    /// `plan` would overwrite an existing job.
    #[error("A job already exists at '{path}'\nPass --force to re-plan and discard its progress.")]
    JobAlreadyExists { path: PathBuf },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Reading or writing a job file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CatalogError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A failure confined to a single chunk.
///
/// The message ends up in the chunk's `error` field in `state.json`, so the
/// variants carry plain strings rather than source errors.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// The sliced chunk PDF recorded in the state is gone.
    #[error("Chunk input PDF not found at '{path}'")]
    InputMissing { path: PathBuf },

    /// The document converter failed.
    #[error("Document conversion failed: {detail}")]
    ConversionFailed { detail: String },

    /// The converter ran but its structural export could not be read.
    #[error("Converter output '{path}' is unreadable: {detail}")]
    InvalidExport { path: PathBuf, detail: String },

    /// The model call kept failing.
    #[error("Page {page}: synthesis failed after {attempts} attempt(s): {detail}")]
    SynthesisFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The model answered, but not with the expected JSON object.
    #[error("Page {page}: model output is not valid JSON: {detail}\nResponse starts with: {snippet}")]
    UnparseableResponse {
        page: usize,
        detail: String,
        snippet: String,
    },

    /// A chunk output could not be read or written.
    #[error("I/O error on '{path}': {detail}")]
    Io { path: PathBuf, detail: String },
}

impl ChunkError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: impl std::fmt::Display) -> Self {
        ChunkError::Io {
            path: path.into(),
            detail: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_not_found_suggests_plan() {
        let e = CatalogError::StateNotFound {
            path: PathBuf::from("/tmp/job/state.json"),
        };
        let msg = e.to_string();
        assert!(msg.contains("/tmp/job/state.json"), "got: {msg}");
        assert!(msg.contains("plan"), "got: {msg}");
    }

    #[test]
    fn state_locked_display() {
        let e = CatalogError::StateLocked {
            path: PathBuf::from("state.json.lock"),
            waited_secs: 30,
        };
        assert!(e.to_string().contains("30s"));
    }

    #[test]
    fn synthesis_failed_display() {
        let e = ChunkError::SynthesisFailed {
            page: 9,
            attempts: 5,
            detail: "429 Too Many Requests".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Page 9"));
        assert!(msg.contains("5 attempt"));
    }

    #[test]
    fn chunk_error_roundtrips_through_json() {
        let e = ChunkError::InputMissing {
            path: PathBuf::from("runs/8_12/8_12.pdf"),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: ChunkError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
