//! Progress-callback trait for runner events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::RunConfigBuilder::progress_callback`] to receive events as
//! the runner claims chunks, walks the pipeline steps and synthesizes pages.
//! The CLI renders them with a spinner; library callers can forward them
//! anywhere.
//!
//! # Example
//!
//! ```rust
//! use catalog_extractor::{ChunkStatus, RunConfig, RunProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl RunProgressCallback for Counter {
//!     fn on_chunk_finished(&self, _start: usize, _end: usize, _status: ChunkStatus, _ms: u64) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = RunConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::state::ChunkStatus;
use std::sync::Arc;

/// Called by the runner as it processes chunks.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait RunProgressCallback: Send + Sync {
    /// A chunk was claimed and marked `IN_PROGRESS`.
    fn on_chunk_claimed(&self, start: usize, end: usize, previous: ChunkStatus) {
        let _ = (start, end, previous);
    }

    /// A pipeline step began (`step` is 1-based out of `total`).
    fn on_step(&self, step: usize, total: usize, label: &str) {
        let _ = (step, total, label);
    }

    /// One page went through the model.
    fn on_page_synthesized(&self, page: usize, skus: usize, input_tokens: usize, output_tokens: usize) {
        let _ = (page, skus, input_tokens, output_tokens);
    }

    /// The chunk reached its post-run status.
    fn on_chunk_finished(&self, start: usize, end: usize, status: ChunkStatus, elapsed_ms: u64) {
        let _ = (start, end, status, elapsed_ms);
    }

    /// The run loop stopped after `processed` chunks.
    fn on_run_complete(&self, processed: usize) {
        let _ = processed;
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RunConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;
