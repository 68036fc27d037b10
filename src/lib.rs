//! # catalog-extractor
//!
//! Turn a technical product catalog PDF into Markdown plus per-SKU JSON
//! records, one resumable page chunk at a time.
//!
//! ## Job lifecycle
//!
//! ```text
//! plan ─┬─ 1. Input    resolve local file or download from URL
//!       ├─ 2. Map      table of contents → sections
//!       ├─ 3. Slice    sections → chunk PDFs + raw text dumps
//!       └─ 4. State    state.json, every chunk PENDING
//!
//! run ──┬─ claim next chunk (locked read-modify-write)
//!       ├─ convert     page images, crops, structural export
//!       ├─ skus        heuristic rows from technical tables
//!       ├─ synthesize  vision model per page → catalog.md, sku.jsonl
//!       └─ finish      COMPLETED / SYNTHESIZE / FAILED
//! ```
//!
//! Every state transition goes through [`StateStore`], so a job directory can
//! be resumed after a crash or shared between several runner processes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use catalog_extractor::{plan_job, runner, PlanConfig, RunConfig, Runner};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let job = Path::new("jobs/xtra-guard");
//!     plan_job("catalog.pdf", job, &PlanConfig::default()).await?;
//!
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / ...
//!     let config = RunConfig::default();
//!     let synthesizer = runner::build_synthesizer(&config)?;
//!     let converter = runner::build_converter(Default::default(), None, config.image_scale);
//!     let summary = Runner::new(job, converter, Some(synthesizer), config).run().await?;
//!     eprintln!("{} chunk(s) completed", summary.completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `catalog-extractor` binary (clap + indicatif + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod input;
pub mod journal;
pub mod mapper;
pub mod pdf;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod state;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PlanConfig, PlanConfigBuilder, RunConfig, RunConfigBuilder, SynthesisMode};
pub use error::{CatalogError, ChunkError};
pub use mapper::map_catalog;
pub use pipeline::convert::{ConverterKind, DocumentConverter, DoclingConverter, PdfiumConverter};
pub use pipeline::skus::SkuRecord;
pub use pipeline::synthesize::{LlmSynthesizer, PageRequest, PageSynthesizer, RawCompletion, SynthesisError};
pub use planner::plan_job;
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use runner::{RunSummary, Runner};
pub use state::{CatalogStructure, Chunk, ChunkStatus, JobState, Section, StateStore};
