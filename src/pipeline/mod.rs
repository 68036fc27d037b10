//! Per-chunk pipeline stages.
//!
//! ```text
//! chunk.pdf ──▶ convert ──▶ skus ──▶ synthesize ──▶ postprocess
//!             (pdfium /    (table    (vision model,  (markdown
//!              docling)    heuristic) retry/backoff)  cleanup)
//! ```
//!
//! 1. [`convert`]: page images, picture crops, provenance map and the
//!    structural export (`metadata.json`, a [`document::DoclingDocument`])
//! 2. [`skus`]: heuristic product rows from technical tables
//! 3. [`synthesize`]: one model call per page; [`encode`] prepares the image
//!    and [`postprocess`] cleans the returned Markdown
//!
//! Stages communicate only through files in the chunk directory, so a run
//! in `skip` mode can stop after stage 2 and a later `only` run picks up
//! from there.

pub mod convert;
pub mod document;
pub mod encode;
pub mod postprocess;
pub mod skus;
pub mod synthesize;

/// Heuristic SKU records written by [`skus::run_sku_extraction`].
pub const SKU_INTERMEDIATE: &str = "sku_intermediate.jsonl";
/// Synthesized Markdown.
pub const CATALOG_MD: &str = "catalog.md";
/// Synthesized SKU records, one JSON object per line.
pub const SKU_JSONL: &str = "sku.jsonl";
/// Token accounting for the last synthesis of the chunk.
pub const TOKEN_USAGE: &str = "token_usage.json";
