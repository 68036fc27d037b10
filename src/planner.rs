//! Job planner: map the catalog, slice it into chunks, write the job state.
//!
//! ```text
//! <pdf|url> ─▶ resolve ─▶ map sections ─▶ structure.json
//!                              │
//!                              ▼  per section, per chunk of ≤ chunk_size pages
//!                  runs/<s>_<e>/<s>_<e>.pdf  +  runs/<s>_<e>/extract.md
//!                              │
//!                              ▼
//!                  state.json (written once, atomically, at the end)
//! ```
//!
//! Because `state.json` only appears after every chunk has been sliced, an
//! interrupted plan leaves no job behind and can simply be re-run.

use crate::config::PlanConfig;
use crate::error::CatalogError;
use crate::input;
use crate::mapper;
use crate::pdf;
use crate::state::{
    chunk_slug, CatalogStructure, Chunk, ChunkStatus, JobState, SectionState, StateStore,
    STRUCTURE_FILE,
};
use std::path::Path;
use tracing::{debug, info};

/// Directory under the job dir that holds one sub-directory per chunk.
pub const RUNS_DIR: &str = "runs";

/// Name of the per-chunk raw text dump.
pub const TEXT_FILE: &str = "extract.md";

/// Split `start..=end` into consecutive ranges of at most `chunk_size` pages.
///
/// `chunk_size` of 0 is treated as 1.
pub fn partition_pages(start: usize, end: usize, chunk_size: usize) -> Vec<(usize, usize)> {
    let size = chunk_size.max(1);
    (start..=end)
        .step_by(size)
        .map(|s| (s, (s + size - 1).min(end)))
        .collect()
}

/// Lay out the chunk paths for a range inside `runs_dir`.
pub fn chunk_for_range(runs_dir: &Path, start: usize, end: usize) -> Chunk {
    let slug = chunk_slug(start, end);
    let working_dir = runs_dir.join(&slug);
    Chunk {
        start,
        end,
        status: ChunkStatus::Pending,
        input_file: working_dir.join(format!("{slug}.pdf")),
        text_file: working_dir.join(TEXT_FILE),
        working_dir,
        error: None,
        updated_at: None,
    }
}

/// Build the initial job state for a mapped catalog. Pure; touches no files.
pub fn build_job_state(structure: &CatalogStructure, job_dir: &Path, chunk_size: usize) -> JobState {
    let runs_dir = job_dir.join(RUNS_DIR);
    let sections = structure
        .sections
        .iter()
        .map(|section| SectionState {
            name: section.name.clone(),
            start_page: section.start_page,
            end_page: section.end_page,
            chunks: partition_pages(section.start_page, section.end_page, chunk_size)
                .into_iter()
                .map(|(s, e)| chunk_for_range(&runs_dir, s, e))
                .collect(),
        })
        .collect();

    JobState {
        catalog_source: structure.source.clone(),
        working_dir: job_dir.to_path_buf(),
        status: "ready".to_string(),
        sections,
        executions: Vec::new(),
    }
}

/// Render the `extract.md` text dump for pages starting at `first_page`.
pub fn render_text_dump(source: &Path, first_page: usize, texts: &[String]) -> String {
    let mut out = format!("# Raw Text Dump\nSource: {}\n\n", source.display());
    for (i, text) in texts.iter().enumerate() {
        out.push_str(&format!("## Page {}\n\n{}\n\n---\n\n", first_page + i, text.trim_end()));
    }
    out
}

/// Plan a new job for `input` (path or URL) in `job_dir`.
pub async fn plan_job(input: &str, job_dir: &Path, config: &PlanConfig) -> Result<JobState, CatalogError> {
    tokio::fs::create_dir_all(job_dir)
        .await
        .map_err(|e| CatalogError::io(job_dir, e))?;
    let job_dir = job_dir
        .canonicalize()
        .map_err(|e| CatalogError::io(job_dir, e))?;

    let store = StateStore::new(&job_dir);
    if store.exists() && !config.force {
        return Err(CatalogError::JobAlreadyExists {
            path: store.state_path().to_path_buf(),
        });
    }

    let pdf_path = input::resolve_input(input, &job_dir, config.download_timeout_secs).await?;
    info!("Planning job for {} in {}", pdf_path.display(), job_dir.display());

    let structure = mapper::map_catalog(&pdf_path, config).await?;
    write_json(&job_dir.join(STRUCTURE_FILE), &structure).await?;

    let runs_dir = job_dir.join(RUNS_DIR);
    if config.force && runs_dir.exists() {
        info!("Discarding previous chunk outputs in {}", runs_dir.display());
        tokio::fs::remove_dir_all(&runs_dir)
            .await
            .map_err(|e| CatalogError::io(&runs_dir, e))?;
    }

    let state = build_job_state(&structure, &job_dir, config.chunk_size);
    for chunk in state.chunks() {
        prepare_chunk(&pdf_path, chunk).await?;
    }

    store.create(&state, config.force)?;
    info!(
        "Job planned: {} section(s), {} chunk(s) → {}",
        state.sections.len(),
        state.total_chunks(),
        store.state_path().display()
    );
    Ok(state)
}

async fn prepare_chunk(pdf_path: &Path, chunk: &Chunk) -> Result<(), CatalogError> {
    tokio::fs::create_dir_all(&chunk.working_dir)
        .await
        .map_err(|e| CatalogError::io(&chunk.working_dir, e))?;

    pdf::slice_pages(pdf_path, chunk.start, chunk.end, &chunk.input_file).await?;

    let texts = pdf::page_texts(pdf_path, chunk.start, chunk.end).await?;
    let dump = render_text_dump(&chunk.input_file, chunk.start, &texts);
    tokio::fs::write(&chunk.text_file, dump)
        .await
        .map_err(|e| CatalogError::io(&chunk.text_file, e))?;

    debug!("Prepared chunk {}", chunk.slug());
    Ok(())
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), CatalogError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CatalogError::Internal(format!("serialise {}: {}", path.display(), e)))?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| CatalogError::io(path, e))
}
