//! The chunk runner: claim → pipeline → finish, until nothing is eligible.
//!
//! ## State machine
//!
//! ```text
//! PENDING ──claim──▶ IN_PROGRESS ──▶ SYNTHESIZE   (skip mode)
//!                                ├─▶ COMPLETED
//!                                └─▶ FAILED
//! SYNTHESIZE ──claim──▶ IN_PROGRESS ──▶ COMPLETED | FAILED
//! ```
//!
//! Claim and finish are each one locked read-modify-write of `state.json`
//! through [`StateStore`], so several runner processes can share a job
//! directory. Nothing about a chunk is kept in memory between the two; a
//! runner that crashes mid-chunk leaves it `IN_PROGRESS` for an operator to
//! inspect.

use crate::config::{RunConfig, SynthesisMode};
use crate::error::{CatalogError, ChunkError};
use crate::pipeline::convert::{ConverterKind, DocumentConverter, DoclingConverter, PdfiumConverter};
use crate::pipeline::skus::run_sku_extraction;
use crate::pipeline::synthesize::{synthesize_chunk, LlmSynthesizer, PageSynthesizer};
use crate::pipeline::SKU_INTERMEDIATE;
use crate::state::{ChunkStatus, ClaimedChunk, StateStore};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Model requested when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Counts from one [`Runner::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    /// Converted in `skip` mode and left as SYNTHESIZE.
    pub deferred: usize,
    pub failed: usize,
}

/// Drives chunks of one job through the pipeline.
pub struct Runner {
    store: StateStore,
    converter: Arc<dyn DocumentConverter>,
    synthesizer: Option<Arc<dyn PageSynthesizer>>,
    config: RunConfig,
}

impl Runner {
    /// `synthesizer` may be `None` only in [`SynthesisMode::Skip`].
    pub fn new(
        job_dir: impl Into<PathBuf>,
        converter: Arc<dyn DocumentConverter>,
        synthesizer: Option<Arc<dyn PageSynthesizer>>,
        config: RunConfig,
    ) -> Self {
        let store = StateStore::new(job_dir)
            .with_lock_timeout(Duration::from_secs(config.lock_timeout_secs))
            .with_stale_after(Duration::from_secs(config.stale_lock_secs));
        Self {
            store,
            converter,
            synthesizer,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Process eligible chunks until none is left (or one, with `once`).
    ///
    /// Chunk failures are recorded and skipped over; only state-store and
    /// configuration problems end the run with an error.
    pub async fn run(&self) -> Result<RunSummary, CatalogError> {
        // Fail fast on a missing or corrupt state file.
        let state = self.store.load()?;
        if let Some(index) = self.config.section {
            if index >= state.sections.len() {
                return Err(CatalogError::InvalidConfig(format!(
                    "Section {index} does not exist (job has {} section(s))",
                    state.sections.len()
                )));
            }
        }
        if self.config.mode.needs_model() && self.synthesizer.is_none() {
            return Err(CatalogError::ProviderNotConfigured {
                provider: "none".into(),
                hint: format!(
                    "Synthesis mode '{}' calls the model. Configure a provider or run with --synthesis skip.",
                    self.config.mode
                ),
            });
        }

        info!(
            "Running job {} (mode {}, {} chunk(s))",
            self.store.job_dir().display(),
            self.config.mode,
            state.total_chunks()
        );

        let mut summary = RunSummary::default();
        loop {
            let Some(claimed) = self.claim().await? else {
                debug!("No eligible chunk left");
                break;
            };
            let started = Instant::now();
            let chunk = &claimed.chunk;
            info!(
                "Chunk {}-{} of '{}' (was {})",
                chunk.start, chunk.end, claimed.section_name, claimed.previous
            );
            if let Some(ref cb) = self.config.progress_callback {
                cb.on_chunk_claimed(chunk.start, chunk.end, claimed.previous);
            }

            let (status, error) = match self.process(&claimed).await {
                Ok(status) => (status, None),
                Err(e) => {
                    warn!("Chunk {}-{} failed: {}", chunk.start, chunk.end, e);
                    (ChunkStatus::Failed, Some(e.to_string()))
                }
            };
            self.finish(chunk.start, chunk.end, status, error).await?;

            summary.processed += 1;
            match status {
                ChunkStatus::Completed => summary.completed += 1,
                ChunkStatus::Synthesize => summary.deferred += 1,
                _ => summary.failed += 1,
            }
            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!("Chunk {}-{} → {} in {}ms", chunk.start, chunk.end, status, elapsed_ms);
            if let Some(ref cb) = self.config.progress_callback {
                cb.on_chunk_finished(chunk.start, chunk.end, status, elapsed_ms);
            }

            if self.config.once {
                break;
            }
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(summary.processed);
        }
        Ok(summary)
    }

    async fn claim(&self) -> Result<Option<ClaimedChunk>, CatalogError> {
        let store = self.store.clone();
        let mode = self.config.mode;
        let section = self.config.section;
        tokio::task::spawn_blocking(move || store.claim_next(mode, section))
            .await
            .map_err(|e| CatalogError::Internal(format!("claim task panicked: {e}")))?
    }

    async fn finish(
        &self,
        start: usize,
        end: usize,
        status: ChunkStatus,
        error: Option<String>,
    ) -> Result<bool, CatalogError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.finish(start, end, status, error))
            .await
            .map_err(|e| CatalogError::Internal(format!("finish task panicked: {e}")))?
    }

    /// Run the pipeline steps the chunk's previous status calls for.
    async fn process(&self, claimed: &ClaimedChunk) -> Result<ChunkStatus, ChunkError> {
        let chunk = &claimed.chunk;
        if !chunk.input_file.is_file() {
            return Err(ChunkError::InputMissing {
                path: chunk.input_file.clone(),
            });
        }

        if claimed.previous == ChunkStatus::Synthesize {
            self.step(1, 1, "synthesize");
            self.synthesize(&chunk.working_dir).await?;
            return Ok(ChunkStatus::Completed);
        }

        let total = if self.config.mode == SynthesisMode::Skip { 2 } else { 3 };
        let offset = chunk.page_offset();

        self.step(1, total, "convert");
        let artifacts = self
            .converter
            .convert(&chunk.input_file, &chunk.working_dir, offset)
            .await?;
        debug!(
            "{} produced {} page image(s), {} crop(s)",
            self.converter.name(),
            artifacts.page_images.len(),
            artifacts.provenance.len()
        );

        self.step(2, total, "extract SKUs");
        run_sku_extraction(&artifacts.metadata, &chunk.working_dir.join(SKU_INTERMEDIATE), offset).await?;

        if self.config.mode == SynthesisMode::Skip {
            return Ok(ChunkStatus::Synthesize);
        }

        self.step(3, total, "synthesize");
        self.synthesize(&chunk.working_dir).await?;
        Ok(ChunkStatus::Completed)
    }

    async fn synthesize(&self, chunk_dir: &Path) -> Result<(), ChunkError> {
        let synthesizer = self.synthesizer.as_deref().ok_or_else(|| ChunkError::SynthesisFailed {
            page: 0,
            attempts: 0,
            detail: "no model provider configured".into(),
        })?;
        synthesize_chunk(chunk_dir, synthesizer, &self.config).await?;
        Ok(())
    }

    fn step(&self, step: usize, total: usize, label: &str) {
        debug!("Step {step}/{total}: {label}");
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_step(step, total, label);
        }
    }
}

/// Status report of the job in `job_dir`.
pub fn job_report(job_dir: &Path) -> Result<String, CatalogError> {
    Ok(StateStore::new(job_dir).load()?.report())
}

/// Build the converter selected on the command line.
pub fn build_converter(kind: ConverterKind, docling_bin: Option<&Path>, scale: f32) -> Arc<dyn DocumentConverter> {
    match kind {
        ConverterKind::Pdfium => Arc::new(PdfiumConverter::new(scale)),
        ConverterKind::Docling => Arc::new(DoclingConverter::new(
            docling_bin.unwrap_or_else(|| Path::new("docling")),
            scale,
        )),
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, CatalogError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| CatalogError::ProviderNotConfigured {
        provider: provider_name.to_string(),
        hint: format!("{e}"),
    })
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Resolve the model provider and the model label to report, most specific first:
///
/// 1. a pre-built `config.provider`
/// 2. `config.provider_name` (+ `config.model`, default [`DEFAULT_MODEL`])
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set
/// 4. a Gemini key (`GEMINI_API_KEY` / `GOOGLE_API_KEY`) → Gemini
/// 5. whatever `ProviderFactory::from_env` detects
pub fn resolve_provider(config: &RunConfig) -> Result<(Arc<dyn LLMProvider>, String), CatalogError> {
    let model = config.model.clone();

    if let Some(ref provider) = config.provider {
        let label = model.unwrap_or_else(|| "custom".to_string());
        return Ok((Arc::clone(provider), label));
    }

    if let Some(ref name) = config.provider_name {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        return Ok((create_vision_provider(name, &model)?, model));
    }

    if let (Some(provider), Some(env_model)) = (non_empty_env("EDGEQUAKE_LLM_PROVIDER"), non_empty_env("EDGEQUAKE_MODEL")) {
        let model = model.unwrap_or(env_model);
        return Ok((create_vision_provider(&provider, &model)?, model));
    }

    if non_empty_env("GEMINI_API_KEY").is_some() || non_empty_env("GOOGLE_API_KEY").is_some() {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        return Ok((create_vision_provider("gemini", &model)?, model));
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| CatalogError::ProviderNotConfigured {
        provider: "auto".to_string(),
        hint: format!(
            "No model provider could be detected from the environment.\n\
             Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, or pass --provider.\n\
             Error: {e}"
        ),
    })?;
    Ok((llm, model.unwrap_or_else(|| "auto".to_string())))
}

/// [`resolve_provider`] wrapped as a [`PageSynthesizer`].
pub fn build_synthesizer(config: &RunConfig) -> Result<Arc<dyn PageSynthesizer>, CatalogError> {
    let (provider, model) = resolve_provider(config)?;
    info!("Using model {model}");
    Ok(Arc::new(LlmSynthesizer::new(provider, model, config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_selection() {
        assert_eq!(build_converter(ConverterKind::Pdfium, None, 2.0).name(), "pdfium");
        let docling = build_converter(ConverterKind::Docling, Some(Path::new("/opt/docling")), 2.0);
        assert_eq!(docling.name(), "docling");
    }

    #[test]
    fn report_on_missing_job_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = job_report(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::StateNotFound { .. }));
    }

    #[tokio::test]
    async fn run_without_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::builder().mode(SynthesisMode::Skip).build().unwrap();
        let runner = Runner::new(dir.path(), build_converter(ConverterKind::Pdfium, None, 1.0), None, config);
        assert!(matches!(runner.run().await, Err(CatalogError::StateNotFound { .. })));
    }
}
