//! Configuration types for planning and running catalog extraction jobs.
//!
//! Planning is controlled by [`PlanConfig`], running by [`RunConfig`]; both
//! are built through a builder that validates at `build()`. Defaults match
//! what works for a typical cable/wire catalog: five-page chunks, a five-page
//! table-of-contents scan, and a Gemini-flash-class model with conservative
//! retry pacing.

use crate::error::CatalogError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// ── Plan configuration ───────────────────────────────────────────────────

/// Configuration for [`crate::planner::plan_job`].
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Maximum pages per chunk. Default: 5.
    pub chunk_size: usize,

    /// How many leading pages are scanned for the table of contents. Default: 5.
    pub toc_scan_pages: usize,

    /// TOC entries pointing below this page are treated as running headers
    /// and ignored. Default: 5.
    pub min_section_page: usize,

    /// TOC entries with longer names are treated as prose. Default: 100.
    pub max_section_name_len: usize,

    /// Re-plan over an existing `state.json`. Default: false.
    pub force: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            toc_scan_pages: 5,
            min_section_page: 5,
            max_section_name_len: 100,
            force: false,
            download_timeout_secs: 120,
        }
    }
}

impl PlanConfig {
    /// Create a new builder for `PlanConfig`.
    pub fn builder() -> PlanConfigBuilder {
        PlanConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PlanConfig`].
#[derive(Debug)]
pub struct PlanConfigBuilder {
    config: PlanConfig,
}

impl PlanConfigBuilder {
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n;
        self
    }

    pub fn toc_scan_pages(mut self, n: usize) -> Self {
        self.config.toc_scan_pages = n;
        self
    }

    pub fn min_section_page(mut self, page: usize) -> Self {
        self.config.min_section_page = page;
        self
    }

    pub fn max_section_name_len(mut self, n: usize) -> Self {
        self.config.max_section_name_len = n;
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PlanConfig, CatalogError> {
        if self.config.chunk_size == 0 {
            return Err(CatalogError::InvalidConfig(
                "Chunk size must be ≥ 1".into(),
            ));
        }
        if self.config.toc_scan_pages == 0 {
            return Err(CatalogError::InvalidConfig(
                "TOC scan must cover at least one page".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Run configuration ────────────────────────────────────────────────────

/// Configuration for [`crate::runner::Runner`].
#[derive(Clone)]
pub struct RunConfig {
    /// Which chunks the runner picks up. Default: [`SynthesisMode::Include`].
    pub mode: SynthesisMode,

    /// Restrict the run to one section (0-based index). Default: all sections.
    pub section: Option<usize>,

    /// Process a single chunk and stop. Default: false.
    pub once: bool,

    /// Render scale used for page images (2.0 ≈ 144 DPI). Default: 2.0.
    pub image_scale: f32,

    /// LLM model identifier, e.g. "gemini-2.0-flash".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 8192.
    ///
    /// A dense spec-table page produces both Markdown and a JSON record per
    /// row, which easily exceeds 4 096 tokens.
    pub max_tokens: usize,

    /// Total attempts per page, first call included. Default: 5.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds; doubles per attempt. Default: 4000.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single retry delay in milliseconds. Default: 60000.
    pub max_backoff_ms: u64,

    /// Factor applied to page images before upload. Default: 0.5.
    ///
    /// Pages are rendered at 2× for crop quality; halving them again keeps
    /// per-page input tokens near a 1× render.
    pub image_downscale: f32,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// How long to wait for the state lock in seconds. Default: 30.
    pub lock_timeout_secs: u64,

    /// A lock file older than this is considered abandoned. Default: 600.
    pub stale_lock_secs: u64,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: SynthesisMode::default(),
            section: None,
            once: false,
            image_scale: 2.0,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            max_attempts: 5,
            retry_backoff_ms: 4000,
            max_backoff_ms: 60_000,
            image_downscale: 0.5,
            system_prompt: None,
            lock_timeout_secs: 30,
            stale_lock_secs: 600,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("mode", &self.mode)
            .field("section", &self.section)
            .field("once", &self.once)
            .field("image_scale", &self.image_scale)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("image_downscale", &self.image_downscale)
            .field("progress_callback", &self.progress_callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl RunConfig {
    /// Create a new builder for `RunConfig`.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder {
            config: Self::default(),
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }
}

/// Builder for [`RunConfig`].
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn mode(mut self, mode: SynthesisMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn section(mut self, index: Option<usize>) -> Self {
        self.config.section = index;
        self
    }

    pub fn once(mut self, v: bool) -> Self {
        self.config.once = v;
        self
    }

    pub fn image_scale(mut self, scale: f32) -> Self {
        self.config.image_scale = scale.clamp(0.5, 4.0);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn image_downscale(mut self, factor: f32) -> Self {
        self.config.image_downscale = factor;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn lock_timeout_secs(mut self, secs: u64) -> Self {
        self.config.lock_timeout_secs = secs;
        self
    }

    pub fn stale_lock_secs(mut self, secs: u64) -> Self {
        self.config.stale_lock_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RunConfig, CatalogError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(CatalogError::InvalidConfig(
                "Max attempts must be ≥ 1".into(),
            ));
        }
        if !(c.image_downscale > 0.0 && c.image_downscale <= 1.0) {
            return Err(CatalogError::InvalidConfig(format!(
                "Image downscale must be in (0, 1], got {}",
                c.image_downscale
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which part of the chunk pipeline a run performs.
///
/// | Mode | Picks up | PENDING chunks end as |
/// |------|----------|-----------------------|
/// | `include` | PENDING first, then SYNTHESIZE | COMPLETED |
/// | `skip`    | PENDING only                   | SYNTHESIZE |
/// | `only`    | SYNTHESIZE only                | unchanged |
///
/// Splitting lets the slow local conversion run ahead (e.g. overnight)
/// while the model calls, which need an API key and cost money, run later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisMode {
    /// Convert pending chunks and synthesize everything. (default)
    #[default]
    Include,
    /// Convert pending chunks but defer synthesis.
    Skip,
    /// Only synthesize chunks whose conversion already ran.
    Only,
}

impl SynthesisMode {
    /// Whether chunks in this mode ever reach the model.
    pub fn needs_model(self) -> bool {
        !matches!(self, SynthesisMode::Skip)
    }
}

impl FromStr for SynthesisMode {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "include" => Ok(SynthesisMode::Include),
            "skip" => Ok(SynthesisMode::Skip),
            "only" => Ok(SynthesisMode::Only),
            other => Err(CatalogError::InvalidConfig(format!(
                "Unknown synthesis mode '{other}' (expected include, skip or only)"
            ))),
        }
    }
}

impl fmt::Display for SynthesisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SynthesisMode::Include => "include",
            SynthesisMode::Skip => "skip",
            SynthesisMode::Only => "only",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_rejects_zero_chunk_size() {
        assert!(PlanConfig::builder().chunk_size(0).build().is_err());
        assert_eq!(PlanConfig::builder().build().unwrap().chunk_size, 5);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.backoff_ms(1), 4000);
        assert_eq!(cfg.backoff_ms(2), 8000);
        assert_eq!(cfg.backoff_ms(3), 16000);
        assert_eq!(cfg.backoff_ms(10), 60_000);
    }

    #[test]
    fn run_rejects_zero_attempts() {
        assert!(RunConfig::builder().max_attempts(0).build().is_err());
    }

    #[test]
    fn run_rejects_bad_downscale() {
        assert!(RunConfig::builder().image_downscale(0.0).build().is_err());
        assert!(RunConfig::builder().image_downscale(1.5).build().is_err());
        assert!(RunConfig::builder().image_downscale(1.0).build().is_ok());
    }

    #[test]
    fn synthesis_mode_parses() {
        assert_eq!("include".parse::<SynthesisMode>().unwrap(), SynthesisMode::Include);
        assert_eq!(" SKIP ".parse::<SynthesisMode>().unwrap(), SynthesisMode::Skip);
        assert_eq!("only".parse::<SynthesisMode>().unwrap(), SynthesisMode::Only);
        assert!("later".parse::<SynthesisMode>().is_err());
        assert!(!SynthesisMode::Skip.needs_model());
        assert!(SynthesisMode::Only.needs_model());
    }
}
