//! Per-page synthesis: page image + context → cleaned Markdown and SKU JSON.
//!
//! The model sits behind [`PageSynthesizer`] so the chunk loop can be
//! exercised without network access. [`LlmSynthesizer`] is the production
//! implementation over an `edgequake-llm` provider.
//!
//! ## Retry Strategy
//!
//! Errors are classified per call. Rate limits, 5xx responses, timeouts and
//! connection failures are [`SynthesisError::Transient`] and retried with
//! exponential backoff ([`RunConfig::backoff_ms`]); authentication and
//! malformed-request errors are [`SynthesisError::Permanent`] and fail the
//! page at once. With the defaults the waits are 4 s → 8 s → 16 s → 32 s.

use super::convert::{read_provenance, ProvenanceEntry, IMAGES_DIR};
use super::encode::load_for_upload;
use super::postprocess::clean_markdown;
use super::skus::{read_jsonl, SkuRecord};
use super::{CATALOG_MD, SKU_INTERMEDIATE, SKU_JSONL, TOKEN_USAGE};
use crate::config::RunConfig;
use crate::error::ChunkError;
use crate::planner::TEXT_FILE;
use crate::prompts::{page_prompt, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Heading written once at the top of `catalog.md`.
pub const CATALOG_HEADER: &str = "# Product Catalog (Synthesized)\n\n";

/// Characters of a bad response kept in the error message.
const SNIPPET_LEN: usize = 500;

// ── Synthesizer seam ─────────────────────────────────────────────────────

/// One model call's worth of input.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Real catalog page number.
    pub page: usize,
    pub system_prompt: String,
    pub prompt: String,
    pub image: ImageData,
}

/// Raw model answer plus token accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCompletion {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Outcome classification of a single failed call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SynthesisError {
    /// Worth retrying: rate limit, server error, timeout, network.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help: bad credentials, rejected request.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Produces one page's synthesis from a prepared request.
#[async_trait]
pub trait PageSynthesizer: Send + Sync {
    /// Model label recorded in `token_usage.json`.
    fn model(&self) -> &str;

    async fn synthesize(&self, request: &PageRequest) -> Result<RawCompletion, SynthesisError>;
}

/// [`PageSynthesizer`] backed by an `edgequake-llm` provider.
pub struct LlmSynthesizer {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl LlmSynthesizer {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, config: &RunConfig) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PageSynthesizer for LlmSynthesizer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn synthesize(&self, request: &PageRequest) -> Result<RawCompletion, SynthesisError> {
        let messages = vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user_with_images(request.prompt.as_str(), vec![request.image.clone()]),
        ];
        let options = self.options();

        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => Ok(RawCompletion {
                text: response.content,
                input_tokens: response.prompt_tokens as usize,
                output_tokens: response.completion_tokens as usize,
            }),
            Err(e) => Err(classify_error(&e.to_string())),
        }
    }
}

/// Sort a provider error message into transient or permanent.
///
/// Anything not recognisably permanent is treated as transient, so an
/// unfamiliar failure costs a few retries rather than the chunk.
pub fn classify_error(message: &str) -> SynthesisError {
    const PERMANENT: [&str; 8] = [
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "invalid api key",
        "api key not valid",
        "400 bad request",
        "invalid_request",
    ];
    let lower = message.to_lowercase();
    if PERMANENT.iter().any(|m| lower.contains(m)) {
        SynthesisError::Permanent(message.to_string())
    } else {
        SynthesisError::Transient(message.to_string())
    }
}

/// Call `synthesizer` until it succeeds, a permanent error occurs, or
/// `config.max_attempts` calls have been made.
pub async fn call_with_retry(
    synthesizer: &dyn PageSynthesizer,
    request: &PageRequest,
    config: &RunConfig,
) -> Result<RawCompletion, ChunkError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let detail = match synthesizer.synthesize(request).await {
            Ok(done) => return Ok(done),
            Err(SynthesisError::Permanent(detail)) => {
                return Err(ChunkError::SynthesisFailed {
                    page: request.page,
                    attempts: attempt,
                    detail,
                })
            }
            Err(SynthesisError::Transient(detail)) => detail,
        };

        if attempt >= config.max_attempts {
            return Err(ChunkError::SynthesisFailed {
                page: request.page,
                attempts: attempt,
                detail,
            });
        }
        let backoff = config.backoff_ms(attempt);
        warn!(
            "Page {}: attempt {}/{} failed ({}); retrying in {}ms",
            request.page, attempt, config.max_attempts, detail, backoff
        );
        sleep(Duration::from_millis(backoff)).await;
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

/// The JSON envelope the model is asked to produce.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PageSynthesis {
    #[serde(default)]
    pub markdown_content: String,
    #[serde(default)]
    pub skus: Vec<serde_json::Value>,
}

/// Remove one leading ```` ```json ```` / ```` ``` ```` and one trailing ```` ``` ````.
pub fn strip_json_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse a model answer into [`PageSynthesis`].
pub fn parse_page_response(page: usize, text: &str) -> Result<PageSynthesis, ChunkError> {
    serde_json::from_str(strip_json_fences(text)).map_err(|e| ChunkError::UnparseableResponse {
        page,
        detail: e.to_string(),
        snippet: text.chars().take(SNIPPET_LEN).collect(),
    })
}

// ── Chunk inputs ─────────────────────────────────────────────────────────

static PAGE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^## Page (\d+)[ \t]*$").expect("valid regex"));
static PAGE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^page(\d+)\.png$").expect("valid regex"));

/// Split an `extract.md` dump into `page → text`.
pub fn parse_text_dump(dump: &str) -> BTreeMap<usize, String> {
    let dump = dump.replace("\r\n", "\n");
    let heads: Vec<(usize, usize, usize)> = PAGE_HEADING
        .captures_iter(&dump)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let page: usize = c[1].parse().ok()?;
            Some((page, whole.start(), whole.end()))
        })
        .collect();

    let mut map = BTreeMap::new();
    for (i, &(page, _, body_start)) in heads.iter().enumerate() {
        let body_end = heads.get(i + 1).map(|h| h.1).unwrap_or(dump.len());
        let body = dump[body_start..body_end].trim();
        let body = body.strip_suffix("---").unwrap_or(body).trim_end();
        map.insert(page, body.to_string());
    }
    map
}

/// Full-page images in `images_dir`, sorted by page number.
pub fn list_page_images(images_dir: &Path) -> Result<Vec<(usize, PathBuf)>, ChunkError> {
    let entries = std::fs::read_dir(images_dir).map_err(|e| ChunkError::io(images_dir, e))?;
    let mut pages: Vec<(usize, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let page: usize = PAGE_IMAGE.captures(&name)?[1].parse().ok()?;
            Some((page, entry.path()))
        })
        .collect();
    pages.sort_by_key(|(page, _)| *page);
    Ok(pages)
}

fn exported_image_names(images_dir: &Path) -> HashSet<String> {
    std::fs::read_dir(images_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Heuristic records reduced to what the prompt needs.
#[derive(Debug, Serialize)]
struct SkuHint<'a> {
    sku: Option<&'a str>,
    desc: &'a str,
    bbox: Option<&'a super::document::BoundingBox>,
}

fn sku_hints_json(records: &[&SkuRecord]) -> String {
    let hints: Vec<SkuHint<'_>> = records
        .iter()
        .map(|r| SkuHint {
            sku: r.sku.as_deref(),
            desc: &r.content,
            bbox: r.bbox.as_ref(),
        })
        .collect();
    serde_json::to_string_pretty(&hints).unwrap_or_else(|_| "[]".to_string())
}

fn provenance_json(entries: &[&ProvenanceEntry]) -> String {
    serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string())
}

// ── Chunk loop ───────────────────────────────────────────────────────────

/// Token accounting written to `token_usage.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub model: String,
    pub total_input: usize,
    pub total_output: usize,
    pub pages_processed: usize,
}

async fn append(path: &Path, text: &str) -> Result<(), ChunkError> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
        .map_err(|e| ChunkError::io(path, e))?;
    file.write_all(text.as_bytes())
        .await
        .map_err(|e| ChunkError::io(path, e))
}

/// Synthesize every page image of a converted chunk.
///
/// Writes `catalog.md`, `sku.jsonl` and `token_usage.json` into
/// `chunk_dir`. Outputs are appended page by page, so a failure part-way
/// leaves the pages already done on disk.
pub async fn synthesize_chunk(
    chunk_dir: &Path,
    synthesizer: &dyn PageSynthesizer,
    config: &RunConfig,
) -> Result<TokenUsage, ChunkError> {
    let images_dir = chunk_dir.join(IMAGES_DIR);
    let pages = list_page_images(&images_dir)?;
    let exported = exported_image_names(&images_dir);

    let text_path = chunk_dir.join(TEXT_FILE);
    let texts = match tokio::fs::read_to_string(&text_path).await {
        Ok(raw) => parse_text_dump(&raw),
        Err(e) => {
            warn!("No raw text at {} ({e}); continuing without", text_path.display());
            BTreeMap::new()
        }
    };

    let provenance = read_provenance(chunk_dir).await?;

    let sku_path = chunk_dir.join(SKU_INTERMEDIATE);
    let heuristic: Vec<SkuRecord> = if sku_path.exists() {
        read_jsonl(&sku_path).await?
    } else {
        warn!("No heuristic SKU records at {}", sku_path.display());
        Vec::new()
    };

    let catalog_path = chunk_dir.join(CATALOG_MD);
    let sku_out = chunk_dir.join(SKU_JSONL);
    tokio::fs::write(&catalog_path, CATALOG_HEADER)
        .await
        .map_err(|e| ChunkError::io(&catalog_path, e))?;
    tokio::fs::write(&sku_out, "")
        .await
        .map_err(|e| ChunkError::io(&sku_out, e))?;

    let system_prompt = config
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let mut usage = TokenUsage {
        model: synthesizer.model().to_string(),
        ..Default::default()
    };

    info!(
        "Synthesizing {} page(s) in {} with {}",
        pages.len(),
        chunk_dir.display(),
        usage.model
    );

    for (page, image_path) in pages {
        let started = Instant::now();
        let raw_text = texts.get(&page).map(String::as_str).unwrap_or("");
        let page_prov: Vec<&ProvenanceEntry> = provenance.iter().filter(|p| p.page_number == page).collect();
        let page_skus: Vec<&SkuRecord> = heuristic.iter().filter(|r| r.page_no == Some(page)).collect();
        let image_rel = format!("{IMAGES_DIR}/{}", super::convert::page_image_name(page));

        let factor = config.image_downscale;
        let load_path = image_path.clone();
        let image = tokio::task::spawn_blocking(move || load_for_upload(&load_path, factor))
            .await
            .map_err(|e| ChunkError::io(&image_path, e))?
            .map_err(|e| ChunkError::io(&image_path, e))?;

        let request = PageRequest {
            page,
            system_prompt: system_prompt.clone(),
            prompt: page_prompt(
                page,
                raw_text,
                &provenance_json(&page_prov),
                &sku_hints_json(&page_skus),
                &image_rel,
            ),
            image,
        };

        let completion = call_with_retry(synthesizer, &request, config).await?;
        let parsed = parse_page_response(page, &completion.text)?;

        let markdown = clean_markdown(&parsed.markdown_content, &exported);
        append(&catalog_path, &format!("{}\n\n---\n\n", markdown.trim_end())).await?;

        let mut lines = String::new();
        for sku in &parsed.skus {
            lines.push_str(&sku.to_string());
            lines.push('\n');
        }
        append(&sku_out, &lines).await?;

        usage.total_input += completion.input_tokens;
        usage.total_output += completion.output_tokens;
        usage.pages_processed += 1;

        debug!(
            "Page {}: {} SKU(s), {} in / {} out tokens, {:?}",
            page,
            parsed.skus.len(),
            completion.input_tokens,
            completion.output_tokens,
            started.elapsed()
        );
        if let Some(ref cb) = config.progress_callback {
            cb.on_page_synthesized(page, parsed.skus.len(), completion.input_tokens, completion.output_tokens);
        }
    }

    let usage_path = chunk_dir.join(TOKEN_USAGE);
    let json = serde_json::to_string_pretty(&usage).map_err(|e| ChunkError::io(&usage_path, e))?;
    tokio::fs::write(&usage_path, json)
        .await
        .map_err(|e| ChunkError::io(&usage_path, e))?;

    info!(
        "Token usage: {} page(s), {} in / {} out",
        usage.pages_processed, usage.total_input, usage.total_output
    );
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::convert::page_image_name;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted answers and records prompts.
    struct Scripted {
        answers: Mutex<Vec<Result<RawCompletion, SynthesisError>>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<RawCompletion, SynthesisError>>) -> Self {
            Self {
                answers: Mutex::new(answers),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSynthesizer for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn synthesize(&self, request: &PageRequest) -> Result<RawCompletion, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                return Err(SynthesisError::Permanent("script exhausted".into()));
            }
            answers.remove(0)
        }
    }

    fn ok(text: &str) -> Result<RawCompletion, SynthesisError> {
        Ok(RawCompletion {
            text: text.to_string(),
            input_tokens: 100,
            output_tokens: 20,
        })
    }

    fn fast_config() -> RunConfig {
        RunConfig::builder().retry_backoff_ms(1).max_backoff_ms(2).build().unwrap()
    }

    fn request(page: usize) -> PageRequest {
        PageRequest {
            page,
            system_prompt: "sys".into(),
            prompt: "p".into(),
            image: ImageData::new("AAAA", "image/png"),
        }
    }

    fn write_page(dir: &Path, page: usize) {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255])));
        img.save(dir.join(IMAGES_DIR).join(page_image_name(page))).unwrap();
    }

    #[test]
    fn classify_permanent_and_transient() {
        assert!(matches!(classify_error("HTTP 401 Unauthorized"), SynthesisError::Permanent(_)));
        assert!(matches!(classify_error("API key not valid. Please pass a valid API key."), SynthesisError::Permanent(_)));
        assert!(matches!(classify_error("429 Too Many Requests"), SynthesisError::Transient(_)));
        assert!(matches!(classify_error("503 Service Unavailable"), SynthesisError::Transient(_)));
        assert!(matches!(classify_error("operation timed out"), SynthesisError::Transient(_)));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let s = Scripted::new(vec![
            Err(SynthesisError::Transient("429".into())),
            Err(SynthesisError::Transient("503".into())),
            ok("{}"),
        ]);
        let out = call_with_retry(&s, &request(9), &fast_config()).await.unwrap();
        assert_eq!(out.input_tokens, 100);
        assert_eq!(s.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let s = Scripted::new(vec![Err(SynthesisError::Permanent("401".into())), ok("{}")]);
        let err = call_with_retry(&s, &request(9), &fast_config()).await.unwrap_err();
        assert_eq!(
            err,
            ChunkError::SynthesisFailed {
                page: 9,
                attempts: 1,
                detail: "401".into()
            }
        );
        assert_eq!(s.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let s = Scripted::new((0..10).map(|_| Err(SynthesisError::Transient("busy".into()))).collect());
        let config = RunConfig::builder()
            .max_attempts(3)
            .retry_backoff_ms(1)
            .max_backoff_ms(1)
            .build()
            .unwrap();
        let err = call_with_retry(&s, &request(4), &config).await.unwrap_err();
        assert!(matches!(err, ChunkError::SynthesisFailed { attempts: 3, .. }));
        assert_eq!(s.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fences_are_removed_before_parsing() {
        assert_eq!(strip_json_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_json_fences("  {} "), "{}");

        let parsed = parse_page_response(3, "```json\n{\"markdown_content\": \"# X\", \"skus\": [{\"sku\": \"5920\"}]}\n```").unwrap();
        assert_eq!(parsed.markdown_content, "# X");
        assert_eq!(parsed.skus.len(), 1);
    }

    #[test]
    fn unparseable_response_keeps_snippet() {
        let long = "not json ".repeat(200);
        match parse_page_response(7, &long).unwrap_err() {
            ChunkError::UnparseableResponse { page, snippet, .. } => {
                assert_eq!(page, 7);
                assert_eq!(snippet.chars().count(), SNIPPET_LEN);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn text_dump_splits_by_page() {
        let dump = "# Raw Text Dump\nSource: x.pdf\n\n## Page 6\n\nfirst page\n\n---\n\n## Page 7\n\nsecond\n\n---\n\n";
        let map = parse_text_dump(dump);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&6], "first page");
        assert_eq!(map[&7], "second");
    }

    #[test]
    fn page_images_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(IMAGES_DIR);
        std::fs::create_dir_all(&images).unwrap();
        for name in ["page10.png", "page9.png", "crop_page_9_1.png", "page11.png"] {
            std::fs::write(images.join(name), b"x").unwrap();
        }
        let pages: Vec<usize> = list_page_images(&images).unwrap().into_iter().map(|p| p.0).collect();
        assert_eq!(pages, vec![9, 10, 11]);
    }

    #[tokio::test]
    async fn chunk_outputs_are_written() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(IMAGES_DIR)).unwrap();
        write_page(dir.path(), 9);
        write_page(dir.path(), 10);
        std::fs::write(dir.path().join(TEXT_FILE), "## Page 9\n\nXtra-Guard 1\n\n---\n\n## Page 10\n\nXtra-Guard 2\n\n---\n\n").unwrap();

        let s = Scripted::new(vec![
            ok(r#"{"markdown_content": "![Page 9](images/page9.png)\n# Xtra-Guard 1\n![Fake](images/nope.png)", "skus": [{"sku": "5920"}, {"sku": "5921"}]}"#),
            ok(r##"```json
{"markdown_content": "# Xtra-Guard 2", "skus": []}
```"##),
        ]);
        let usage = synthesize_chunk(dir.path(), &s, &fast_config()).await.unwrap();
        assert_eq!(usage.pages_processed, 2);
        assert_eq!(usage.total_input, 200);
        assert_eq!(usage.model, "scripted");

        let catalog = std::fs::read_to_string(dir.path().join(CATALOG_MD)).unwrap();
        assert!(catalog.starts_with(CATALOG_HEADER));
        assert!(catalog.contains("![Page 9](images/page9.png)"));
        assert!(catalog.contains("*Fake*"));
        assert!(catalog.find("Xtra-Guard 1").unwrap() < catalog.find("Xtra-Guard 2").unwrap());
        assert_eq!(catalog.matches("\n---\n").count(), 2);

        let skus = std::fs::read_to_string(dir.path().join(SKU_JSONL)).unwrap();
        assert_eq!(skus.lines().count(), 2);

        let prompts = s.prompts.lock().unwrap();
        assert!(prompts[0].contains("PAGE 9"));
        assert!(prompts[0].contains("Xtra-Guard 1"));
        assert!(prompts[1].contains("Xtra-Guard 2"));

        let usage_json: TokenUsage =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(TOKEN_USAGE)).unwrap()).unwrap();
        assert_eq!(usage_json, usage);
    }

    #[tokio::test]
    async fn bad_json_aborts_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(IMAGES_DIR)).unwrap();
        write_page(dir.path(), 1);
        write_page(dir.path(), 2);

        let s = Scripted::new(vec![ok("Sorry, I can't help with that."), ok("{}")]);
        let err = synthesize_chunk(dir.path(), &s, &fast_config()).await.unwrap_err();
        assert!(matches!(err, ChunkError::UnparseableResponse { page: 1, .. }));
        assert_eq!(s.calls.load(Ordering::SeqCst), 1);
    }
}
