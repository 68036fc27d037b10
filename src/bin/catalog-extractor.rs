//! CLI binary for catalog-extractor.
//!
//! A thin shim over the library: `plan` maps CLI flags to `PlanConfig`,
//! `run` to `RunConfig`, and every invocation is journaled in the job
//! directory.

use anyhow::{Context, Result};
use catalog_extractor::journal::{self, Outcome};
use catalog_extractor::runner::{self, job_report};
use catalog_extractor::state::status_counts;
use catalog_extractor::{
    plan_job, ChunkStatus, ConverterKind, JobState, PlanConfig, ProgressCallback, RunConfig, RunProgressCallback,
    RunSummary, Runner, SynthesisMode,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn spinner(prefix: &str, message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(TICKS);
    bar.set_style(style);
    bar.set_prefix(prefix.to_string());
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner anchored at the bottom of the terminal, with one log line per
/// synthesized page and per finished chunk.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: spinner("Waiting", "looking for an eligible chunk…"),
            failed: AtomicUsize::new(0),
        })
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_chunk_claimed(&self, start: usize, end: usize, previous: ChunkStatus) {
        self.bar.set_prefix(format!("Chunk {start}-{end}"));
        self.bar.set_message(format!("claimed (was {previous})"));
    }

    fn on_step(&self, step: usize, total: usize, label: &str) {
        self.bar.set_message(format!("[{step}/{total}] {label}"));
    }

    fn on_page_synthesized(&self, page: usize, skus: usize, input_tokens: usize, output_tokens: usize) {
        self.bar.println(format!(
            "    {} Page {:>4}  {:<10}  {}",
            green("✓"),
            page,
            dim(&format!("{skus} SKU(s)")),
            dim(&format!("{input_tokens} in / {output_tokens} out")),
        ));
    }

    fn on_chunk_finished(&self, start: usize, end: usize, status: ChunkStatus, elapsed_ms: u64) {
        let mark = match status {
            ChunkStatus::Completed => green("✔"),
            ChunkStatus::Synthesize => cyan("→"),
            _ => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                red("✘")
            }
        };
        self.bar.println(format!(
            "{} Chunk {}-{}  {}  {}",
            mark,
            start,
            end,
            bold(status.as_str()),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_run_complete(&self, processed: usize) {
        self.bar.finish_and_clear();
        let failed = self.failed.load(Ordering::SeqCst);
        if processed == 0 {
            eprintln!("{} nothing to do", cyan("◆"));
        } else if failed == 0 {
            eprintln!("{} {} chunk(s) processed", green("✔"), bold(&processed.to_string()));
        } else {
            eprintln!(
                "{} {} chunk(s) processed  ({} failed)",
                cyan("⚠"),
                bold(&processed.to_string()),
                red(&failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Plan a job: map the table of contents, slice 5-page chunks
  catalog-extractor plan catalog.pdf jobs/acme

  # Plan from a URL with 3-page chunks, replacing an existing job
  catalog-extractor plan https://example.com/catalog.pdf jobs/acme --chunk-size 3 --force

  # Process every chunk
  catalog-extractor run jobs/acme

  # Convert everything now, synthesize later
  catalog-extractor run jobs/acme --synthesis skip
  catalog-extractor run jobs/acme --synthesis only --model gemini-2.0-flash

  # One chunk of the third section, then stop
  catalog-extractor run jobs/acme --section 2 --once

  # Status counts per section
  catalog-extractor run jobs/acme --report

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (preferred when present)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Provider override (with EDGEQUAKE_MODEL)
  EDGEQUAKE_MODEL         Model override (with EDGEQUAKE_LLM_PROVIDER)
  PDFIUM_LIB_PATH         Path to a specific libpdfium
  CATALOG_*               Any flag, e.g. CATALOG_CHUNK_SIZE=3
"#;

/// Turn product catalog PDFs into Markdown and per-SKU JSON.
#[derive(Parser, Debug)]
#[command(
    name = "catalog-extractor",
    version,
    about = "Turn product catalog PDFs into Markdown and per-SKU JSON",
    long_about = "Splits a catalog into sections and page chunks (plan), then converts each chunk, \
extracts product rows from its tables and synthesizes Markdown and SKU records with a vision \
model (run). Jobs are resumable: rerun `run` at any time to pick up where it stopped.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "CATALOG_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "CATALOG_QUIET")]
    quiet: bool,

    /// Disable the progress spinner.
    #[arg(long, global = true, env = "CATALOG_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Map the catalog and create a job directory of PENDING chunks.
    Plan(PlanArgs),
    /// Process eligible chunks of a planned job.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct PlanArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Job directory to create.
    job_dir: PathBuf,

    /// Pages per chunk.
    #[arg(long, env = "CATALOG_CHUNK_SIZE", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    chunk_size: u32,

    /// Replace an existing job in the directory.
    #[arg(long, env = "CATALOG_FORCE")]
    force: bool,

    /// Pages scanned for the table of contents.
    #[arg(long, env = "CATALOG_TOC_PAGES", default_value_t = 5)]
    toc_pages: usize,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "CATALOG_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job directory created by `plan`.
    job_dir: PathBuf,

    /// Stop after one chunk.
    #[arg(long, env = "CATALOG_ONCE")]
    once: bool,

    /// include: convert and synthesize; skip: convert only; only: synthesize converted chunks.
    #[arg(long, env = "CATALOG_SYNTHESIS", value_enum, default_value = "include")]
    synthesis: SynthesisArg,

    /// Print per-section status counts and exit.
    #[arg(long)]
    report: bool,

    /// Restrict to one section (0-based index, see --report).
    #[arg(long, env = "CATALOG_SECTION")]
    section: Option<usize>,

    /// Document converter.
    #[arg(long, env = "CATALOG_CONVERTER", value_enum, default_value = "pdfium")]
    converter: ConverterArg,

    /// Path to the docling executable (with --converter docling).
    #[arg(long, env = "CATALOG_DOCLING_BIN")]
    docling_bin: Option<PathBuf>,

    /// Model ID (e.g. gemini-2.0-flash, gpt-4.1-mini).
    #[arg(long, env = "CATALOG_MODEL")]
    model: Option<String>,

    /// Provider: gemini, openai, anthropic, ollama, azure. Auto-detected if not set.
    #[arg(long, env = "CATALOG_PROVIDER")]
    provider: Option<String>,

    /// Maximum model calls per page before the chunk fails.
    #[arg(long, env = "CATALOG_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Page render scale (2.0 ≈ 144 DPI).
    #[arg(long, env = "CATALOG_IMAGE_SCALE", default_value_t = 2.0)]
    image_scale: f32,

    /// Factor applied to page images before upload, in (0, 1].
    #[arg(long, env = "CATALOG_IMAGE_DOWNSCALE", default_value_t = 0.5)]
    image_downscale: f32,

    /// Model temperature.
    #[arg(long, env = "CATALOG_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max output tokens per page.
    #[arg(long, env = "CATALOG_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "CATALOG_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SynthesisArg {
    Include,
    Skip,
    Only,
}

impl From<SynthesisArg> for SynthesisMode {
    fn from(v: SynthesisArg) -> Self {
        match v {
            SynthesisArg::Include => SynthesisMode::Include,
            SynthesisArg::Skip => SynthesisMode::Skip,
            SynthesisArg::Only => SynthesisMode::Only,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ConverterArg {
    Pdfium,
    Docling,
}

impl From<ConverterArg> for ConverterKind {
    fn from(v: ConverterArg) -> Self {
        match v {
            ConverterArg::Pdfium => ConverterKind::Pdfium,
            ConverterArg::Docling => ConverterKind::Docling,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs would interleave with the spinner.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let started = Instant::now();
    let job_dir = match &cli.command {
        Command::Plan(args) => args.job_dir.clone(),
        Command::Run(args) => args.job_dir.clone(),
    };

    let result = match &cli.command {
        Command::Plan(args) => plan(&cli, args, show_progress).await,
        Command::Run(args) => run(&cli, args, show_progress).await,
    };

    // ── Journal ──────────────────────────────────────────────────────────
    let (outcome, message) = match &result {
        Ok(message) => (Outcome::Success, message.clone()),
        Err(e) => (Outcome::Error, format!("{e:#}")),
    };
    let argv: Vec<String> = std::env::args().collect();
    let program = argv
        .first()
        .and_then(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog-extractor".to_string());
    let record = journal::execution_record(&program, argv.get(1..).unwrap_or(&[]), started.elapsed(), outcome, &message);
    journal::record(&job_dir, &record);

    result.map(|_| ())
}

/// `plan` subcommand. Returns the journal message.
async fn plan(cli: &Cli, args: &PlanArgs, show_progress: bool) -> Result<String> {
    let config = PlanConfig::builder()
        .chunk_size(args.chunk_size as usize)
        .toc_scan_pages(args.toc_pages)
        .force(args.force)
        .download_timeout_secs(args.download_timeout)
        .build()
        .context("Invalid plan options")?;

    let bar = show_progress.then(|| spinner("Planning", &args.input));
    let planned = plan_job(&args.input, &args.job_dir, &config).await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    let state = planned.with_context(|| format!("Failed to plan job in {}", args.job_dir.display()))?;

    if !cli.quiet {
        print_plan_summary(&state);
    }
    Ok(format!(
        "Planned {} section(s), {} chunk(s)",
        state.sections.len(),
        state.total_chunks()
    ))
}

fn print_plan_summary(state: &JobState) {
    for (i, section) in state.sections.iter().enumerate() {
        eprintln!(
            "  {} {:>2}: {}  {}",
            cyan("◆"),
            i,
            bold(&section.name),
            dim(&format!(
                "pages {}-{}, {} chunk(s)",
                section.start_page,
                section.end_page,
                section.chunks.len()
            )),
        );
    }
    eprintln!(
        "{} {} chunk(s) planned in {}",
        green("✔"),
        bold(&state.total_chunks().to_string()),
        bold(&state.working_dir.display().to_string()),
    );
}

/// `run` subcommand. Returns the journal message.
async fn run(cli: &Cli, args: &RunArgs, show_progress: bool) -> Result<String> {
    if args.report {
        let report = job_report(&args.job_dir).context("Failed to read job state")?;
        println!("{report}");
        return Ok("Report".to_string());
    }

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RunProgressCallback>)
    } else {
        None
    };
    let config = build_run_config(args, progress).await?;

    let converter = runner::build_converter(args.converter.into(), args.docling_bin.as_deref(), args.image_scale);
    let synthesizer = if config.mode.needs_model() {
        Some(runner::build_synthesizer(&config).context("Cannot configure the model provider")?)
    } else {
        None
    };

    let summary = Runner::new(&args.job_dir, converter, synthesizer, config)
        .run()
        .await
        .context("Run failed")?;

    if !cli.quiet {
        print_run_summary(&args.job_dir, &summary);
    }
    Ok(format!(
        "Processed {} chunk(s): {} completed, {} deferred, {} failed",
        summary.processed, summary.completed, summary.deferred, summary.failed
    ))
}

fn print_run_summary(job_dir: &Path, summary: &RunSummary) {
    eprintln!(
        "   {} completed  /  {} deferred  /  {} failed",
        green(&summary.completed.to_string()),
        cyan(&summary.deferred.to_string()),
        red(&summary.failed.to_string()),
    );
    if let Ok(state) = catalog_extractor::StateStore::new(job_dir).load() {
        let all: Vec<_> = state.chunks().cloned().collect();
        let counts: Vec<String> = status_counts(&all)
            .into_iter()
            .map(|(status, n)| format!("{status}: {n}"))
            .collect();
        eprintln!("   {}", dim(&format!("job: {}", counts.join(", "))));
    }
}

/// Map CLI args to `RunConfig`.
async fn build_run_config(args: &RunArgs, progress: Option<ProgressCallback>) -> Result<RunConfig> {
    let mut builder = RunConfig::builder()
        .mode(args.synthesis.into())
        .section(args.section)
        .once(args.once)
        .image_scale(args.image_scale)
        .image_downscale(args.image_downscale)
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .max_attempts(args.max_retries);

    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid run options")
}
