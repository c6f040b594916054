//! CLI binary for doctranscribe.
//!
//! A thin shim over the library crate: maps CLI flags to
//! `ExtractionConfig`, registers the input PDF, runs one extraction job and
//! prints the combined result.

use anyhow::{Context, Result};
use clap::Parser;
use doctranscribe::pipeline::input::load_pdf;
use doctranscribe::{
    CombinedResult, Credentials, ExtractionConfig, ExtractionProgressCallback, FsBlobStore,
    FsStore, JobStatus, LlmProviderBackend, Orchestrator, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_job_start` reports the page total.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rasterising PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
    }

    fn elapsed_secs(&self, page: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&page))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_job_start(&self, _job_id: Uuid, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_pages} page(s)…"))
        ));
    }

    fn on_page_start(&self, page: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(page, Instant::now());
        }
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, total: usize, question_count: usize, confidence: f64) {
        let secs = self.elapsed_secs(page);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<14}  {}  {}",
            green("✓"),
            page,
            total,
            dim(&format!("{question_count:>3} questions")),
            dim(&format!("conf {confidence:.2}")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_complete(&self, _job_id: Uuid, status: JobStatus, usable_pages: usize) {
        self.bar.finish_and_clear();
        match status {
            JobStatus::Completed => eprintln!(
                "{} extraction completed ({} page(s))",
                green("✔"),
                bold(&usable_pages.to_string())
            ),
            other => eprintln!("{} extraction {}", red("✘"), other),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract a local form (summary on stdout)
  doctranscribe intake.pdf

  # Full combined JSON to a file
  doctranscribe --json intake.pdf -o intake.json

  # Try the pipeline without an API key
  doctranscribe --mock intake.pdf

  # Use another edgequake-llm provider
  doctranscribe --provider anthropic --model claude-sonnet-4-20250514 intake.pdf

  # Keep documents, jobs and page results on disk
  doctranscribe --store-dir ./extractions https://example.com/form.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY              API key for the default OpenAI backend
  DOCTRANSCRIBE_MODEL         Vision model ID (default gpt-4.1)
  DOCTRANSCRIBE_PROVIDER      edgequake-llm provider name
  DOCTRANSCRIBE_BASE_URL      OpenAI-compatible endpoint base URL
  RUST_LOG                    Override the log filter
"#;

/// Extract structured data from scanned and handwritten PDF forms.
#[derive(Parser, Debug)]
#[command(
    name = "doctranscribe",
    version,
    about = "Extract structured field/value data from PDF forms using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write the result to this file instead of stdout.
    #[arg(short, long, env = "DOCTRANSCRIBE_OUTPUT")]
    output: Option<PathBuf>,

    /// API key for the OpenAI-compatible backend.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Vision model ID.
    #[arg(long, env = "DOCTRANSCRIBE_MODEL", default_value = doctranscribe::config::DEFAULT_MODEL)]
    model: String,

    /// edgequake-llm provider (openai, anthropic, gemini, ollama, azure).
    /// Overrides the built-in OpenAI backend.
    #[arg(long, env = "DOCTRANSCRIBE_PROVIDER")]
    provider: Option<String>,

    /// OpenAI-compatible endpoint base URL.
    #[arg(long, env = "DOCTRANSCRIBE_BASE_URL", default_value = doctranscribe::config::DEFAULT_API_BASE_URL)]
    base_url: String,

    /// Serve a fixed demo form instead of calling a vision model.
    #[arg(long, env = "DOCTRANSCRIBE_MOCK")]
    mock: bool,

    /// Rendering DPI (72–400).
    #[arg(long, env = "DOCTRANSCRIBE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Pages beyond this are not extracted.
    #[arg(long, env = "DOCTRANSCRIBE_MAX_PAGES", default_value_t = 10)]
    max_pages: usize,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "DOCTRANSCRIBE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max model output tokens per page.
    #[arg(long, env = "DOCTRANSCRIBE_MAX_TOKENS", default_value_t = 4000)]
    max_tokens: usize,

    /// Model temperature (0.0–2.0).
    #[arg(long, env = "DOCTRANSCRIBE_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per page on transient failures.
    #[arg(long, env = "DOCTRANSCRIBE_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-page vision call timeout in seconds.
    #[arg(long, env = "DOCTRANSCRIBE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DOCTRANSCRIBE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Answer written into every question when no answer is legible.
    #[arg(long, env = "DOCTRANSCRIBE_EMPTY_ANSWER")]
    empty_answer: Option<String>,

    /// Persist documents, jobs and page results as JSON under this directory.
    #[arg(long, env = "DOCTRANSCRIBE_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Print the full combined record as JSON instead of a summary.
    #[arg(long, env = "DOCTRANSCRIBE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCTRANSCRIBE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCTRANSCRIBE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCTRANSCRIBE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose asks for them.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config and orchestrator ────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    let mut builder = Orchestrator::builder(config);
    if let Some(ref dir) = cli.store_dir {
        let store = FsStore::open(dir.join("records"))
            .await
            .with_context(|| format!("Failed to open store at {}", dir.display()))?;
        builder = builder
            .store(Arc::new(store))
            .blobs(Arc::new(FsBlobStore::new(dir.join("blobs"))));
    }
    let orchestrator = builder.build();

    // ── Register and extract ─────────────────────────────────────────────
    let pdf = load_pdf(&cli.input, cli.download_timeout)
        .await
        .with_context(|| format!("Failed to load {}", cli.input))?;
    let document = orchestrator
        .register_document(pdf.filename, pdf.bytes)
        .await
        .context("Failed to register document")?;

    // --mock wins over any key picked up from the environment.
    let credentials = if cli.mock {
        None
    } else {
        cli.api_key.as_deref().and_then(Credentials::new)
    };
    let job_id = orchestrator
        .submit_extraction(document.id, credentials)
        .await
        .context("Failed to start extraction")?;

    let status = orchestrator.wait(job_id).await?;
    let combined = orchestrator
        .get_combined_result(job_id)
        .await
        .context("Failed to read combined result")?;

    // ── Output ───────────────────────────────────────────────────────────
    let rendered = if cli.json {
        serde_json::to_string_pretty(&combined).context("Failed to serialise result")?
    } else {
        summary(&combined)
    };

    if let Some(ref path) = cli.output {
        tokio::fs::write(path, rendered.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!("{}  →  {}", green("✔"), bold(&path.display().to_string()));
        }
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(rendered.as_bytes())
            .context("Failed to write to stdout")?;
        if !rendered.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if status.status == JobStatus::Failed {
        eprintln!(
            "{} {}",
            red("extraction failed:"),
            status.error_message.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(2);
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .dpi(cli.dpi)
        .max_pages(cli.max_pages)
        .model(cli.model.clone())
        .api_base_url(cli.base_url.clone())
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .mock_mode(cli.mock);

    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref text) = cli.empty_answer {
        builder = builder.empty_answer_placeholder(text.clone());
    }
    if let Some(ref name) = cli.provider {
        let backend = LlmProviderBackend::from_provider_name(name, &cli.model)?;
        builder = builder.backend(Arc::new(backend));
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Human-readable listing of the combined record.
fn summary(result: &CombinedResult) -> String {
    let mut out = String::new();
    if let Some(ref title) = result.form_title {
        out.push_str(&format!("{}\n", title));
    }
    if let Some(ref kind) = result.document_type {
        out.push_str(&format!("Type:        {}\n", kind));
    }
    out.push_str(&format!(
        "Confidence:  {:.2} ({:?})\n\n",
        result.overall_confidence, result.extraction_method
    ));
    for q in &result.questions {
        let conf = q
            .confidence
            .map(|c| format!("{c:.2}"))
            .unwrap_or_else(|| "  - ".to_string());
        out.push_str(&format!("[p{} {}] {}: {}\n", q.page, conf, q.question, q.answer));
    }
    for page in result.pages.iter().filter(|p| p.error.is_some()) {
        out.push_str(&format!(
            "\npage {} failed: {}",
            page.page,
            page.error.as_deref().unwrap_or_default()
        ));
    }
    for remark in &result.remarks {
        out.push_str(&format!("\nnote: {remark}"));
    }
    out
}
