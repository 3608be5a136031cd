//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cardpipe_anki::{AnkiClient, Updater, fetch_deck, strip_subject_tags};
use cardpipe_core::{
    ArtifactLayout, ChunkOutcome, ChunkState, GeminiClient, JobSpec, Pipeline, RunProgress,
    RunResult, artifacts, cleanup_succeeded, split_file, write_summary,
};
use cardpipe_shared::{
    AppConfig, Mode, ModelChoice, PipelineConfig, init_config, load_config, resolve_api_key,
};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// cardpipe: resilient batch enrichment of flashcard notes.
#[derive(Parser)]
#[command(
    name = "cardpipe",
    version,
    about = "Run flashcard notes through a generation service in retried, validated chunks.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Operating mode.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ModeArg {
    TagAuditor,
    GrammarExplain,
    ExtraGenerator,
    QuestionTagging,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::TagAuditor => Mode::TagAuditor,
            ModeArg::GrammarExplain => Mode::GrammarExplain,
            ModeArg::ExtraGenerator => Mode::ExtraGenerator,
            ModeArg::QuestionTagging => Mode::QuestionTagging,
        }
    }
}

/// Generation model variant.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ModelArg {
    Flash,
    Pro,
}

impl From<ModelArg> for ModelChoice {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Flash => ModelChoice::Flash,
            ModelArg::Pro => ModelChoice::Pro,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline over an input collection.
    Run(RunArgs),

    /// Split a JSON array file into numbered parts.
    Split {
        /// File to split.
        input: PathBuf,

        /// Items per part.
        #[arg(short, long)]
        chunk_size: Option<usize>,

        /// Delete the source file after splitting.
        #[arg(long)]
        remove_source: bool,
    },

    /// Merge numbered parts back into one array file.
    Merge {
        /// Directory holding the parts.
        #[arg(long, default_value = "data/output")]
        dir: PathBuf,

        /// Part prefix (`{prefix}-{k}.json`).
        #[arg(long, default_value = "output")]
        prefix: String,

        /// Merged file to write.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List JSON files in a directory with their entry counts.
    Audit {
        /// Directory to inspect.
        #[arg(default_value = "data/output")]
        dir: PathBuf,
    },

    /// Export a deck from the flashcard store into the input collection.
    Fetch {
        /// Deck name (defaults to the configured deck).
        #[arg(long)]
        deck: Option<String>,

        /// File to write (defaults to the configured input path).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Apply output files to the flashcard store.
    Apply {
        /// Directory holding output files (defaults to the configured one).
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Output file prefix (`{prefix}-{k}.json`).
        #[arg(long, default_value = "output")]
        prefix: String,
    },

    /// Collapse `SUBJ::...` subtags back to the bare subject tag.
    StripTags {
        /// Deck name (defaults to the configured deck).
        #[arg(long)]
        deck: Option<String>,

        /// Subject to clean (defaults to every configured subject).
        #[arg(long)]
        subject: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments of `cardpipe run`.
#[derive(clap::Args)]
pub(crate) struct RunArgs {
    /// Operating mode.
    #[arg(short, long)]
    pub mode: ModeArg,

    /// Input collection (JSON array).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Output artifact base path.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Raw log base path.
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Instruction document (defaults to the mode's configured document).
    #[arg(long)]
    pub instruction: Option<PathBuf>,

    /// Model variant.
    #[arg(long)]
    pub model: Option<ModelArg>,

    /// Outer retry budget per chunk.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Items per chunk; 0 sends the whole input as one request.
    #[arg(short, long)]
    pub chunk_size: Option<usize>,

    /// Skip chunks whose output already exists.
    #[arg(long)]
    pub resume: bool,

    /// Delete the input parts of succeeded chunks afterwards.
    #[arg(long)]
    pub cleanup: bool,

    /// Write the run result as JSON to this path.
    #[arg(long)]
    pub summary: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "cardpipe=info",
        1 => "cardpipe=debug",
        _ => "cardpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Split {
            input,
            chunk_size,
            remove_source,
        } => cmd_split(&input, chunk_size, remove_source),
        Command::Merge {
            dir,
            prefix,
            output,
        } => cmd_merge(&dir, &prefix, &output),
        Command::Audit { dir } => cmd_audit(&dir),
        Command::Fetch { deck, output } => cmd_fetch(deck, output).await,
        Command::Apply { dir, prefix } => cmd_apply(dir, &prefix).await,
        Command::StripTags { deck, subject } => cmd_strip_tags(deck, subject).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_config()?;
    let api_key = resolve_api_key(&config)?;
    let mode = Mode::from(args.mode);

    let mut pipeline_config = PipelineConfig::from(&config);
    if let Some(size) = args.chunk_size {
        pipeline_config.chunk_size = size;
    }
    if let Some(retries) = args.max_retries {
        pipeline_config.max_retries = retries;
    }
    if let Some(model) = args.model {
        pipeline_config.model = model.into();
    }
    pipeline_config.resume = args.resume;

    let job = JobSpec {
        mode,
        layout: ArtifactLayout::new(
            args.input.unwrap_or_else(|| config.defaults.input.clone()),
            args.output.unwrap_or_else(|| config.defaults.output.clone()),
            args.log.unwrap_or_else(|| config.defaults.log.clone()),
        ),
        instruction: args
            .instruction
            .unwrap_or_else(|| config.instructions.for_mode(mode).to_path_buf()),
    };

    info!(
        mode = %mode,
        input = %job.layout.input.display(),
        instruction = %job.instruction.display(),
        chunk_size = pipeline_config.chunk_size,
        max_retries = pipeline_config.max_retries,
        "running pipeline"
    );

    let generator = GeminiClient::from_config(&config.gemini, api_key)?;
    let pipeline = Pipeline::new(generator, pipeline_config);
    install_interrupt_handler(pipeline.cancel_flag());

    let reporter = CliProgress::new();
    let result = pipeline.run(&job, &reporter).await?;

    if args.cleanup {
        let removed = cleanup_succeeded(&result)?;
        info!(removed = removed.len(), "removed input parts of succeeded chunks");
    }
    if let Some(path) = &args.summary {
        write_summary(path, &result)?;
    }

    print_run_summary(&result);

    if result.cancelled {
        return Err(eyre!(
            "run cancelled with {} chunk(s) unprocessed",
            result.remaining
        ));
    }
    if result.failed > 0 {
        return Err(eyre!(
            "{} of {} chunk(s) failed: {:?}",
            result.failed,
            result.total,
            result.failed_indices
        ));
    }
    Ok(())
}

/// First Ctrl-C stops the run before the next chunk; a second one exits.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, stopping after the current chunk (Ctrl-C again to abort)");
        cancel.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("aborted");
            std::process::exit(130);
        }
    });
}

fn print_run_summary(result: &RunResult) {
    println!();
    println!("  {} run {}", result.mode.label(), result.run_id);
    println!("  Chunks:    {}", result.total);
    println!("  Succeeded: {}", result.succeeded);
    println!("  Failed:    {}", result.failed);
    if !result.skipped.is_empty() {
        println!("  Skipped:   {}", result.skipped.len());
    }
    if result.cancelled {
        println!("  Remaining: {} (cancelled)", result.remaining);
    }
    println!(
        "  Time:      {:.1}s",
        (result.finished_at - result.started_at).num_milliseconds() as f64 / 1000.0
    );

    for report in &result.chunks {
        if let ChunkOutcome::Failed { cause, .. } = &report.outcome {
            let raw = report
                .last_raw_log()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into());
            println!("  ! chunk {}: {cause} (raw: {raw})", report.index);
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunProgress for CliProgress {
    fn run_started(&self, mode: Mode, chunks: usize) {
        self.spinner
            .set_message(format!("{}: {chunks} chunk(s)", mode.label()));
    }

    fn chunk_state(&self, index: usize, total: usize, state: ChunkState) {
        let what = match state {
            ChunkState::Pending => "queued",
            ChunkState::Invoking => "waiting for the model",
            ChunkState::Validating => "validating",
            ChunkState::RetryWait => "backing off",
            ChunkState::Succeeded => "done",
            ChunkState::Failed => "failed",
        };
        self.spinner
            .set_message(format!("Chunk [{index}/{total}] {what}"));
    }

    fn chunk_skipped(&self, index: usize, total: usize) {
        self.spinner
            .set_message(format!("Chunk [{index}/{total}] already done"));
    }

    fn done(&self, _result: &RunResult) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// File utilities
// ---------------------------------------------------------------------------

fn cmd_split(input: &Path, chunk_size: Option<usize>, remove_source: bool) -> Result<()> {
    let size = match chunk_size {
        Some(size) => size,
        None => load_config()?.defaults.chunk_size,
    };
    let parts = split_file(input, size, remove_source)?;
    println!("Split {} into {} part(s)", input.display(), parts.len());
    for part in parts {
        println!("  {}", part.display());
    }
    Ok(())
}

fn cmd_merge(dir: &Path, prefix: &str, output: &Path) -> Result<()> {
    let report = artifacts::merge_parts(dir, prefix, output)?;
    if report.merged.is_empty() {
        return Err(eyre!("no readable {prefix}-*.json parts in {}", dir.display()));
    }
    println!(
        "Merged {} part(s), {} item(s) into {}",
        report.merged.len(),
        report.item_count,
        output.display()
    );
    for (path, reason) in &report.skipped {
        println!("  skipped {}: {reason}", path.display());
    }
    Ok(())
}

fn cmd_audit(dir: &Path) -> Result<()> {
    let entries = artifacts::audit_dir(dir)?;
    if entries.is_empty() {
        println!("No JSON files in {}", dir.display());
        return Ok(());
    }
    for entry in &entries {
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!("{:>6}  {name}", entry.entries);
    }
    let total: usize = entries.iter().map(|e| e.entries).sum();
    println!("{total:>6}  total");
    Ok(())
}

// ---------------------------------------------------------------------------
// Flashcard store
// ---------------------------------------------------------------------------

async fn cmd_fetch(deck: Option<String>, output: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let deck = deck.unwrap_or_else(|| config.anki.deck.clone());
    let target = output.unwrap_or_else(|| config.defaults.input.clone());

    let client = AnkiClient::from_config(&config.anki)?;
    let count = fetch_deck(&client, &deck, &target).await?;
    println!("Exported {count} note(s) from '{deck}' to {}", target.display());
    Ok(())
}

async fn cmd_apply(dir: Option<PathBuf>, prefix: &str) -> Result<()> {
    let config = load_config()?;
    let dir = dir.unwrap_or_else(|| config.anki.output_dir.clone());

    let client = AnkiClient::from_config(&config.anki)?;
    let report = Updater::new(&client, &config.anki.subjects)
        .apply_dir(&dir, prefix)
        .await?;

    for file in &report.files {
        let name = file.path.display();
        match (&file.problem, file.deleted) {
            (Some(problem), _) => println!("  kept    {name}: {problem}"),
            (None, true) => println!("  applied {name} ({} record(s))", file.applied),
            (None, false) => println!(
                "  kept    {name}: {} applied, {} failed",
                file.applied, file.failed
            ),
        }
    }

    let kept = report.kept().count();
    if kept > 0 {
        return Err(eyre!("{kept} file(s) kept for retry"));
    }
    Ok(())
}

async fn cmd_strip_tags(deck: Option<String>, subject: Option<String>) -> Result<()> {
    let config = load_config()?;
    let deck = deck.unwrap_or_else(|| config.anki.deck.clone());
    let subjects = match subject {
        Some(subject) => vec![subject],
        None => config.anki.subjects.clone(),
    };

    let client = AnkiClient::from_config(&config.anki)?;
    let mut failed = 0;
    for subject in &subjects {
        let report = strip_subject_tags(&client, &deck, subject, &config.anki.subjects).await?;
        println!(
            "  {:<6} {} note(s), {} subtag(s) removed, {} bare tag(s) added",
            report.subject, report.matched, report.removed, report.added
        );
        failed += report.failed;
    }

    if failed > 0 {
        return Err(eyre!("{failed} note(s) could not be fully cleaned"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
