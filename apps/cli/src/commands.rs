//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use fieldsmith_engine::budget::estimate_record;
use fieldsmith_engine::sequencer::{RunEvent, RunObserver, Sequencer, chunk_fragments, replay};
use fieldsmith_engine::{PayloadBuilder, RunStore, segment};
use fieldsmith_provider::{HttpBatchProvider, LifecycleDriver};
use fieldsmith_shared::{
    AppConfig, BudgetConfig, ChunkStatus, OutputSchema, Record, RunId, RunReport,
    ValidationStatus, config_file_path, init_config, load_config, resolve_api_key,
};

/// Instruction text used when no instructions file is supplied.
const DEFAULT_INSTRUCTIONS: &str = "Act as a product data analyst. For every field in the \
output schema, derive a normalized value from the supplier data, explain your reasoning, and \
state your confidence. Never invent attributes the source data does not support.";

/// Schema name used for the permissive default schema.
const DEFAULT_SCHEMA_NAME: &str = "fields_extracted_response";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Fieldsmith — batch-mode LLM enrichment for product records.
#[derive(Parser)]
#[command(
    name = "fieldsmith",
    version,
    about = "Enrich product records through token-budgeted, context-carrying batch inference.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a full enrichment pass over a record file.
    Run {
        /// Input records, one JSON object per line.
        input: PathBuf,

        /// File containing the system instruction text.
        #[arg(long)]
        instructions: Option<PathBuf>,

        /// JSON file describing the output schema.
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Root directory for run artifacts (overrides config).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Model ID to request (overrides config).
        #[arg(long)]
        model: Option<String>,
    },

    /// Show how records would segment and chunk, without submitting anything.
    Plan {
        /// Input records, one JSON object per line.
        input: PathBuf,
    },

    /// Rebuild a run's report from its persisted artifacts.
    Replay {
        /// Run identifier (the run's directory name under the output root).
        run_id: String,

        /// Root directory for run artifacts (overrides config).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
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
        0 => "fieldsmith=info",
        1 => "fieldsmith=debug",
        _ => "fieldsmith=trace",
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
        Command::Run {
            input,
            instructions,
            schema,
            out,
            model,
        } => {
            cmd_run(
                &input,
                instructions.as_deref(),
                schema.as_deref(),
                out.as_deref(),
                model.as_deref(),
            )
            .await
        }
        Command::Plan { input } => cmd_plan(&input).await,
        Command::Replay { run_id, out } => cmd_replay(&run_id, out.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Input loading
// ---------------------------------------------------------------------------

/// Load records from a JSONL file, estimating weights where absent.
fn load_records(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read records from '{}': {e}", path.display()))?;

    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut record: Record = serde_json::from_str(line)
            .map_err(|e| eyre!("bad record on line {}: {e}", line_no + 1))?;
        if record.weight == 0 {
            record.weight = estimate_record(&record);
        }
        records.push(record);
    }

    if records.is_empty() {
        return Err(eyre!("no records found in '{}'", path.display()));
    }
    Ok(records)
}

fn load_instructions(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| eyre!("cannot read instructions from '{}': {e}", p.display())),
        None => Ok(DEFAULT_INSTRUCTIONS.to_string()),
    }
}

fn load_schema(path: Option<&Path>) -> Result<OutputSchema> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .map_err(|e| eyre!("cannot read schema from '{}': {e}", p.display()))?;
            serde_json::from_str(&content)
                .map_err(|e| eyre!("bad schema in '{}': {e}", p.display()))
        }
        None => Ok(OutputSchema::permissive(DEFAULT_SCHEMA_NAME)),
    }
}

/// Resolve the artifact root: CLI flag > config value, with `~` expansion.
fn output_root(config: &AppConfig, flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    let configured = &config.defaults.output_dir;
    match configured.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(rest),
        },
        None => PathBuf::from(configured),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    input: &Path,
    instructions: Option<&Path>,
    schema: Option<&Path>,
    out: Option<&Path>,
    model: Option<&str>,
) -> Result<()> {
    let config = load_config()?;
    let api_key = resolve_api_key(&config)?;
    let records = load_records(input)?;
    let instructions = load_instructions(instructions)?;
    let schema = load_schema(schema)?;
    let model = model.unwrap_or(&config.provider.model);

    let root = output_root(&config, out);
    std::fs::create_dir_all(&root)
        .map_err(|e| eyre!("cannot create output root '{}': {e}", root.display()))?;

    let run_id = RunId::new();
    let store = RunStore::create(&root, run_id.clone())?;
    let run_dir = store.dir().to_path_buf();

    let provider = HttpBatchProvider::new(&config.provider, api_key)?;
    let driver = LifecycleDriver::new(provider, config.polling.clone());
    let builder = PayloadBuilder::new(model, instructions, schema);
    let mut sequencer = Sequencer::new(
        driver,
        builder,
        BudgetConfig::from(&config),
        &config.context,
        store,
    )
    .with_observer(Box::new(CliProgress::new()));

    // Ctrl-C cancels between chunks; the in-flight job is allowed to finish
    // so its already-paid-for results are salvaged.
    let cancel = sequencer.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancellation requested; finishing the in-flight batch");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    info!(run_id = %run_id, records = records.len(), model, "starting run");
    let report = sequencer.run(&records).await?;

    print_report(&report, Some(&run_dir));
    Ok(())
}

async fn cmd_plan(input: &Path) -> Result<()> {
    let config = load_config()?;
    let budget = BudgetConfig::from(&config);
    let records = load_records(input)?;

    let outcome = segment(&records, |r| r.group_key.as_str(), &budget);
    let chunks = chunk_fragments(outcome.fragments, budget.per_batch_ceiling);

    println!();
    println!("  Plan for {} records:", records.len());
    println!();
    for chunk in &chunks {
        let flagged = chunk
            .fragments
            .iter()
            .filter(|f| f.context_incomplete)
            .count();
        println!(
            "  chunk {:>3}: {:>3} fragments, {:>5} records, ~{} tokens{}",
            chunk.index,
            chunk.fragments.len(),
            chunk.record_count(),
            chunk.weight(),
            if flagged > 0 {
                format!(" ({flagged} context-incomplete)")
            } else {
                String::new()
            }
        );
    }
    if !outcome.rejected.is_empty() {
        println!();
        println!("  Rejected records:");
        for rejection in &outcome.rejected {
            println!("  - {}: {}", rejection.id, rejection.reason);
        }
    }
    println!();
    Ok(())
}

async fn cmd_replay(run_id: &str, out: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let root = output_root(&config, out);
    let run_id: RunId = run_id
        .parse()
        .map_err(|e| eyre!("invalid run id '{run_id}': {e}"))?;

    let report = replay(&root, run_id)?;
    print_report(&report, None);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config file created at {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let path = config_file_path()?;
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Report summary
// ---------------------------------------------------------------------------

fn print_report(report: &RunReport, run_dir: Option<&Path>) {
    let completed = report
        .chunks
        .iter()
        .filter(|c| c.status == ChunkStatus::Completed)
        .count();

    println!();
    if report.is_complete() {
        println!("  Run {} completed.", report.run_id);
    } else {
        println!("  Run {} finished with partial results.", report.run_id);
    }
    println!("  Chunks:        {completed}/{} completed", report.chunks.len());
    println!("  Records:       {}", report.results.len());
    println!(
        "  Valid:         {}",
        report.count_status(ValidationStatus::Valid)
    );
    println!(
        "  QA-flagged:    {}",
        report.count_status(ValidationStatus::QaFlagged)
    );
    println!(
        "  Schema errors: {}",
        report.count_status(ValidationStatus::SchemaError)
    );
    println!(
        "  Missing:       {}",
        report.count_status(ValidationStatus::MissingOutput)
    );
    if !report.rejected.is_empty() {
        println!("  Rejected:      {}", report.rejected.len());
    }
    println!(
        "  Tokens:        {} in / {} out",
        report.tokens_in, report.tokens_out
    );
    for chunk in &report.chunks {
        match &chunk.status {
            ChunkStatus::Failed { reason } => {
                println!("  chunk {:>3} failed: {reason}", chunk.index);
            }
            ChunkStatus::Skipped { reason } => {
                println!("  chunk {:>3} skipped: {reason}", chunk.index);
            }
            ChunkStatus::Completed => {}
        }
    }
    if let Some(dir) = run_dir {
        println!("  Artifacts:     {}", dir.display());
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Run progress on stderr using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunObserver for CliProgress {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::RecordRejected { id, reason } => {
                self.spinner.println(format!("  rejected {id}: {reason}"));
            }
            RunEvent::ChunkDispatched {
                index,
                records,
                weight,
            } => {
                self.spinner.set_message(format!(
                    "chunk {index}: {records} records (~{weight} tokens) in flight"
                ));
            }
            RunEvent::ChunkCompleted {
                index,
                valid,
                qa_flagged,
            } => {
                self.spinner.println(format!(
                    "  chunk {index} completed: {valid} valid, {qa_flagged} flagged"
                ));
            }
            RunEvent::ChunkFailed { index, reason } => {
                self.spinner
                    .println(format!("  chunk {index} failed: {reason}"));
            }
            RunEvent::ChunkSkipped { index, reason } => {
                self.spinner
                    .println(format!("  chunk {index} skipped: {reason}"));
            }
            RunEvent::RunFinished { .. } => {
                self.spinner.finish_and_clear();
            }
        }
    }
}
