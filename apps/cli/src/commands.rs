//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use citeflow_core::notify;
use citeflow_core::{
    Orchestrator, PipelineReport, ProgressReporter, Scheduler, Stage, TaskStatus,
};
use citeflow_shared::{
    AppConfig, PipelineRun, RunStatus, SchedulerConfig, config_file_path, init_config_at,
    load_config, load_config_from,
};
use citeflow_storage::{MemoryStore, Storage, Store};

/// How often a foreground scheduler checks for a stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_FILE_NAME: &str = "citeflow.stop";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// citeflow: citation sampling, pipeline runs and scheduled tasks.
#[derive(Parser)]
#[command(
    name = "citeflow",
    version,
    about = "Discover research citations and run the processing pipeline on a schedule.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.citeflow/citeflow.toml).
    #[arg(long, global = true, env = "CITEFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use an in-memory store; nothing is persisted.
    #[arg(long, global = true)]
    pub dry_run: bool,

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
    /// Run the scheduler in the foreground until Ctrl-C or `citeflow stop`.
    Start,

    /// Ask a foreground scheduler to shut down.
    Stop,

    /// Run one configured task immediately.
    RunNow {
        /// Task id from the `[[tasks]]` table.
        task_id: String,
    },

    /// Show configured tasks, their persisted state, and recent runs.
    Status {
        /// Number of recent pipeline runs to show.
        #[arg(long, default_value = "10")]
        runs: usize,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List pipeline stages and the unit configured for each.
    Stages,

    /// Run a single pipeline stage.
    RunStage {
        /// Stage name, e.g. citation_sampling.
        stage: String,
    },

    /// Run every stage in order.
    RunAll,

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
    /// Write a config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
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
        0 => "citeflow=info",
        1 => "citeflow=debug",
        _ => "citeflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
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
    match &cli.command {
        Command::Start => cmd_start(&cli).await,
        Command::Stop => cmd_stop(&cli),
        Command::RunNow { task_id } => cmd_run_now(&cli, task_id).await,
        Command::Status { runs, json } => cmd_status(&cli, *runs, *json).await,
        Command::Stages => cmd_stages(&cli).await,
        Command::RunStage { stage } => cmd_run_stage(&cli, stage).await,
        Command::RunAll => cmd_run_all(&cli).await,
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(&cli, *force),
            ConfigAction::Show => cmd_config_show(&cli),
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// How a command touches the database.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    /// Inspection only; a missing database reads as empty.
    ReadOnly,
}

/// Config, store and orchestrator for commands that run stages.
struct Runtime {
    config: AppConfig,
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    access: Access,
}

impl Runtime {
    async fn open(cli: &Cli, access: Access) -> Result<Self> {
        let config = resolve_config(cli)?;
        let path = config.storage.resolve_database_path()?;
        let store: Arc<dyn Store> = match access {
            _ if cli.dry_run => {
                info!("dry run: using in-memory store");
                Arc::new(MemoryStore::new())
            }
            Access::ReadOnly if !path.exists() => {
                info!(path = %path.display(), "no database yet");
                Arc::new(MemoryStore::new())
            }
            Access::ReadOnly => Arc::new(Storage::open_readonly(&path).await?),
            Access::ReadWrite => {
                info!(path = %path.display(), "opening database");
                Arc::new(Storage::open(&path).await?)
            }
        };
        let orchestrator = Arc::new(Orchestrator::from_config(&config, store.clone())?);
        Ok(Self {
            config,
            store,
            orchestrator,
            access,
        })
    }

    /// A scheduler with every configured task registered and persisted
    /// counters restored.
    async fn scheduler(&self) -> Result<Scheduler> {
        let mut builder = Scheduler::builder(SchedulerConfig::from(&self.config))
            .notifier(notify::from_settings(&self.config.notifications)?);
        if self.access == Access::ReadWrite {
            builder = builder.store(self.store.clone());
        }
        let scheduler = builder.build();
        scheduler
            .add_definitions(&self.config.tasks, &self.orchestrator)
            .await?;
        let persisted = self.store.list_task_states().await?;
        scheduler.restore(&persisted).await;
        Ok(scheduler)
    }
}

fn stop_file(config: &AppConfig) -> Result<PathBuf> {
    Ok(config
        .storage
        .resolve_database_path()?
        .with_file_name(STOP_FILE_NAME))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, cancelling");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
}

fn format_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ---------------------------------------------------------------------------
// Scheduler commands
// ---------------------------------------------------------------------------

async fn cmd_start(cli: &Cli) -> Result<()> {
    let runtime = Runtime::open(cli, Access::ReadWrite).await?;
    let stop_path = stop_file(&runtime.config)?;
    if stop_path.exists() {
        std::fs::remove_file(&stop_path)?;
        info!(path = %stop_path.display(), "removed stale stop request");
    }

    let scheduler = runtime.scheduler().await?;
    scheduler.start().await?;

    for task in scheduler.snapshot().await {
        info!(
            task_id = %task.id,
            trigger = %format!("{} {}", task.trigger_kind.as_str(), task.trigger_expr),
            enabled = task.enabled,
            next_run = %format_time(task.next_run),
            "task registered"
        );
    }
    println!("Scheduler running. Press Ctrl-C or run `citeflow stop` to shut down.");

    let reason = wait_for_shutdown(&stop_path).await;
    info!(reason, "shutting down scheduler");
    scheduler.stop().await;

    if stop_path.exists() {
        std::fs::remove_file(&stop_path)?;
    }
    println!("Scheduler stopped ({reason}).");
    Ok(())
}

/// Block until Ctrl-C or until a stop request file appears.
async fn wait_for_shutdown(stop_path: &Path) -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut listening = true;
    let mut poll = tokio::time::interval(STOP_POLL_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c, if listening => match result {
                Ok(()) => return "interrupt",
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C, relying on stop requests");
                    listening = false;
                }
            },
            _ = poll.tick() => {
                if stop_path.exists() {
                    return "stop requested";
                }
            }
        }
    }
}

fn cmd_stop(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let path = stop_file(&config)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, chrono::Utc::now().to_rfc3339())?;
    info!(path = %path.display(), "stop requested");
    println!("Stop requested; a running scheduler will exit within a few seconds.");
    Ok(())
}

async fn cmd_run_now(cli: &Cli, task_id: &str) -> Result<()> {
    let runtime = Runtime::open(cli, Access::ReadWrite).await?;
    let scheduler = runtime.scheduler().await?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let outcome = tokio::select! {
        outcome = scheduler.run_now(task_id) => outcome?,
        _ = cancel.cancelled() => {
            scheduler.stop().await;
            return Err(eyre!("task '{task_id}' interrupted"));
        }
    };

    println!();
    println!("  Task:     {}", outcome.task_id);
    println!("  Status:   {:?}", outcome.status);
    println!(
        "  Time:     {:.1}s",
        (outcome.finished_at - outcome.started_at).num_milliseconds() as f64 / 1000.0
    );
    println!("  Failures: {}", outcome.failure_count);
    if outcome.disabled {
        println!("  Task is now disabled.");
    }
    if !outcome.payload.is_null() {
        println!("{}", serde_json::to_string_pretty(&outcome.payload)?);
    }
    println!();

    if !outcome.is_success() {
        return Err(eyre!(
            "task '{task_id}' did not succeed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

async fn cmd_status(cli: &Cli, recent: usize, json: bool) -> Result<()> {
    let runtime = Runtime::open(cli, Access::ReadOnly).await?;
    let scheduler = runtime.scheduler().await?;
    let tasks: Vec<TaskStatus> = scheduler.snapshot().await;
    let runs = runtime.store.recent_pipeline_runs(recent).await?;
    let citations = runtime.store.citation_count().await?;

    if json {
        let status = serde_json::json!({
            "tasks": tasks,
            "recent_runs": runs,
            "citations": citations,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("  Tasks");
    println!(
        "  {:<22} {:<26} {:<8} {:<17} {:<17} {:>5} {:>8}",
        "ID", "ACTION", "ENABLED", "LAST RUN", "NEXT RUN", "RUNS", "FAILURES"
    );
    for task in &tasks {
        println!(
            "  {:<22} {:<26} {:<8} {:<17} {:<17} {:>5} {:>5}/{}",
            task.id,
            task.action,
            if task.enabled { "yes" } else { "no" },
            format_time(task.last_run),
            format_time(task.next_run),
            task.run_count,
            task.failure_count,
            task.max_failures,
        );
        if let Some(err) = &task.last_error {
            println!("    last error: {err}");
        }
    }

    println!();
    println!("  Recent runs");
    if runs.is_empty() {
        println!("  (none)");
    }
    for run in &runs {
        print_run(run);
    }
    println!();
    println!("  Citations stored: {citations}");
    println!();
    Ok(())
}

fn print_run(run: &PipelineRun) {
    let counts = run.counts();
    println!(
        "  {:<20} {:<10} {:<17} processed={} created={} failed={}",
        run.stage(),
        run.status().as_str(),
        format_time(Some(run.created_at())),
        counts.processed,
        counts.created,
        counts.failed,
    );
    if let Some(err) = run.error() {
        println!("    error: {err}");
    }
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn cmd_stages(cli: &Cli) -> Result<()> {
    let runtime = Runtime::open(cli, Access::ReadOnly).await?;
    println!();
    for stage in Stage::ALL {
        let unit = runtime
            .orchestrator
            .describe_unit(stage)
            .unwrap_or_else(|| "(no unit configured)".to_string());
        println!("  {:<20} {}", stage.as_str(), stage.description());
        println!("  {:<20} {unit}", "");
    }
    println!();
    Ok(())
}

async fn cmd_run_stage(cli: &Cli, name: &str) -> Result<()> {
    let stage: Stage = name.parse()?;
    let runtime = Runtime::open(cli, Access::ReadWrite).await?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    info!(%stage, "running stage");
    let reporter = CliProgress::new();
    reporter.phase(stage);
    let run = runtime.orchestrator.run_stage_until(stage, &cancel).await;
    reporter.finish();

    println!();
    print_run(&run);
    if !run.metadata().is_empty() {
        println!("{}", serde_json::to_string_pretty(run.metadata())?);
    }
    println!();

    match run.status() {
        RunStatus::Completed => Ok(()),
        status => Err(eyre!(
            "stage {stage} ended {status}: {}",
            run.error().unwrap_or("no error recorded")
        )),
    }
}

async fn cmd_run_all(cli: &Cli) -> Result<()> {
    let runtime = Runtime::open(cli, Access::ReadWrite).await?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let reporter = CliProgress::new();
    let report = runtime.orchestrator.run_all_until(&reporter, &cancel).await;
    print_report(&report);

    if report.all_failed() {
        return Err(eyre!("every pipeline stage failed"));
    }
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!();
    println!("  Pipeline finished");
    for outcome in &report.outcomes {
        println!(
            "  {:<20} {:<10} processed={} created={} failed={}",
            outcome.stage,
            outcome.status.as_str(),
            outcome.counts.processed,
            outcome.counts.created,
            outcome.counts.failed,
        );
    }
    println!(
        "  Totals: processed={} created={} failed={}",
        report.totals.processed, report.totals.created, report.totals.failed
    );
    println!(
        "  Time:   {:.1}s",
        (report.ended_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    if !report.recommendations.is_empty() {
        println!();
        println!("  Recommendations");
        for rec in &report.recommendations {
            println!("  - {rec}");
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
            .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, stage: Stage) {
        self.spinner.set_message(format!("{}...", stage.description()));
    }

    fn stage_finished(&self, run: &PipelineRun) {
        let mark = if run.status() == RunStatus::Completed {
            "ok"
        } else {
            "!!"
        };
        self.spinner
            .println(format!("  [{mark}] {} {}", run.stage(), run.status()));
    }

    fn done(&self, _report: &PipelineReport) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init(cli: &Cli, force: bool) -> Result<()> {
    let path = match &cli.config {
        Some(p) => p.clone(),
        None => config_file_path()?,
    };
    if path.exists() && !force {
        return Err(eyre!(
            "config already exists at {}; pass --force to overwrite",
            path.display()
        ));
    }
    let path = init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
