mod output;
mod sites;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvest_core::isolation::run_worker_process;
use harvest_core::{
    CrashPolicy, IsolationModel, ProcessCommand, RunConfig, RunContext, RunReport, Supervisor,
    WorkerState,
};

use crate::output::{OutputFormat, write_results};
use crate::sites::{Site, SiteArgs};

#[derive(Parser)]
#[command(name = "harvest", version, about = "Fault-tolerant parallel web scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the book catalogue
    Crawl {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        site: SiteArgs,
    },

    /// Run an offline synthetic crawl (no network)
    Demo {
        /// Listing pages to seed
        #[arg(long, default_value_t = 3)]
        pages: u32,

        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        site: SiteArgs,
    },

    /// Worker process entry point (started by the supervisor)
    #[command(hide = true)]
    Worker {
        #[arg(long, value_enum)]
        site: Site,

        #[arg(long)]
        worker_id: usize,

        #[arg(long, default_value_t = 2000)]
        pop_timeout_ms: u64,

        #[command(flatten)]
        site_args: SiteArgs,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Number of parallel workers
    #[arg(short, long, env = "HARVEST_WORKERS", default_value_t = 3)]
    workers: usize,

    /// Worker isolation: thread or process
    #[arg(long, env = "HARVEST_ISOLATION", default_value = "thread")]
    isolation: IsolationModel,

    /// Supervisor liveness check interval in milliseconds
    #[arg(long, env = "HARVEST_POLL_INTERVAL_MS", default_value_t = 3000)]
    poll_interval_ms: u64,

    /// How long an idle worker waits for a task, in milliseconds
    #[arg(long, env = "HARVEST_POP_TIMEOUT_MS", default_value_t = 2000)]
    pop_timeout_ms: u64,

    /// What to do with a crashed worker's task: requeue or abandon
    #[arg(long, env = "HARVEST_CRASH_POLICY", default_value = "requeue")]
    crash_policy: CrashPolicy,

    /// Deliveries per task before it is dead-lettered
    #[arg(long, env = "HARVEST_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Restarts allowed per worker before the run aborts
    #[arg(long, env = "HARVEST_RESTART_LIMIT")]
    restart_limit: Option<u32>,

    /// Write results here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Result format
    #[arg(long, value_enum, default_value_t = OutputFormat::Jsonl)]
    format: OutputFormat,
}

impl RunArgs {
    fn to_config(&self, site: Site, site_args: &SiteArgs) -> Result<RunConfig> {
        let mut config = RunConfig::default()
            .with_worker_count(self.workers)
            .with_isolation(self.isolation)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_pop_timeout(Duration::from_millis(self.pop_timeout_ms))
            .with_crash_policy(self.crash_policy)
            .with_max_attempts(self.max_attempts)
            .with_restart_limit(self.restart_limit);

        if self.isolation == IsolationModel::Process {
            let program = std::env::current_exe().context("Failed to locate the harvest binary")?;
            let command = ProcessCommand::new(program)
                .args(["worker", "--site", site.as_str()])
                .args(["--pop-timeout-ms".to_string(), self.pop_timeout_ms.to_string()])
                .args(site_args.to_worker_args());
            config = config.with_worker_command(command);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr: a worker's stdout carries the supervisor protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl { run, site } => cmd_run(Site::Catalogue, &run, &site, 0).await,
        Commands::Demo { pages, run, site } => cmd_run(Site::Demo, &run, &site, pages).await,
        Commands::Worker {
            site,
            worker_id,
            pop_timeout_ms,
            site_args,
        } => cmd_worker(site, worker_id, pop_timeout_ms, &site_args).await,
    }
}

async fn cmd_run(site: Site, run: &RunArgs, site_args: &SiteArgs, pages: u32) -> Result<ExitCode> {
    let config = run.to_config(site, site_args)?;
    let registry = sites::build_registry(site, site_args)?;
    let seed = sites::seed(site, site_args, pages).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received, letting workers finish their tasks");
                cancel.cancel();
            }
        }
    });

    let ctx = RunContext::with_cancellation(config, registry, cancel);
    let supervisor = Supervisor::new(ctx);
    supervisor.seed(seed);
    let report = supervisor.run().await.context("Run failed")?;

    match &run.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            write_results(BufWriter::new(file), &report.results, run.format)?;
        }
        None => write_results(std::io::stdout().lock(), &report.results, run.format)?,
    }
    print_summary(&report);

    Ok(ExitCode::SUCCESS)
}

async fn cmd_worker(
    site: Site,
    worker_id: usize,
    pop_timeout_ms: u64,
    site_args: &SiteArgs,
) -> Result<ExitCode> {
    // Ctrl-C reaches the whole process group. The supervisor decides when
    // this worker stops, so swallow it here.
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {}
    });

    let registry = sites::build_registry(site, site_args)?;
    let state = run_worker_process(worker_id, registry, Duration::from_millis(pop_timeout_ms)).await;
    Ok(match state {
        WorkerState::Crashed => ExitCode::FAILURE,
        WorkerState::Running | WorkerState::Done => ExitCode::SUCCESS,
    })
}

fn print_summary(report: &RunReport) {
    eprintln!(
        "Finished in {:.1}s: {} results, {} dead letters, {} crashes, {} spawns{}",
        report.elapsed.as_secs_f64(),
        report.results.len(),
        report.dead_letters.len(),
        report.crashes,
        report.spawns,
        if report.cancelled {
            format!(" (cancelled, {} tasks unfinished)", report.unfinished.len())
        } else {
            String::new()
        }
    );
    for (worker_id, crashes) in report.worker_crashes.iter().filter(|(_, c)| **c > 0) {
        eprintln!("  worker {worker_id}: {crashes} crashes");
    }
    for dead in &report.dead_letters {
        eprintln!(
            "  gave up on {} {} after {} attempts: {}",
            dead.task.operation, dead.task.id, dead.task.attempt, dead.error
        );
    }
}
