//! Forgeline build worker.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use forgeline_config::{WorkerConfig, load_worker_config};
use forgeline_core::queue::JobQueue;
use forgeline_db::{PgJobQueue, create_pool, run_migrations};
use forgeline_executor::{LocalProcessRunner, ZipExtractor};
use forgeline_scheduler::{JobProcessor, JobWatcher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(about = "Builds queued Android release jobs", long_about = None)]
struct Cli {
    /// Worker settings file
    #[arg(long, env = "FORGELINE_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string of the job queue
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    /// Log output format
    #[arg(long, env = "FORGELINE_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Do not apply database migrations at startup
    #[arg(long)]
    skip_migrations: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<WorkerConfig> {
    let config = match path {
        Some(path) => load_worker_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    config.validate().context("Invalid worker settings")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_ref())?;
    info!(
        workspace = %config.workspace.root.display(),
        release_host = %config.release.host,
        "Loaded worker settings"
    );

    info!("Connecting to database...");
    let pool = create_pool(&cli.database_url)
        .await
        .context("Failed to connect to the job queue database")?;
    info!("Database connected");

    if !cli.skip_migrations {
        run_migrations(&pool)
            .await
            .context("Failed to apply database migrations")?;
    }

    let queue = Arc::new(PgJobQueue::new(pool));
    let processor = Arc::new(JobProcessor::from_config(
        queue.clone(),
        Arc::new(LocalProcessRunner::new()),
        Arc::new(ZipExtractor::new()),
        &config,
    ));
    let watcher =
        JobWatcher::new(processor).with_max_concurrent_jobs(config.limits.max_concurrent_jobs);

    let changes = queue
        .subscribe()
        .await
        .context("Failed to subscribe to job changes")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    let result = watcher.run(changes, shutdown).await;
    queue.close().await;

    let summary = result.context("Job change stream failed")?;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Worker stopped"
    );
    Ok(())
}
