//! # placevault
//!
//! Continuous archiver for a collaborative canvas feed.
//!
//! Subscribes to every announced canvas partition, downloads each snapshot
//! exactly once, diffs it, resolves the authorship of every changed tile in
//! fixed-size batches and records the result as pixel history.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};

use placevault_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use placevault_core::{ArchiveContext, ArchiverRuntime, MIGRATOR};
use placevault_server::{build_ports, telemetry};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "placevault")]
#[command(about = "Continuous archiver for a live collaborative canvas")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ConfigArgs {
    /// Path to a placevault.toml file
    #[arg(long, global = true, env = "PLACEVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the archiver until interrupted (the default)
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Load and validate the configuration, print a summary and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_archiver(config).await,
        Command::Migrate => run_migrations(&config).await,
        Command::CheckConfig => {
            print_summary(&config);
            Ok(())
        }
    }
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    telemetry::init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

async fn run_archiver(config: Config) -> anyhow::Result<()> {
    info!(
        feed = %config.feed.url,
        resolver = %config.resolver.url,
        workers = config.pipeline.worker_count,
        batch_size = config.resolver.batch.batch_size,
        anomaly_threshold = config.pipeline.anomaly_threshold,
        "archiver configuration in effect"
    );

    let (ports, backends) = build_ports(&config).await?;
    info!(%backends, "backends ready");

    let context = Arc::new(
        ArchiveContext::new(config.archiver_config(), ports)
            .context("invalid archiver configuration")?,
    );
    let runtime = ArchiverRuntime::start(Arc::clone(&context))
        .await
        .context("failed to start the archiver")?;

    shutdown_signal().await;
    runtime.shutdown().await;
    Ok(())
}

async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let database = config
        .database
        .as_ref()
        .context("DATABASE_URL is required to run migrations")?;
    let pool = sqlx::PgPool::connect(&database.url)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

fn print_summary(config: &Config) {
    let archiver = config.archiver_config();
    println!("feed          {}", config.feed.url);
    println!("resolver      {}", config.resolver.url);
    println!("redis         {}", if config.redis.is_some() { "configured" } else { "in-memory" });
    println!("database      {}", if config.database.is_some() { "configured" } else { "in-memory" });
    match &config.blob.root {
        Some(root) => println!("blobs         {}", root.display()),
        None => println!("blobs         in-memory"),
    }
    println!("workers       {}", archiver.worker_count);
    println!("batch size    {}", archiver.batch.batch_size);
    println!("lease ttl     {:?}", archiver.lease_ttl);
    println!("cutoff        {}", archiver.anomaly_threshold);
    println!("log length    {}", config.pipeline.event_log_max_len);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
