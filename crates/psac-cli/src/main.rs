use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psac_core::{fingerprint, SourceChannel};
use psac_parser::{ProfileRegistry, DEFAULT_PROFILE};
use psac_storage::{
    ChannelStore, HttpMessageSource, InMemoryStore, MemoryNotificationSink, PgStore, PipelineStore,
};
use psac_sync::{IngestionScheduler, ReconciliationEngine, SyncConfig, WorkerState};
use psac_web::AppState;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "psac-cli")]
#[command(about = "PlayStation account catalog ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and the admin API until interrupted.
    Run,
    /// Authenticate and run a single ingestion cycle.
    Once,
    /// Parse a listing from a file (or stdin) and print the result as JSON.
    Parse {
        file: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_PROFILE)]
        profile: String,
        #[arg(long, default_value = "0")]
        key: String,
    },
    /// Print the content fingerprint of a file (or stdin).
    Fingerprint { file: Option<PathBuf> },
    /// Apply database migrations.
    Migrate,
    /// Register or update a source channel.
    AddChannel {
        handle: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = DEFAULT_PROFILE)]
        profile: String,
        #[arg(long, default_value = "0")]
        delay_secs: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("PSAC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config).await?,
        Commands::Once => {
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store.clone())?;
            let notifier = Arc::new(MemoryNotificationSink::logging());
            let scheduler = build_scheduler(&config, store, notifier, engine, Arc::new(WorkerState::default()))?;
            let report = scheduler.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Parse { file, profile, key } => {
            let registry = load_profiles(&config)?;
            let text = read_input(file.as_deref()).await?;
            let parsed = psac_parser::MessageParser::new().parse(&text, &key, registry.rules_for(&profile));
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Commands::Fingerprint { file } => {
            let text = read_input(file.as_deref()).await?;
            println!("{}", fingerprint(&text));
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::AddChannel {
            handle,
            name,
            profile,
            delay_secs,
        } => {
            let store = open_store(&config).await?;
            let channel = store
                .register_channel(SourceChannel {
                    id: 0,
                    name: name.unwrap_or_else(|| handle.clone()),
                    external_id: handle,
                    is_active: true,
                    profile,
                    delay_secs,
                    bulk_limit: None,
                    window_hours: None,
                    last_scraped_at: None,
                    last_scraped_external_id: None,
                    last_swept_at: None,
                })
                .await
                .context("registering channel")?;
            println!("channel {} registered as {}", channel.external_id, channel.id);
        }
    }

    Ok(())
}

async fn run(config: &SyncConfig) -> Result<()> {
    let store = open_store(config).await?;
    let notifier = Arc::new(MemoryNotificationSink::logging());
    let worker = Arc::new(WorkerState::new(config.scheduler_enabled));
    let engine = build_engine(config, store.clone())?;
    let scheduler = build_scheduler(config, store.clone(), notifier.clone(), engine.clone(), worker.clone())?;

    let cancel = CancellationToken::new();
    let web = tokio::spawn(psac_web::serve(
        AppState::new(store, worker, engine, notifier),
        config.web_port,
        cancel.clone(),
    ));

    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
        }
        signal.cancel();
    });

    // An authentication failure leaves the worker in Error; the admin API
    // stays up so the state can be inspected.
    if let Err(err) = scheduler.run(cancel.clone()).await {
        error!(error = %format!("{err:#}"), "scheduler halted");
        cancel.cancelled().await;
    }

    web.await.context("admin api task panicked")??;
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn PipelineStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to database")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using a volatile in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn load_profiles(config: &SyncConfig) -> Result<ProfileRegistry> {
    match &config.rules_path {
        Some(path) => ProfileRegistry::from_path(path)
            .with_context(|| format!("loading parsing profiles from {}", path.display())),
        None => Ok(ProfileRegistry::default()),
    }
}

fn build_engine(config: &SyncConfig, store: Arc<dyn PipelineStore>) -> Result<Arc<ReconciliationEngine>> {
    Ok(Arc::new(ReconciliationEngine::new(store, Arc::new(load_profiles(config)?))))
}

fn build_scheduler(
    config: &SyncConfig,
    store: Arc<dyn PipelineStore>,
    notifier: Arc<MemoryNotificationSink>,
    engine: Arc<ReconciliationEngine>,
    worker: Arc<WorkerState>,
) -> Result<IngestionScheduler> {
    let source = HttpMessageSource::new(config.source_config()).context("building message source client")?;
    Ok(IngestionScheduler::new(store, Arc::new(source), notifier, engine, worker))
}

async fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading stdin")?;
            Ok(text)
        }
    }
}
