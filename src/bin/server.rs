//! Reverie server
//!
//! Run with: reverie-server

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reverie::api::{ApiServer, AppState};
use reverie::error::{Result, ReverieError};
use reverie::images::{create_image_generator, ImageSweeper};
use reverie::llm::create_completer;
use reverie::pipeline::{ConsolidationContext, ConsolidationOrchestrator, ConsolidationWorker};
use reverie::storage::{MemoryStore, Storage};
use reverie::types::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "reverie-server")]
#[command(about = "Reverie memory consolidation server")]
#[command(version)]
struct Args {
    /// Database path
    #[arg(
        long,
        env = "REVERIE_DB_PATH",
        default_value = "~/.local/share/reverie/reverie.db"
    )]
    db_path: String,

    /// Storage mode (local or cloud-safe)
    #[arg(long, env = "REVERIE_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// HTTP listen address
    #[arg(long, env = "REVERIE_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Completion provider (openai = any OpenAI-compatible endpoint)
    #[arg(long, env = "REVERIE_LLM_PROVIDER", default_value = "openai")]
    llm_provider: String,

    /// Completion API key
    #[arg(long, env = "REVERIE_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Completion base URL (default: Groq)
    #[arg(long, env = "REVERIE_LLM_BASE_URL")]
    llm_base_url: Option<String>,

    #[arg(long, env = "REVERIE_LLM_MODEL", default_value = DEFAULT_COMPLETION_MODEL)]
    llm_model: String,

    #[arg(long, env = "REVERIE_LLM_TEMPERATURE", default_value = "0.3")]
    llm_temperature: f32,

    #[arg(long, env = "REVERIE_LLM_MAX_TOKENS", default_value = "4096")]
    llm_max_tokens: u32,

    #[arg(long, env = "REVERIE_LLM_TOP_P", default_value = "0.95")]
    llm_top_p: f32,

    /// Seconds between consolidation batches
    #[arg(long, env = "REVERIE_POLL_INTERVAL", default_value = "60")]
    poll_interval_secs: u64,

    /// Extra look-back in seconds added to each fetch
    #[arg(long, env = "REVERIE_SAFETY_BUFFER", default_value = "2")]
    safety_buffer_secs: u64,

    /// Limit for a single completion call in seconds
    #[arg(long, env = "REVERIE_CALL_TIMEOUT", default_value = "120")]
    call_timeout_secs: u64,

    /// Limit for analysis, planning and execution of one batch in seconds
    #[arg(long, env = "REVERIE_BATCH_DEADLINE", default_value = "900")]
    batch_deadline_secs: u64,

    /// Cleanup policy (always or require-all-succeeded)
    #[arg(long, env = "REVERIE_CLEANUP_POLICY", default_value = "always")]
    cleanup_policy: String,

    /// Skip the consolidation batch normally run at startup
    #[arg(long, env = "REVERIE_NO_STARTUP_RUN")]
    no_startup_run: bool,

    /// Enable the image generation sweep
    #[arg(long, env = "REVERIE_IMAGES")]
    images: bool,

    /// Image API key
    #[arg(long, env = "REVERIE_IMAGE_API_KEY", hide_env_values = true)]
    image_api_key: Option<String>,

    /// Image API base URL (default: OpenAI)
    #[arg(long, env = "REVERIE_IMAGE_BASE_URL")]
    image_base_url: Option<String>,

    #[arg(long, env = "REVERIE_IMAGE_MODEL", default_value = "dall-e-3")]
    image_model: String,

    #[arg(long, env = "REVERIE_IMAGE_SIZE", default_value = "1024x1024")]
    image_size: String,

    /// Seconds between image sweeps
    #[arg(long, env = "REVERIE_IMAGE_SWEEP_INTERVAL", default_value = "5")]
    image_sweep_interval_secs: u64,

    /// Log output format
    #[arg(long, env = "REVERIE_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    // Expand ~ in path
    let db_path = shellexpand::tilde(&args.db_path).to_string();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let storage_mode: StorageMode = args.storage_mode.parse().map_err(ReverieError::Config)?;
    let storage = Storage::open(StorageConfig {
        db_path,
        storage_mode,
    })?;
    if let Some(warning) = storage.storage_mode_warning() {
        tracing::warn!("{}", warning);
    }
    let store: Arc<dyn MemoryStore> = Arc::new(storage);

    let completer = create_completer(&CompletionConfig {
        provider: args.llm_provider,
        api_key: args.llm_api_key,
        base_url: args.llm_base_url,
        model: args.llm_model,
        temperature: args.llm_temperature,
        max_tokens: Some(args.llm_max_tokens),
        top_p: args.llm_top_p,
    })?;

    let consolidation = ConsolidationConfig {
        poll_interval_secs: args.poll_interval_secs,
        safety_buffer_secs: args.safety_buffer_secs,
        call_timeout_secs: args.call_timeout_secs,
        batch_deadline_secs: args.batch_deadline_secs,
        cleanup_policy: args.cleanup_policy.parse().map_err(ReverieError::Config)?,
    };
    tracing::info!(
        model = completer.model_name(),
        interval = consolidation.poll_interval_secs,
        cleanup = ?consolidation.cleanup_policy,
        "Starting consolidation worker"
    );
    let orchestrator = ConsolidationOrchestrator::new(store.clone(), completer, consolidation);
    let worker = Arc::new(ConsolidationWorker::start(
        Arc::new(orchestrator),
        ConsolidationContext::new(),
        !args.no_startup_run,
    ));

    let image_config = ImageConfig {
        enabled: args.images,
        api_key: args.image_api_key,
        base_url: args.image_base_url,
        model: args.image_model,
        size: args.image_size,
        sweep_interval_secs: args.image_sweep_interval_secs,
    };
    let images = create_image_generator(&image_config)?
        .map(|generator| Arc::new(ImageSweeper::new(store.clone(), generator)));
    let image_task = images.clone().map(|sweeper| {
        tracing::info!(
            interval = image_config.sweep_interval_secs,
            "Starting image sweep"
        );
        sweeper.spawn(std::time::Duration::from_secs(
            image_config.sweep_interval_secs.max(1),
        ))
    });

    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| ReverieError::Config(format!("invalid bind address {}: {}", args.bind, e)))?;
    let state = AppState {
        store,
        worker: worker.clone(),
        images,
    };

    ApiServer::new(state, addr)
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    if let Some(task) = image_task {
        task.abort();
    }
    // Waits for a batch in flight to finish
    worker.stop().await?;
    tracing::info!("Reverie server stopped");

    Ok(())
}
