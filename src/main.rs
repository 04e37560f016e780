//! Marketplace realtime worker.
//!
//! Loads configuration, starts the real-time engine and follows the
//! conversations named on the command line until interrupted.

use market_core::config::AppConfig;
use market_core::error::AppError;
use market_realtime::{ChangeRecord, ChannelHandlers, ChannelStatus, PresenceState, RealtimeEngine};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Realtime worker error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from files and environment
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("MARKET_ENV").unwrap_or_else(|_| "development".to_string());

    match std::env::var("MARKET_CONFIG_DIR") {
        Ok(config_dir) => AppConfig::load_from(&config_dir, &env),
        Err(_) => AppConfig::load(&env),
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting marketplace realtime v{}", env!("CARGO_PKG_VERSION"));

    let engine = RealtimeEngine::from_config(&config.realtime)?;

    for conversation_id in std::env::args().skip(1) {
        let handlers = logging_handlers(&conversation_id)?;
        engine.channels.subscribe(&conversation_id, handlers)?;
    }

    tokio::signal::ctrl_c().await?;

    engine.shutdown().await
}

/// Handlers that write every event to the log.
fn logging_handlers(conversation_id: &str) -> Result<ChannelHandlers, AppError> {
    let on_message = conversation_id.to_string();
    let on_presence = conversation_id.to_string();
    let on_status = conversation_id.to_string();

    ChannelHandlers::builder()
        .on_message(move |record: ChangeRecord| {
            let body = record.column_text("body").unwrap_or_default();
            tracing::info!(conversation_id = %on_message, body = %body, "New message");
        })
        .on_presence(move |state: PresenceState| {
            tracing::info!(conversation_id = %on_presence, present = state.len(), "Presence sync");
        })
        .on_status_change(move |status: &ChannelStatus| {
            tracing::info!(conversation_id = %on_status, status = %status, "Channel status");
        })
        .build()
}
