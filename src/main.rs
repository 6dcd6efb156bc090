//! Entry point for the task-delegation engine server.

use anyhow::{Context, Result};
use delegate_engine::config::LogFormat;
use delegate_engine::{Engine, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable naming a JSON config file to load instead of the
/// built-in `production` preset (§6.4).
const CONFIG_PATH_VAR: &str = "DELEGATE_ENGINE_CONFIG";

fn load_config() -> Result<EngineConfig> {
    match std::env::var_os(CONFIG_PATH_VAR) {
        Some(path) => {
            EngineConfig::load_from_file(&path).with_context(|| format!("loading config from {path:?}"))
        }
        None => {
            let config = EngineConfig::production();
            config.validate().context("validating built-in production config")?;
            Ok(config)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("delegate_engine=info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_tracing(config.observability_log_format);

    info!(
        port = config.websocket_port.into_inner(),
        store = ?config.store_database_path,
        "starting delegate-engine"
    );

    let engine = Engine::build(config).await.context("building engine")?;
    engine.start().await.context("starting engine")?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    engine.stop();

    Ok(())
}
