//! CascadeBot entry point
//!
//! `cascadebot` runs the pipeline until SIGINT/SIGTERM.
//! `cascadebot --print-config` prints the effective configuration and exits.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cascadebot::config::AppConfig;
use cascadebot::engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    if std::env::args().any(|a| a == "--print-config") {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_tracing(&config);
    info!(config = %config.digest(), "🚀 CascadeBot {} starting", config.bot.tag);

    let engine = Arc::new(Engine::from_config(&config)?);
    engine.warm_start().await;
    info!("{}", engine.ledger().summary_string());

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let engine_handle = tokio::spawn(Arc::clone(&engine).run(shutdown_tx.subscribe()));

    info!("Pipeline running. Press Ctrl+C to stop.");
    wait_for_signal().await?;

    info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    tokio::select! {
        _ = engine_handle => {
            info!("Engine stopped");
        }
        _ = tokio::time::sleep(Duration::from_secs(10)) => {
            warn!("Shutdown timeout exceeded, forcing exit");
        }
    }

    let stats = engine.stats();
    info!(
        cycles = stats.cycles_run,
        skipped = stats.cycles_skipped,
        opened = stats.positions_opened,
        closed = stats.positions_closed,
        "{}",
        engine.ledger().summary_string()
    );
    info!("Shutdown complete");
    Ok(())
}

/// RUST_LOG wins over the configured level.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
