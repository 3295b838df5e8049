use barter_candle::engine::CandleEngine;
use config::ServerConfig;
use tracing::{error, info};

mod config;
mod feed;
mod ws;

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting barter-candle server");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid server configuration");
            return;
        }
    };

    let engine = match CandleEngine::new(config.engine.clone()) {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "failed to initialise candle engine");
            return;
        }
    };

    let heartbeat = engine.spawn_heartbeat();

    info!("WebSocket clients: ws://{}", config.ws_addr);
    info!("Tick producers: tcp://{} (newline-delimited JSON)", config.tick_addr);

    tokio::select! {
        result = ws::serve(config.ws_addr, engine.clone()) => {
            if let Err(error) = result {
                error!(%error, addr = %config.ws_addr, "WebSocket server stopped");
            }
        }
        result = feed::serve(config.tick_addr, engine.clone()) => {
            if let Err(error) = result {
                error!(%error, addr = %config.tick_addr, "tick feed stopped");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown signal received"),
                Err(error) => error!(%error, "failed to listen for shutdown signal"),
            }
        }
    }

    engine.shutdown();
    heartbeat.abort();
    info!(stats = ?engine.stats(), "barter-candle server stopped");
}

/// Initialise logging, `RUST_LOG` filtered (default `info`). Set `LOG_FORMAT=json` for JSON lines.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}
