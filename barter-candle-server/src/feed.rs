use barter_candle::engine::CandleEngine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

/// One line of the newline-delimited JSON tick feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickMessage {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    /// Epoch milliseconds. Defaults to receipt time when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl TickMessage {
    /// Tick time, `None` when no timestamp was sent. Errors on timestamps chrono cannot represent.
    pub fn time(&self) -> Result<Option<DateTime<Utc>>, String> {
        self.timestamp
            .map(|millis| {
                DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| format!("timestamp out of range: {millis}"))
            })
            .transpose()
    }
}

/// Accept tick producers on `addr`, ingesting every line they send.
pub async fn serve(addr: SocketAddr, engine: CandleEngine) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "tick feed listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "tick producer connected");
        tokio::spawn(handle_producer(stream, peer_addr, engine.clone()));
    }
}

async fn handle_producer(stream: TcpStream, peer_addr: SocketAddr, engine: CandleEngine) {
    let mut lines = BufReader::new(stream).lines();
    let (mut ingested, mut rejected) = (0u64, 0u64);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(%peer_addr, %error, "tick feed read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match ingest_line(&engine, &line) {
            Ok(events) => {
                ingested += 1;
                debug!(%peer_addr, events, "ingested tick");
            }
            Err(error) => {
                rejected += 1;
                warn!(%peer_addr, %error, line = %line, "rejected tick");
            }
        }
    }

    info!(%peer_addr, ingested, rejected, "tick producer disconnected");
}

fn ingest_line(engine: &CandleEngine, line: &str) -> Result<usize, String> {
    let tick = serde_json::from_str::<TickMessage>(line).map_err(|error| error.to_string())?;
    let time = tick.time()?;
    engine
        .ingest_tick(&tick.symbol, tick.price, tick.size, time)
        .map_err(|error| error.to_string())
}
