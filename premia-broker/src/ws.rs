//! WebSocket tick stream from the broker gateway.
//!
//! One task per source; decoded ticks are posted to the engine's bounded
//! channel. The task reconnects with a fixed backoff until shutdown.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use premia_core::{Tick, TickSource};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct QuoteFrame {
    symbol: String,
    data: QuotePayload,
}

#[derive(Debug, Deserialize)]
struct QuotePayload {
    ltp: Decimal,
    #[serde(default)]
    volume: i64,
    #[serde(default)]
    timestamp_ms: Option<i64>,
}

fn decode_tick(text: &str, source: TickSource) -> Option<Tick> {
    let frame: QuoteFrame = serde_json::from_str(text).ok()?;
    if frame.data.ltp <= Decimal::ZERO {
        return None;
    }
    let ts = frame
        .data
        .timestamp_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Some(Tick {
        symbol: frame.symbol,
        ts,
        last_price: frame.data.ltp,
        session_volume: frame.data.volume,
        source,
    })
}

/// Connect to `ws_url`, subscribe the symbol window in quote mode and pump
/// decoded ticks into `tx` until the channel closes.
pub fn spawn_tick_stream(
    ws_url: String,
    api_key: String,
    symbols: Vec<String>,
    source: TickSource,
    tx: mpsc::Sender<Tick>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if tx.is_closed() {
                return;
            }
            match connect_async(&ws_url).await {
                Ok((mut socket, _)) => {
                    info!(?source, url = %ws_url, "tick stream connected");
                    let subscribe = json!({
                        "action": "subscribe",
                        "mode": "quote",
                        "apikey": api_key,
                        "symbols": symbols,
                    });
                    if let Err(err) = socket.send(Message::Text(subscribe.to_string())).await {
                        warn!(?source, error = %err, "tick stream subscribe failed");
                    } else {
                        while let Some(frame) = socket.next().await {
                            match frame {
                                Ok(Message::Text(text)) => {
                                    if let Some(tick) = decode_tick(&text, source) {
                                        if tx.send(tick).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = socket.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    }
                    warn!(?source, "tick stream disconnected");
                }
                Err(err) => {
                    warn!(?source, error = %err, "tick stream connect failed");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}
