use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;

use super::types::{decode_message, subscribe_message, KrakenMessage};
use crate::backoff::ExponentialBackoff;
use crate::event::{SourceEvent, WsConnectionStatus};
use crate::model::trade::Trade;

pub const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

enum LoopExit {
    Shutdown,
    ReceiverClosed,
}

pub struct KrakenWsClient {
    url: String,
    symbols: Vec<String>,
}

impl KrakenWsClient {
    pub fn new(url: &str, symbols: Vec<String>) -> Self {
        Self {
            url: url.to_string(),
            symbols,
        }
    }

    /// Connect and run the WebSocket loop with automatic reconnection.
    /// Trades go to `trade_tx` (awaiting capacity, so a slow pipeline pauses
    /// the reader); status goes to `status_tx`.
    pub async fn connect_and_run(
        &self,
        trade_tx: mpsc::Sender<Trade>,
        status_tx: mpsc::Sender<SourceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
        );
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self
                .connect_once(&trade_tx, &status_tx, &mut shutdown, &mut backoff)
                .await
            {
                Ok(exit) => {
                    let _ = status_tx
                        .send(SourceEvent::WsStatus(WsConnectionStatus::Disconnected))
                        .await;
                    if let LoopExit::ReceiverClosed = exit {
                        let _ = status_tx
                            .send(SourceEvent::LogMessage(
                                "Trade receiver closed, stopping source".to_string(),
                            ))
                            .await;
                    }
                    break;
                }
                Err(e) => {
                    let _ = status_tx
                        .send(SourceEvent::WsStatus(WsConnectionStatus::Disconnected))
                        .await;
                    let _ = status_tx
                        .send(SourceEvent::Error(format!("WS error: {:#}", e)))
                        .await;

                    let delay = backoff.next_delay();
                    let _ = status_tx
                        .send(SourceEvent::WsStatus(WsConnectionStatus::Reconnecting {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        }))
                        .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => {
                            let _ = status_tx
                                .send(SourceEvent::LogMessage("Shutdown during reconnect".to_string()))
                                .await;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn connect_once(
        &self,
        trade_tx: &mpsc::Sender<Trade>,
        status_tx: &mpsc::Sender<SourceEvent>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<LoopExit> {
        let _ = status_tx
            .send(SourceEvent::LogMessage(format!("Connecting to {}", self.url)))
            .await;

        let (ws_stream, _resp) = tokio_tungstenite::connect_async(&self.url)
            .await
            .context("WebSocket connect failed")?;

        let _ = status_tx
            .send(SourceEvent::WsStatus(WsConnectionStatus::Connected))
            .await;

        let (mut write, mut read) = ws_stream.split();
        write
            .send(tungstenite::Message::Text(subscribe_message(&self.symbols)))
            .await
            .context("failed to send trade subscription")?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            match decode_message(&text) {
                                Ok(KrakenMessage::Trades(trades)) => {
                                    for trade in trades {
                                        match trade {
                                            Ok(trade) => {
                                                tokio::select! {
                                                    sent = trade_tx.send(trade) => {
                                                        if sent.is_err() {
                                                            return Ok(LoopExit::ReceiverClosed);
                                                        }
                                                    }
                                                    _ = shutdown.changed() => {
                                                        return Ok(LoopExit::Shutdown);
                                                    }
                                                }
                                            }
                                            Err(e) => {
                                                let _ = status_tx.send(SourceEvent::TradeRejected(e)).await;
                                            }
                                        }
                                    }
                                }
                                Ok(KrakenMessage::Ack { method, success, error }) => {
                                    if success {
                                        backoff.reset();
                                        let _ = status_tx
                                            .send(SourceEvent::WsStatus(WsConnectionStatus::Subscribed {
                                                symbols: self.symbols.clone(),
                                            }))
                                            .await;
                                    } else {
                                        return Err(anyhow::anyhow!(
                                            "{} rejected: {}",
                                            method,
                                            error.unwrap_or_else(|| "unknown error".to_string())
                                        ));
                                    }
                                }
                                Ok(KrakenMessage::Heartbeat) | Ok(KrakenMessage::Other) => {}
                                Err(e) => {
                                    tracing::debug!(error = %e, "Failed to parse WS message");
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Ping(_))) => {
                            // tokio-tungstenite answers pings on the next read/write
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            return Err(anyhow::anyhow!("WebSocket closed by server: {:?}", frame));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(anyhow::anyhow!("WebSocket read error: {}", e));
                        }
                        None => {
                            return Err(anyhow::anyhow!("WebSocket stream ended"));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    return Ok(LoopExit::Shutdown);
                }
            }
        }
    }
}
