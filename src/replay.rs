use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::error::TradeError;
use crate::model::trade::{RawTrade, Trade};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: u64,
    pub sent: u64,
    pub rejected: u64,
}

/// Parse one NDJSON line into a trade. `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<Trade>, TradeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let raw: RawTrade =
        serde_json::from_str(line).map_err(|e| TradeError::Undecodable(e.to_string()))?;
    Trade::try_from(raw).map(Some)
}

/// Historical trade source reading newline-delimited JSON trades.
pub struct ReplayReader {
    path: PathBuf,
}

impl ReplayReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Stream the file into `trade_tx`, waiting for channel capacity. Stops at
    /// EOF, on shutdown, or when the receiver goes away.
    pub async fn run(
        &self,
        trade_tx: mpsc::Sender<Trade>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ReplayStats> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let mut stats = ReplayStats::default();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line
                    .with_context(|| format!("failed to read {}", self.path.display()))?,
                _ = shutdown.changed() => break,
            };
            let Some(line) = line else {
                break;
            };
            stats.lines += 1;

            match parse_line(&line) {
                Ok(Some(trade)) => {
                    tokio::select! {
                        sent = trade_tx.send(trade) => {
                            if sent.is_err() {
                                tracing::info!("Trade receiver closed, stopping replay");
                                break;
                            }
                            stats.sent += 1;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    stats.rejected += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        line = stats.lines,
                        error = %e,
                        "Skipping malformed replay line"
                    );
                }
            }
        }

        tracing::info!(
            path = %self.path.display(),
            lines = stats.lines,
            sent = stats.sent,
            rejected = stats.rejected,
            "Replay finished"
        );
        Ok(stats)
    }
}
