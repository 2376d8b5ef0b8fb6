use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::{CandleAggregator, EmitKind};
use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::error::PipelineError;
use crate::model::candle::Candle;
use crate::model::trade::Trade;
use crate::sink::CandleSink;

const MIN_PATIENCE_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Idle time after which an instrument's open windows are finalized.
    pub patience: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub max_retries: u32,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            patience: config.aggregator.patience(),
            retry_initial: config.sink.retry_initial(),
            retry_max: config.sink.retry_max(),
            max_retries: config.sink.max_retries,
        }
    }

    fn patience_check_period(&self) -> Duration {
        (self.patience / 4).max(MIN_PATIENCE_CHECK)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            patience: Duration::from_secs(10),
            retry_initial: Duration::from_millis(200),
            retry_max: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub trades_accepted: u64,
    pub trades_rejected: u64,
    pub trades_late: u64,
    pub candles_emitted: u64,
    pub corrections_emitted: u64,
    pub idle_finalized: u64,
}

/// Last accepted trade of an instrument: when it arrived and its event time.
#[derive(Debug, Clone, Copy)]
struct LastSeen {
    at: Instant,
    timestamp_ms: i64,
}

#[derive(Clone, Copy)]
enum SinkCall<'a> {
    Accept(&'a Candle),
    Flush,
}

/// Trade receiver -> aggregator -> sink.
///
/// Each sink call is awaited before the next trade is read, so a slow sink
/// fills the bounded trade channel and pauses the sources.
pub struct Pipeline<S> {
    aggregator: CandleAggregator,
    sink: S,
    settings: PipelineSettings,
    summary: PipelineSummary,
    last_seen: HashMap<String, LastSeen>,
    last_trade_at: Option<Instant>,
    unflushed: bool,
}

impl<S: CandleSink> Pipeline<S> {
    pub fn new(aggregator: CandleAggregator, sink: S, settings: PipelineSettings) -> Self {
        Self {
            aggregator,
            sink,
            settings,
            summary: PipelineSummary::default(),
            last_seen: HashMap::new(),
            last_trade_at: None,
            unflushed: false,
        }
    }

    /// Run until shutdown is signalled or the trade channel closes, then
    /// finalize every open window and flush the sink.
    pub async fn run(
        mut self,
        mut trades: mpsc::Receiver<Trade>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineSummary, PipelineError> {
        let mut patience_check = tokio::time::interval(self.settings.patience_check_period());
        patience_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // A dropped sender means nobody can request shutdown; the trade
        // channel closing still ends the run.
        let mut shutdown_open = true;

        tracing::info!(
            sink = self.sink.name(),
            window_ms = self.aggregator.config().window_ms,
            patience_ms = self.settings.patience.as_millis() as u64,
            "Pipeline started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            tracing::info!("Shutdown requested, flushing open candles");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => {
                            tracing::debug!(
                                "Shutdown sender dropped, running until trade stream closes"
                            );
                            shutdown_open = false;
                        }
                    }
                }
                maybe = trades.recv() => {
                    match maybe {
                        Some(trade) => self.on_trade(trade).await?,
                        None => {
                            tracing::info!("Trade stream closed, flushing open candles");
                            break;
                        }
                    }
                }
                _ = patience_check.tick() => self.on_patience_check().await?,
            }
        }

        self.drain().await?;
        tracing::info!(summary = ?self.summary, "Pipeline stopped");
        Ok(self.summary)
    }

    async fn on_trade(&mut self, trade: Trade) -> Result<(), PipelineError> {
        match self.aggregator.ingest(&trade) {
            Ok(emissions) => {
                self.summary.trades_accepted += 1;
                let now = Instant::now();
                let timestamp_ms = self
                    .last_seen
                    .get(trade.product_id())
                    .map_or(trade.timestamp_ms(), |seen| {
                        seen.timestamp_ms.max(trade.timestamp_ms())
                    });
                self.last_seen.insert(
                    trade.product_id().to_string(),
                    LastSeen {
                        at: now,
                        timestamp_ms,
                    },
                );
                self.last_trade_at = Some(now);
                for emission in emissions {
                    self.deliver(&emission.candle, emission.kind).await?;
                }
            }
            Err(e) if e.is_late() => {
                self.summary.trades_late += 1;
                tracing::warn!(
                    product_id = %trade.product_id(),
                    timestamp_ms = trade.timestamp_ms(),
                    error = %e,
                    "Dropping late trade"
                );
            }
            Err(e) => {
                self.summary.trades_rejected += 1;
                tracing::warn!(product_id = %trade.product_id(), error = %e, "Rejected trade");
            }
        }
        Ok(())
    }

    /// Finalize windows of idle instruments once their end has passed.
    ///
    /// Event time for a quiet instrument is extrapolated from its last trade
    /// timestamp plus the wall-clock time since that trade arrived, so a gap
    /// inside a window never closes it early.
    async fn on_patience_check(&mut self) -> Result<(), PipelineError> {
        let now = Instant::now();
        let patience = self.settings.patience;

        let idle: Vec<(String, i64)> = self
            .aggregator
            .live_instruments()
            .into_iter()
            .filter_map(|p| {
                let seen = self.last_seen.get(&p)?;
                let quiet_for = now.duration_since(seen.at);
                if quiet_for < patience {
                    return None;
                }
                let elapsed_ms = i64::try_from(quiet_for.as_millis()).unwrap_or(i64::MAX);
                Some((p, seen.timestamp_ms.saturating_add(elapsed_ms)))
            })
            .collect();

        for (product_id, event_time_ms) in idle {
            let candles = self.aggregator.finalize_expired(&product_id, event_time_ms);
            if candles.is_empty() {
                continue;
            }
            tracing::warn!(
                product_id = %product_id,
                candles = candles.len(),
                event_time_ms,
                patience_ms = patience.as_millis() as u64,
                "No trades within patience, finalizing elapsed windows"
            );
            for candle in candles {
                self.summary.idle_finalized += 1;
                self.deliver(&candle, EmitKind::Final).await?;
            }
        }

        let quiet = self
            .last_trade_at
            .map(|at| now.duration_since(at) >= patience)
            .unwrap_or(true);
        if quiet && self.unflushed {
            self.call_sink(SinkCall::Flush).await?;
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), PipelineError> {
        let candles = self.aggregator.flush();
        tracing::info!(open_windows = candles.len(), "Finalizing open windows");
        for candle in candles {
            self.deliver(&candle, EmitKind::Final).await?;
        }
        self.call_sink(SinkCall::Flush).await
    }

    async fn deliver(&mut self, candle: &Candle, kind: EmitKind) -> Result<(), PipelineError> {
        self.call_sink(SinkCall::Accept(candle)).await?;
        match kind {
            EmitKind::Final => self.summary.candles_emitted += 1,
            EmitKind::Correction => self.summary.corrections_emitted += 1,
        }
        tracing::info!(
            product_id = %candle.product_id,
            window_start_ms = candle.window_start_ms,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            trades = candle.trades,
            kind = ?kind,
            "Emitted candle"
        );
        Ok(())
    }

    async fn call_sink(&mut self, call: SinkCall<'_>) -> Result<(), PipelineError> {
        let mut backoff = ExponentialBackoff::new(
            self.settings.retry_initial,
            self.settings.retry_max,
            2.0,
        );
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = match call {
                SinkCall::Accept(candle) => self.sink.accept(candle).await,
                SinkCall::Flush => self.sink.flush().await,
            };
            match result {
                Ok(()) => {
                    self.unflushed = matches!(call, SinkCall::Accept(_));
                    return Ok(());
                }
                Err(e) if attempts <= self.settings.max_retries => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        sink = self.sink.name(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sink call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        sink = self.sink.name(),
                        attempts,
                        error = %e,
                        "Sink unavailable, giving up"
                    );
                    return Err(PipelineError::SinkUnavailable {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}
