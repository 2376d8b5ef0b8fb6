use std::collections::{HashMap, VecDeque};

use serde::Deserialize;

use crate::error::{AppError, TradeError};
use crate::model::candle::{window_start, Candle, CandleBuilder, WindowKey};
use crate::model::trade::{Trade, MAX_TIMESTAMP_MS};

/// What to do with a trade whose window has already been finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Reject the trade; emitted candles are final.
    #[default]
    Drop,
    /// Fold the trade into the retained emitted candle and re-emit it as a correction.
    Reopen,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window_ms: i64,
    pub origin_ms: i64,
    pub late_policy: LatePolicy,
    /// Emitted candles kept per instrument for corrections (reopen policy only).
    pub history_len: usize,
}

impl AggregatorConfig {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            origin_ms: 0,
            late_policy: LatePolicy::Drop,
            history_len: 16,
        }
    }

    pub fn with_origin(mut self, origin_ms: i64) -> Self {
        self.origin_ms = origin_ms;
        self
    }

    pub fn with_late_policy(mut self, late_policy: LatePolicy) -> Self {
        self.late_policy = late_policy;
        self
    }

    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    Final,
    Correction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub candle: Candle,
    pub kind: EmitKind,
}

impl Emission {
    fn finalized(candle: Candle) -> Self {
        Self {
            candle,
            kind: EmitKind::Final,
        }
    }
}

/// Tumbling-window OHLC aggregator.
///
/// Keeps one running candle per [`WindowKey`]. A trade landing in a strictly
/// later window of the same instrument closes every earlier live window of
/// that instrument. Each instrument carries a watermark (the earliest window
/// start still accepting trades); trades below it are late and handled per
/// [`LatePolicy`].
///
/// `close` follows arrival order, so trades must arrive in non-decreasing
/// timestamp order per instrument.
#[derive(Debug)]
pub struct CandleAggregator {
    config: AggregatorConfig,
    live: HashMap<WindowKey, CandleBuilder>,
    open_from: HashMap<String, i64>,
    history: HashMap<String, VecDeque<Candle>>,
}

impl CandleAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, AppError> {
        if config.window_ms <= 0 {
            return Err(AppError::Config(format!(
                "window length must be > 0, got {} ms",
                config.window_ms
            )));
        }
        if config.window_ms > i64::MAX - MAX_TIMESTAMP_MS {
            return Err(AppError::Config(format!(
                "window length {} ms is too large",
                config.window_ms
            )));
        }
        if config.origin_ms < 0 {
            return Err(AppError::Config(format!(
                "window origin must be >= 0, got {} ms",
                config.origin_ms
            )));
        }
        Ok(Self {
            config,
            live: HashMap::new(),
            open_from: HashMap::new(),
            history: HashMap::new(),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn window_key(&self, trade: &Trade) -> WindowKey {
        WindowKey::new(
            trade.product_id(),
            window_start(
                trade.timestamp_ms(),
                self.config.window_ms,
                self.config.origin_ms,
            ),
        )
    }

    /// Fold one trade into its window. Returns the candles this trade closed
    /// (or a correction under [`LatePolicy::Reopen`]).
    pub fn ingest(&mut self, trade: &Trade) -> Result<Vec<Emission>, TradeError> {
        let key = self.window_key(trade);

        if let Some(&open_from) = self.open_from.get(trade.product_id()) {
            if key.window_start_ms < open_from {
                return self.ingest_late(trade, key, open_from);
            }
        }

        let mut closed: Vec<WindowKey> = self
            .live
            .keys()
            .filter(|k| k.product_id == key.product_id && k.window_start_ms < key.window_start_ms)
            .cloned()
            .collect();
        closed.sort();

        let mut emissions = Vec::with_capacity(closed.len());
        for k in closed {
            if let Some(candle) = self.finalize(&k) {
                emissions.push(Emission::finalized(candle));
            }
        }

        let watermark = self
            .open_from
            .entry(key.product_id.clone())
            .or_insert(key.window_start_ms);
        *watermark = (*watermark).max(key.window_start_ms);

        let window_ms = self.config.window_ms;
        match self.live.get_mut(&key) {
            Some(builder) => builder.update(trade),
            None => {
                let builder = CandleBuilder::new(trade, key.window_start_ms, window_ms);
                self.live.insert(key, builder);
            }
        }

        Ok(emissions)
    }

    fn ingest_late(
        &mut self,
        trade: &Trade,
        key: WindowKey,
        open_from_ms: i64,
    ) -> Result<Vec<Emission>, TradeError> {
        if self.config.late_policy == LatePolicy::Reopen {
            let retained = self.history.get_mut(&key.product_id).and_then(|history| {
                history
                    .iter_mut()
                    .find(|c| c.window_start_ms == key.window_start_ms)
            });
            if let Some(candle) = retained {
                let mut builder = CandleBuilder::resume(candle);
                builder.update(trade);
                *candle = builder.finish();
                return Ok(vec![Emission {
                    candle: candle.clone(),
                    kind: EmitKind::Correction,
                }]);
            }
        }

        Err(TradeError::Late {
            product_id: key.product_id,
            window_start_ms: key.window_start_ms,
            open_from_ms,
        })
    }

    /// Close one window. `None` if the key is not live, so a window can
    /// never be emitted twice.
    pub fn finalize(&mut self, key: &WindowKey) -> Option<Candle> {
        let candle = self.live.remove(key)?.finish();

        let watermark = self
            .open_from
            .entry(candle.product_id.clone())
            .or_insert(candle.window_end_ms);
        *watermark = (*watermark).max(candle.window_end_ms);

        tracing::debug!(
            product_id = %candle.product_id,
            window_start_ms = candle.window_start_ms,
            trades = candle.trades,
            "Finalized candle"
        );

        self.remember(&candle);
        Some(candle)
    }

    /// Close every live window of one instrument, oldest first.
    pub fn finalize_instrument(&mut self, product_id: &str) -> Vec<Candle> {
        let mut keys: Vec<WindowKey> = self
            .live
            .keys()
            .filter(|k| k.product_id == product_id)
            .cloned()
            .collect();
        keys.sort();
        keys.iter().filter_map(|k| self.finalize(k)).collect()
    }

    /// Close the live windows of one instrument that end at or before
    /// `event_time_ms`, oldest first. Windows still open at that time stay
    /// live.
    pub fn finalize_expired(&mut self, product_id: &str, event_time_ms: i64) -> Vec<Candle> {
        let mut keys: Vec<WindowKey> = self
            .live
            .iter()
            .filter(|(k, b)| k.product_id == product_id && b.window_end_ms <= event_time_ms)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.iter().filter_map(|k| self.finalize(k)).collect()
    }

    /// Close every live window, ordered by instrument then window start.
    pub fn flush(&mut self) -> Vec<Candle> {
        let mut keys: Vec<WindowKey> = self.live.keys().cloned().collect();
        keys.sort();
        keys.iter().filter_map(|k| self.finalize(k)).collect()
    }

    /// Snapshot of a live candle.
    pub fn current(&self, key: &WindowKey) -> Option<Candle> {
        self.live.get(key).map(CandleBuilder::finish)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_instruments(&self) -> Vec<String> {
        let mut out: Vec<String> = self.live.keys().map(|k| k.product_id.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn open_from(&self, product_id: &str) -> Option<i64> {
        self.open_from.get(product_id).copied()
    }

    fn remember(&mut self, candle: &Candle) {
        if self.config.late_policy != LatePolicy::Reopen || self.config.history_len == 0 {
            return;
        }
        let history = self.history.entry(candle.product_id.clone()).or_default();
        history.push_back(candle.clone());
        while history.len() > self.config.history_len {
            history.pop_front();
        }
    }
}
