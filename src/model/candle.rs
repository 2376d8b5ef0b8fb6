use serde::{Deserialize, Serialize};

use super::trade::Trade;

/// Start of the tumbling window containing `timestamp_ms`, on a grid of
/// `window_ms` buckets anchored at `origin_ms`.
pub fn window_start(timestamp_ms: i64, window_ms: i64, origin_ms: i64) -> i64 {
    assert!(window_ms > 0, "window_ms must be > 0");
    let offset = timestamp_ms
        .checked_sub(origin_ms)
        .unwrap_or_else(|| panic!("window offset overflows i64: {timestamp_ms} - {origin_ms}"));
    timestamp_ms - offset.rem_euclid(window_ms)
}

/// Identifies one candle's aggregation bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub product_id: String,
    pub window_start_ms: i64,
}

impl WindowKey {
    pub fn new(product_id: impl Into<String>, window_start_ms: i64) -> Self {
        Self {
            product_id: product_id.into(),
            window_start_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub product_id: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: u64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl Candle {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.product_id.clone(), self.window_start_ms)
    }

    pub fn record(&self) -> CandleRecord {
        CandleRecord {
            timestamp: self.window_start_ms,
            product_id: self.product_id.clone(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Row shape handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub timestamp: i64,
    pub product_id: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Aggregates trades into a single candle over one window.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    pub product_id: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: u64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl CandleBuilder {
    /// Start a new candle from the first trade of a window.
    pub fn new(trade: &Trade, window_start_ms: i64, window_ms: i64) -> Self {
        assert!(window_ms > 0, "window_ms must be > 0");
        let window_end_ms = window_start_ms.checked_add(window_ms).unwrap_or_else(|| {
            panic!("window end overflows i64: {window_start_ms} + {window_ms}")
        });
        let price = trade.price();
        Self {
            product_id: trade.product_id().to_string(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: trade.volume(),
            trades: 1,
            window_start_ms,
            window_end_ms,
        }
    }

    /// Reopen an emitted candle for a correction.
    pub fn resume(candle: &Candle) -> Self {
        Self {
            product_id: candle.product_id.clone(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            trades: candle.trades,
            window_start_ms: candle.window_start_ms,
            window_end_ms: candle.window_end_ms,
        }
    }

    /// Fold the next trade into the candle. `open` never moves.
    pub fn update(&mut self, trade: &Trade) {
        let price = trade.price();
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += trade.volume();
        self.trades += 1;
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.window_start_ms && timestamp_ms < self.window_end_ms
    }

    pub fn finish(&self) -> Candle {
        Candle {
            product_id: self.product_id.clone(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trades: self.trades,
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
        }
    }
}
