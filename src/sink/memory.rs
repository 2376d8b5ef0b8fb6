use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::CandleSink;
use crate::error::SinkError;
use crate::model::candle::Candle;

#[derive(Debug, Default)]
struct Shared {
    candles: Mutex<Vec<Candle>>,
    fail_next: AtomicU32,
    flushes: AtomicU64,
}

/// In-memory sink. Clone a [`MemorySinkHandle`] before handing the sink to
/// a pipeline to inspect what it received.
#[derive(Debug, Default)]
pub struct MemorySink {
    shared: Arc<Shared>,
}

#[derive(Debug, Clone)]
pub struct MemorySinkHandle {
    shared: Arc<Shared>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MemorySinkHandle {
        MemorySinkHandle {
            shared: self.shared.clone(),
        }
    }
}

impl MemorySinkHandle {
    pub fn candles(&self) -> Vec<Candle> {
        self.shared
            .candles
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shared.candles.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flushes(&self) -> u64 {
        self.shared.flushes.load(Ordering::Relaxed)
    }

    /// Make the next `n` sink calls fail as if the store were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::Relaxed);
    }

    fn take_failure(&self) -> bool {
        self.shared
            .fail_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CandleSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn accept(&mut self, candle: &Candle) -> Result<(), SinkError> {
        let handle = self.handle();
        if handle.take_failure() {
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        self.shared
            .candles
            .lock()
            .map_err(|_| SinkError::Unavailable("memory sink lock poisoned".to_string()))?
            .push(candle.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.handle().take_failure() {
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        self.shared.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
