use async_trait::async_trait;

use crate::error::SinkError;
use crate::model::candle::Candle;

pub mod feature_store;
pub mod memory;
pub mod sqlite;

pub use feature_store::FeatureStoreSink;
pub use memory::{MemorySink, MemorySinkHandle};
pub use sqlite::SqliteSink;

/// Destination for finalized candles.
///
/// `accept` either takes the candle or returns an error without keeping it,
/// so a caller may retry the same candle. `flush` pushes anything the sink
/// buffers internally and may also be retried after an error.
#[async_trait]
pub trait CandleSink: Send {
    fn name(&self) -> &'static str;

    async fn accept(&mut self, candle: &Candle) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl CandleSink for Box<dyn CandleSink> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn accept(&mut self, candle: &Candle) -> Result<(), SinkError> {
        (**self).accept(candle).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush().await
    }
}
