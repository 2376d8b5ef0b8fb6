use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use super::CandleSink;
use crate::error::SinkError;
use crate::model::candle::{Candle, CandleRecord};

#[derive(Debug, Serialize)]
struct FeatureBatch<'a> {
    feature_group: &'a str,
    version: u32,
    primary_key: [&'static str; 2],
    event_time: &'static str,
    rows: &'a [CandleRecord],
}

/// Pushes candle rows to a feature-store HTTP endpoint in batches of
/// `buffer_size`. Rows stay buffered until a push succeeds; a batch keeps the
/// same `Idempotency-Key` across retries.
pub struct FeatureStoreSink {
    http: reqwest::Client,
    url: String,
    feature_group: String,
    version: u32,
    buffer_size: usize,
    buffer: Vec<CandleRecord>,
    batch_key: Option<Uuid>,
}

impl FeatureStoreSink {
    pub fn new(url: &str, feature_group: &str, version: u32, buffer_size: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            url: url.to_string(),
            feature_group: feature_group.to_string(),
            version,
            buffer_size: buffer_size.max(1),
            buffer: Vec::with_capacity(buffer_size.max(1)),
            batch_key: None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn push_batch(&mut self) -> Result<(), SinkError> {
        let key = *self.batch_key.get_or_insert_with(Uuid::new_v4);
        let batch = FeatureBatch {
            feature_group: &self.feature_group,
            version: self.version,
            primary_key: ["product_id", "timestamp"],
            event_time: "timestamp",
            rows: &self.buffer,
        };

        let resp = self
            .http
            .post(&self.url)
            .header("Idempotency-Key", key.to_string())
            .json(&batch)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(
            feature_group = %self.feature_group,
            version = self.version,
            rows = self.buffer.len(),
            batch_key = %key,
            "Pushed candles to feature store"
        );
        self.buffer.clear();
        self.batch_key = None;
        Ok(())
    }
}

#[async_trait]
impl CandleSink for FeatureStoreSink {
    fn name(&self) -> &'static str {
        "feature_store"
    }

    async fn accept(&mut self, candle: &Candle) -> Result<(), SinkError> {
        self.buffer.push(candle.record());
        if self.buffer.len() < self.buffer_size {
            return Ok(());
        }
        if let Err(e) = self.push_batch().await {
            // hand the candle back so the caller's retry does not duplicate it
            self.buffer.pop();
            return Err(e);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.push_batch().await
    }
}
