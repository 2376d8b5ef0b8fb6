use serde::{Deserialize, Serialize};

use crate::error::TradeError;

/// Latest accepted trade time, 9999-12-31T23:59:59.999Z. Keeps window
/// arithmetic on validated trades clear of `i64` overflow.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// A validated trade. Only constructible through [`Trade::new`] or
/// `TryFrom<RawTrade>`, so every value downstream satisfies the price,
/// volume and timestamp constraints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    product_id: String,
    price: f64,
    volume: f64,
    timestamp_ms: i64,
}

impl Trade {
    pub fn new(
        product_id: impl Into<String>,
        price: f64,
        volume: f64,
        timestamp_ms: i64,
    ) -> Result<Self, TradeError> {
        let product_id = product_id.into();
        if product_id.trim().is_empty() {
            return Err(TradeError::EmptyProductId);
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(TradeError::InvalidPrice(price));
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(TradeError::InvalidVolume(volume));
        }
        if !(0..=MAX_TIMESTAMP_MS).contains(&timestamp_ms) {
            return Err(TradeError::InvalidTimestamp(timestamp_ms));
        }
        Ok(Self {
            product_id,
            price,
            volume,
            timestamp_ms,
        })
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// Wire shape of a trade before validation. Every field is optional so a
/// missing field surfaces as [`TradeError::MissingField`] instead of a
/// decode failure of the whole message.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTrade {
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default, alias = "timestamp")]
    pub timestamp_ms: Option<i64>,
}

impl TryFrom<RawTrade> for Trade {
    type Error = TradeError;

    fn try_from(raw: RawTrade) -> Result<Self, Self::Error> {
        let product_id = raw
            .product_id
            .ok_or(TradeError::MissingField("product_id"))?;
        let price = raw.price.ok_or(TradeError::MissingField("price"))?;
        let volume = raw.volume.ok_or(TradeError::MissingField("volume"))?;
        let timestamp_ms = raw
            .timestamp_ms
            .ok_or(TradeError::MissingField("timestamp_ms"))?;
        Trade::new(product_id, price, volume, timestamp_ms)
    }
}
