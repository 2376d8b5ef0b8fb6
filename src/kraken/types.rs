use serde::{Deserialize, Deserializer};

use crate::error::TradeError;
use crate::model::trade::{RawTrade, Trade};

/// Accept Kraken numbers sent either as JSON numbers or as strings.
pub fn number_or_string_to_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        Some(_) => Err(serde::de::Error::custom("invalid numeric value")),
    }
}

/// Envelope shared by every Kraken v2 websocket message.
#[derive(Debug, Deserialize)]
struct KrakenEnvelope {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// One entry of a `trade` channel update.
#[derive(Debug, Deserialize)]
pub struct KrakenTrade {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "number_or_string_to_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "number_or_string_to_f64")]
    pub qty: Option<f64>,
    #[serde(default)]
    pub trade_id: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TryFrom<KrakenTrade> for Trade {
    type Error = TradeError;

    fn try_from(t: KrakenTrade) -> Result<Self, Self::Error> {
        let timestamp_ms = match t.timestamp {
            Some(ts) => Some(parse_rfc3339_ms(&ts)?),
            None => None,
        };
        Trade::try_from(RawTrade {
            product_id: t.symbol,
            price: t.price,
            volume: t.qty,
            timestamp_ms,
        })
    }
}

pub fn parse_rfc3339_ms(ts: &str) -> Result<i64, TradeError> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| TradeError::UnparseableTimestamp(ts.to_string()))
}

#[derive(Debug)]
pub enum KrakenMessage {
    /// Trade entries of one update, each validated independently.
    Trades(Vec<Result<Trade, TradeError>>),
    Heartbeat,
    Ack {
        method: String,
        success: bool,
        error: Option<String>,
    },
    Other,
}

/// Decode one websocket text frame.
pub fn decode_message(text: &str) -> Result<KrakenMessage, serde_json::Error> {
    let envelope: KrakenEnvelope = serde_json::from_str(text)?;

    if let Some(method) = envelope.method {
        return Ok(KrakenMessage::Ack {
            method,
            success: envelope.success.unwrap_or(false),
            error: envelope.error,
        });
    }

    match envelope.channel.as_deref() {
        Some("heartbeat") => Ok(KrakenMessage::Heartbeat),
        Some("trade") => {
            let trades = envelope
                .data
                .into_iter()
                .map(|entry| match serde_json::from_value::<KrakenTrade>(entry) {
                    Ok(t) => Trade::try_from(t),
                    Err(e) => Err(TradeError::Undecodable(e.to_string())),
                })
                .collect();
            Ok(KrakenMessage::Trades(trades))
        }
        _ => Ok(KrakenMessage::Other),
    }
}

/// Subscribe request for the trade channel.
pub fn subscribe_message(symbols: &[String]) -> String {
    serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel": "trade",
            "symbol": symbols,
            "snapshot": false,
        }
    })
    .to_string()
}
