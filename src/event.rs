use crate::error::TradeError;

#[derive(Debug, Clone, PartialEq)]
pub enum WsConnectionStatus {
    Connected,
    Subscribed { symbols: Vec<String> },
    Disconnected,
    Reconnecting { attempt: u32, delay_ms: u64 },
}

/// Status reported by a trade source alongside the trades themselves.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    WsStatus(WsConnectionStatus),
    TradeRejected(TradeError),
    LogMessage(String),
    Error(String),
}

impl SourceEvent {
    /// Route the event to the matching tracing level.
    pub fn log(&self, source: &str) {
        match self {
            SourceEvent::WsStatus(status) => {
                tracing::info!(source, status = ?status, "Source connection status")
            }
            SourceEvent::TradeRejected(error) => {
                tracing::warn!(source, error = %error, "Rejected malformed trade")
            }
            SourceEvent::LogMessage(msg) => tracing::info!(source, "{}", msg),
            SourceEvent::Error(msg) => tracing::error!(source, "{}", msg),
        }
    }
}
