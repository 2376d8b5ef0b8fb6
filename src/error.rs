use thiserror::Error;

/// Data-quality problems with a single trade. These are reported and the
/// trade is skipped; they never stop the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    #[error("trade is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("trade has an empty product id")]
    EmptyProductId,

    #[error("invalid price {0}: must be finite and > 0")]
    InvalidPrice(f64),

    #[error("invalid volume {0}: must be finite and >= 0")]
    InvalidVolume(f64),

    #[error("invalid timestamp {0}: must be epoch milliseconds between 0 and year 9999")]
    InvalidTimestamp(i64),

    #[error("unparseable timestamp '{0}'")]
    UnparseableTimestamp(String),

    #[error("undecodable trade: {0}")]
    Undecodable(String),

    #[error(
        "late trade for {product_id}: window {window_start_ms} is closed (accepting from {open_from_ms})"
    )]
    Late {
        product_id: String,
        window_start_ms: i64,
        open_from_ms: i64,
    },
}

impl TradeError {
    pub fn is_late(&self) -> bool {
        matches!(self, TradeError::Late { .. })
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feature store rejected batch (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("sink unavailable after {attempts} attempts: {source}")]
    SinkUnavailable {
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
}
