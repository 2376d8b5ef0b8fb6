pub mod aggregator;
pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod kraken;
pub mod model;
pub mod pipeline;
pub mod replay;
pub mod sink;
