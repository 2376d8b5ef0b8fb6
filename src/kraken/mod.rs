pub mod types;
pub mod ws;

pub use ws::{KrakenWsClient, KRAKEN_WS_URL};
