pub mod candle;
pub mod trade;
