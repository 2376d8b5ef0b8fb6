use candle_pipeline::aggregator::{AggregatorConfig, CandleAggregator, EmitKind, LatePolicy};
use candle_pipeline::error::TradeError;
use candle_pipeline::model::candle::{Candle, WindowKey};
use candle_pipeline::model::trade::Trade;

fn trade(product_id: &str, ts: i64, price: f64) -> Trade {
    Trade::new(product_id, price, 1.0, ts).expect("test trade should be valid")
}

fn assert_ohlc(candle: &Candle, open: f64, high: f64, low: f64, close: f64) {
    assert!((candle.open - open).abs() < f64::EPSILON, "open {}", candle.open);
    assert!((candle.high - high).abs() < f64::EPSILON, "high {}", candle.high);
    assert!((candle.low - low).abs() < f64::EPSILON, "low {}", candle.low);
    assert!((candle.close - close).abs() < f64::EPSILON, "close {}", candle.close);
}

fn aggregator(window_ms: i64) -> CandleAggregator {
    CandleAggregator::new(AggregatorConfig::new(window_ms)).expect("valid config")
}

#[test]
/// Verifies the reduce over a single window: open = first, close = last,
/// high = max, low = min.
fn single_window_reduces_to_first_last_max_min() {
    let mut agg = aggregator(60_000);
    let prices = [100.0, 104.0, 97.5, 101.0, 99.0];
    for (i, price) in prices.iter().enumerate() {
        let emitted = agg
            .ingest(&trade("BTC/USD", 60_000 + i as i64 * 1_000, *price))
            .expect("ingest should succeed");
        assert!(emitted.is_empty(), "no candle should close inside the window");
    }

    let flushed = agg.flush();
    assert_eq!(flushed.len(), 1);
    assert_ohlc(&flushed[0], 100.0, 104.0, 97.5, 99.0);
    assert_eq!(flushed[0].trades, 5);
    assert!((flushed[0].volume - 5.0).abs() < f64::EPSILON);
    assert_eq!(flushed[0].window_start_ms, 60_000);
    assert_eq!(flushed[0].window_end_ms, 120_000);
}

#[test]
/// Verifies the worked example: with a 60-unit window starting at 100, the
/// trade at 170 closes [100,160) and leaves [160,220) open.
fn worked_example_closes_first_window_on_boundary_crossing() {
    let mut agg = CandleAggregator::new(AggregatorConfig::new(60).with_origin(100)).unwrap();

    assert!(agg.ingest(&trade("X", 100, 10.0)).unwrap().is_empty());
    assert!(agg.ingest(&trade("X", 130, 12.0)).unwrap().is_empty());
    let emitted = agg.ingest(&trade("X", 170, 9.0)).unwrap();

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].kind, EmitKind::Final);
    assert_eq!(emitted[0].candle.window_start_ms, 100);
    assert_eq!(emitted[0].candle.window_end_ms, 160);
    assert_ohlc(&emitted[0].candle, 10.0, 12.0, 10.0, 12.0);

    let open = agg
        .current(&WindowKey::new("X", 160))
        .expect("window [160,220) should be live");
    assert_ohlc(&open, 9.0, 9.0, 9.0, 9.0);
    assert_eq!(agg.live_count(), 1);
}

#[test]
/// Verifies that skipped windows produce no candles: a jump over several
/// empty windows emits only the window that actually saw trades.
fn empty_windows_are_never_emitted() {
    let mut agg = aggregator(1_000);
    agg.ingest(&trade("ETH/USD", 1_500, 10.0)).unwrap();
    let emitted = agg.ingest(&trade("ETH/USD", 9_200, 11.0)).unwrap();

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].candle.window_start_ms, 1_000);

    let flushed = agg.flush();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].window_start_ms, 9_000);
}

#[test]
/// Verifies finalize idempotence: the second finalize of the same key is a
/// detectable no-op.
fn finalize_twice_returns_none() {
    let mut agg = aggregator(60_000);
    agg.ingest(&trade("BTC/USD", 61_000, 100.0)).unwrap();
    let key = WindowKey::new("BTC/USD", 60_000);

    let first = agg.finalize(&key);
    assert!(first.is_some());
    assert!(agg.finalize(&key).is_none());
    assert_eq!(agg.live_count(), 0);
}

#[test]
/// Verifies drop policy: a trade for a closed window is rejected as late and
/// the emitted candle is untouched.
fn late_trade_is_rejected_under_drop_policy() {
    let mut agg = aggregator(60);
    agg.ingest(&trade("X", 10, 5.0)).unwrap();
    let emitted = agg.ingest(&trade("X", 70, 6.0)).unwrap();
    let closed = emitted[0].candle.clone();

    let err = agg
        .ingest(&trade("X", 30, 50.0))
        .expect_err("late trade should be rejected");
    assert_eq!(
        err,
        TradeError::Late {
            product_id: "X".to_string(),
            window_start_ms: 0,
            open_from_ms: 60,
        }
    );
    assert!(err.is_late());

    // Live state is untouched by the rejected trade.
    let live = agg.current(&WindowKey::new("X", 60)).unwrap();
    assert_ohlc(&live, 6.0, 6.0, 6.0, 6.0);
    assert_ohlc(&closed, 5.0, 5.0, 5.0, 5.0);
}

#[test]
/// Verifies that an explicitly finalized window stays closed: a later trade
/// for the same window is late, even though no newer window was observed.
fn explicit_finalize_closes_window_for_late_trades() {
    let mut agg = aggregator(60);
    agg.ingest(&trade("X", 10, 5.0)).unwrap();
    agg.finalize(&WindowKey::new("X", 0)).unwrap();

    assert!(agg.ingest(&trade("X", 20, 7.0)).unwrap_err().is_late());
    assert_eq!(agg.open_from("X"), Some(60));
    assert!(agg.ingest(&trade("X", 60, 7.0)).unwrap().is_empty());
}

#[test]
/// Verifies reopen policy: a late trade for a retained window yields a
/// correction with the updated aggregate.
fn late_trade_is_corrected_under_reopen_policy() {
    let config = AggregatorConfig::new(60)
        .with_late_policy(LatePolicy::Reopen)
        .with_history_len(4);
    let mut agg = CandleAggregator::new(config).unwrap();

    agg.ingest(&trade("X", 10, 5.0)).unwrap();
    agg.ingest(&trade("X", 20, 6.0)).unwrap();
    agg.ingest(&trade("X", 70, 8.0)).unwrap();

    let corrected = agg.ingest(&trade("X", 40, 9.0)).unwrap();
    assert_eq!(corrected.len(), 1);
    assert_eq!(corrected[0].kind, EmitKind::Correction);
    assert_eq!(corrected[0].candle.window_start_ms, 0);
    assert_ohlc(&corrected[0].candle, 5.0, 9.0, 5.0, 9.0);
    assert_eq!(corrected[0].candle.trades, 3);

    // The open window is not affected by the correction.
    let live = agg.current(&WindowKey::new("X", 60)).unwrap();
    assert_ohlc(&live, 8.0, 8.0, 8.0, 8.0);
}

#[test]
/// Verifies reopen policy falls back to rejection when the window was never
/// emitted or has aged out of the retained history.
fn reopen_policy_rejects_windows_outside_history() {
    let config = AggregatorConfig::new(10)
        .with_late_policy(LatePolicy::Reopen)
        .with_history_len(1);
    let mut agg = CandleAggregator::new(config).unwrap();

    agg.ingest(&trade("X", 5, 1.0)).unwrap();
    agg.ingest(&trade("X", 15, 2.0)).unwrap();
    agg.ingest(&trade("X", 45, 3.0)).unwrap();

    // window 0 aged out (history_len = 1 keeps only window 10)
    assert!(agg.ingest(&trade("X", 6, 1.5)).unwrap_err().is_late());
    // window 20 never saw a trade
    assert!(agg.ingest(&trade("X", 25, 1.5)).unwrap_err().is_late());
    // window 10 is retained
    let corrected = agg.ingest(&trade("X", 16, 0.5)).unwrap();
    assert_eq!(corrected[0].kind, EmitKind::Correction);
    assert_ohlc(&corrected[0].candle, 2.0, 2.0, 0.5, 0.5);
}

#[test]
/// Verifies forced flush: one candle per open key, none emitted twice, and
/// the aggregator is empty afterwards.
fn flush_emits_each_open_key_exactly_once() {
    let mut agg = aggregator(60);
    agg.ingest(&trade("A", 10, 1.0)).unwrap();
    agg.ingest(&trade("B", 15, 2.0)).unwrap();
    agg.ingest(&trade("C", 20, 3.0)).unwrap();
    agg.ingest(&trade("A", 25, 1.5)).unwrap();

    let flushed = agg.flush();
    let keys: Vec<WindowKey> = flushed.iter().map(Candle::key).collect();
    assert_eq!(
        keys,
        vec![
            WindowKey::new("A", 0),
            WindowKey::new("B", 0),
            WindowKey::new("C", 0),
        ]
    );
    assert_eq!(agg.live_count(), 0);
    assert!(agg.flush().is_empty());
}

#[test]
/// Verifies instrument independence: a newer trade for one instrument never
/// closes another instrument's window.
fn instruments_are_independent() {
    let mut agg = aggregator(60);
    agg.ingest(&trade("A", 10, 1.0)).unwrap();
    agg.ingest(&trade("B", 10, 2.0)).unwrap();

    let emitted = agg.ingest(&trade("A", 130, 1.1)).unwrap();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].candle.product_id, "A");

    assert!(agg.current(&WindowKey::new("B", 0)).is_some());
    // B still accepts trades in its original window.
    assert!(agg.ingest(&trade("B", 50, 2.5)).unwrap().is_empty());
}

#[test]
/// Verifies the ordering dependency: close follows arrival order, so an
/// out-of-order trade inside an open window becomes the close.
fn out_of_order_trade_within_window_overrides_close() {
    let mut agg = aggregator(60);
    agg.ingest(&trade("X", 10, 1.0)).unwrap();
    agg.ingest(&trade("X", 50, 3.0)).unwrap();
    agg.ingest(&trade("X", 20, 2.0)).unwrap();

    let candle = agg.flush().remove(0);
    assert_ohlc(&candle, 1.0, 3.0, 1.0, 2.0);
}

#[test]
/// Verifies finalize_instrument closes only the requested instrument.
fn finalize_instrument_only_touches_one_product() {
    let mut agg = aggregator(60);
    agg.ingest(&trade("A", 10, 1.0)).unwrap();
    agg.ingest(&trade("B", 10, 2.0)).unwrap();

    let closed = agg.finalize_instrument("A");
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].product_id, "A");
    assert_eq!(agg.live_instruments(), vec!["B".to_string()]);
    assert!(agg.finalize_instrument("A").is_empty());
}

#[test]
/// Verifies only windows that have ended by the given event time close; the
/// instrument keeps accepting trades for a window still in progress.
fn finalize_expired_keeps_windows_in_progress() {
    let mut agg = aggregator(60_000);
    agg.ingest(&trade("A", 1_000, 1.0)).unwrap();
    agg.ingest(&trade("B", 1_000, 2.0)).unwrap();

    assert!(agg.finalize_expired("A", 59_999).is_empty());
    agg.ingest(&trade("A", 16_000, 3.0)).expect("window is still open");
    assert_eq!(agg.current(&WindowKey::new("A", 0)).unwrap().trades, 2);

    let closed = agg.finalize_expired("A", 60_000);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].trades, 2);
    assert_eq!(agg.open_from("A"), Some(60_000));
    assert_eq!(agg.live_instruments(), vec!["B".to_string()]);
}

#[test]
/// Verifies the OHLC invariant low <= open, close <= high after every update.
fn ohlc_invariant_holds_after_every_update() {
    let mut agg = aggregator(1_000_000);
    let key = WindowKey::new("X", 0);
    let prices = [5.0, 3.0, 8.0, 8.0, 1.0, 4.5, 9.9, 2.2];
    for (i, p) in prices.iter().enumerate() {
        agg.ingest(&trade("X", i as i64, *p)).unwrap();
        let c = agg.current(&key).unwrap();
        assert!(c.low <= c.open && c.open <= c.high);
        assert!(c.low <= c.close && c.close <= c.high);
        assert!((c.open - 5.0).abs() < f64::EPSILON);
        assert!((c.close - p).abs() < f64::EPSILON);
    }
}

#[test]
/// Verifies fail-fast construction for invalid window settings.
fn zero_or_negative_window_is_rejected() {
    assert!(CandleAggregator::new(AggregatorConfig::new(0)).is_err());
    assert!(CandleAggregator::new(AggregatorConfig::new(-60)).is_err());
    assert!(CandleAggregator::new(AggregatorConfig::new(60).with_origin(-1)).is_err());
    assert!(CandleAggregator::new(AggregatorConfig::new(i64::MAX)).is_err());
}
