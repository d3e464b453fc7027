//! End-to-end runs of the live loop: several symbols against one shared
//! ledger and capsule store.

use std::sync::Arc;

use tokio::time::{sleep, Duration};

use entropylab::capsule::signal_hash;
use entropylab::feed::{replay_feed, FeedHandle, SimulatedFeed, TickSource};
use entropylab::ledger::{self, Ledger, Side};
use entropylab::live::LiveTrader;
use entropylab::metrics::{InMemoryMetrics, CAPSULES_TOTAL};
use entropylab::risk::RiskPolicy;
use entropylab::signals::{AnalyzerParams, EntropyAnalyzer};
use entropylab::storage::CapsuleStore;

const SYMBOLS: &[&str] = &["SPY", "QQQ", "BTC-USD"];

fn trader(window: usize, cash: f64) -> (Arc<LiveTrader>, Arc<CapsuleStore>, Arc<InMemoryMetrics>) {
    let analyzer = EntropyAnalyzer::new(AnalyzerParams { window, ..AnalyzerParams::default() }).unwrap();
    let store = Arc::new(CapsuleStore::in_memory().unwrap());
    let metrics = Arc::new(InMemoryMetrics::new());
    let trader = LiveTrader::new(
        analyzer,
        RiskPolicy::default(),
        Ledger::new(cash).shared(),
        Arc::clone(&store),
        metrics.clone(),
    );
    (Arc::new(trader), store, metrics)
}

fn swinging_prices(n: usize, phase: f64) -> Vec<f64> {
    (0..n).map(|i| 100.0 + 10.0 * (i as f64 * 0.37 + phase).sin()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_symbols_share_ledger_and_store() {
    let window = 21;
    let ticks = 120;
    let (trader, store, metrics) = trader(window, 100_000.0);

    let mut feeds: Vec<FeedHandle> = Vec::new();
    let mut sources: Vec<(String, Box<dyn TickSource>)> = Vec::new();
    for (i, symbol) in SYMBOLS.iter().enumerate() {
        let (rx, handle) = replay_feed(symbol, swinging_prices(ticks, i as f64));
        feeds.push(handle);
        sources.push((symbol.to_string(), Box::new(rx)));
    }

    let session = Arc::clone(&trader).spawn(sources);
    assert_eq!(session.len(), SYMBOLS.len());
    let reports = session.join().await.unwrap();

    assert_eq!(reports.len(), SYMBOLS.len());
    let mut total_orders = 0;
    for report in &reports {
        assert_eq!(report.ticks, ticks as u64);
        assert_eq!(
            report.capsules + report.duplicate_capsules,
            (ticks - window + 1) as u64,
            "{}: one capsule attempt per full-buffer tick",
            report.symbol
        );
        assert_eq!(store.count(&report.symbol).unwrap(), report.capsules);
        assert_eq!(
            metrics.get(CAPSULES_TOTAL, &[("symbol", report.symbol.as_str())]),
            Some(report.capsules as f64)
        );
        total_orders += report.orders;
    }
    assert!(total_orders > 0, "10% swings should clear the confidence gate");

    let ledger = ledger::lock(trader.ledger()).unwrap();
    assert_eq!(ledger.trades().len() as u64, total_orders);
    assert!(ledger.cash().is_finite());
    for (symbol, qty) in ledger.positions() {
        assert!(*qty >= 0.0, "{} went short: {}", symbol, qty);
    }

    // Replaying the trade log in order must land on the same books, and
    // every buy must be sized from the cash held right before it.
    let fraction = RiskPolicy::default().max_position_size();
    let mut replay = Ledger::new(100_000.0);
    for order in ledger.trades() {
        if order.side == Side::Buy {
            let expected = replay.cash() * fraction / order.price;
            assert!(
                (order.qty - expected).abs() <= 1e-12 * expected.abs().max(1.0),
                "{} buy of {} sized from stale cash (expected {})",
                order.symbol,
                order.qty,
                expected
            );
        }
        replay.submit(order.clone());
    }
    assert_eq!(replay.cash(), ledger.cash());
    assert_eq!(replay.positions(), ledger.positions());
}

#[tokio::test]
async fn stored_capsules_rehash_to_their_key() {
    let (trader, store, _metrics) = trader(8, 10_000.0);
    let (rx, _feed) = replay_feed("ETH-USD", swinging_prices(60, 0.5));
    Arc::clone(&trader).run_symbol("ETH-USD".to_string(), rx).await.unwrap();

    let records = store.query("ETH-USD", 0.0, 10.0).unwrap();
    assert!(!records.is_empty());
    for record in &records {
        assert_eq!(record.symbol, "ETH-USD");
        assert_eq!(signal_hash(&record.payload.signal), record.signal_hash);
        assert!(record.payload.signal.delta_phi >= 0.0);
    }
    assert!(store.query("ETH-USD", 5.0, 10.0).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_every_symbol_task() {
    let (trader, store, _metrics) = trader(5, 50_000.0);

    let mut feeds: Vec<FeedHandle> = Vec::new();
    let mut sources: Vec<(String, Box<dyn TickSource>)> = Vec::new();
    for (i, symbol) in SYMBOLS.iter().enumerate() {
        let (rx, handle) = SimulatedFeed::spawn(symbol, Duration::from_millis(1), Some(40 + i as u64));
        feeds.push(handle);
        sources.push((symbol.to_string(), Box::new(rx)));
    }
    let session = Arc::clone(&trader).spawn(sources);
    sleep(Duration::from_millis(100)).await;

    let outcome = session.cancel().await;
    assert!(outcome.reports.is_empty(), "endless feeds never finish on their own");
    assert!(outcome.failures.is_empty());

    let counted = |store: &CapsuleStore| -> u64 { SYMBOLS.iter().map(|s| store.count(s).unwrap()).sum() };
    let after_cancel = counted(&store);
    assert!(after_cancel > 0);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(counted(&store), after_cancel, "no task may keep writing after cancel");

    for feed in &feeds {
        feed.abort();
    }
    sleep(Duration::from_millis(20)).await;
    assert!(feeds.iter().all(|f| f.is_finished()));
}

#[tokio::test]
async fn dropping_session_aborts_tasks() {
    let (trader, store, _metrics) = trader(5, 50_000.0);
    let (rx, _feed) = SimulatedFeed::spawn("VTI", Duration::from_millis(1), Some(9));
    let session = Arc::clone(&trader).spawn(vec![("VTI".to_string(), Box::new(rx) as Box<dyn TickSource>)]);
    sleep(Duration::from_millis(50)).await;
    drop(session);
    sleep(Duration::from_millis(20)).await;

    let before = store.count("VTI").unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.count("VTI").unwrap(), before);
}
