use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::json;
use tokio::time::Duration;

use entropylab::feed::{FeedHandle, SimulatedFeed, TickSource};
use entropylab::ledger::{self, Ledger};
use entropylab::live::LiveTrader;
use entropylab::logging::{log, log_session_summary, obj, v_num, v_str, Domain, Level};
use entropylab::metrics::{JsonLogMetrics, MetricsSink, CAPSULES_TOTAL, ENGINE_UP};
use entropylab::signals::EntropyAnalyzer;
use entropylab::state::Config;
use entropylab::storage::CapsuleStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;

    let analyzer = EntropyAnalyzer::new(cfg.analyzer_params())?;
    let risk = cfg.risk_policy()?;
    let store = Arc::new(CapsuleStore::open(&cfg.database_path)?);
    let ledger = Ledger::new(cfg.start_capital).shared();
    let metrics = Arc::new(JsonLogMetrics::new());

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("symbols", json!(cfg.symbols)),
            ("window", json!(cfg.window)),
            ("p_threshold", v_num(cfg.p_threshold)),
            ("np_threshold", v_num(cfg.np_threshold)),
            ("database", v_str(&cfg.database_path)),
        ]),
    );
    metrics.gauge(ENGINE_UP, &[], 1.0);

    let interval = Duration::from_millis(cfg.tick_interval_ms);
    let mut feeds: Vec<FeedHandle> = Vec::new();
    let mut sources: Vec<(String, Box<dyn TickSource>)> = Vec::new();
    for (i, symbol) in cfg.symbols.iter().enumerate() {
        let seed = cfg.seed.map(|s| s.wrapping_add(i as u64));
        let (rx, handle) = SimulatedFeed::spawn(symbol, interval, seed);
        feeds.push(handle);
        sources.push((symbol.clone(), Box::new(rx)));
    }

    let trader = Arc::new(LiveTrader::new(
        analyzer,
        risk,
        Arc::clone(&ledger),
        Arc::clone(&store),
        metrics.clone(),
    ));
    let started = Instant::now();
    let mut session = trader.spawn(sources);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut finished = Vec::new();
    let mut early_failure = None;
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                log(Level::Info, Domain::System, "shutdown_requested", obj(&[]));
                break;
            }
            next = session.join_next() => match next {
                Some(Ok(report)) => finished.push(report),
                Some(Err(err)) => {
                    early_failure = Some(err);
                    break;
                }
                None => break,
            },
        }
    }

    let mut outcome = session.cancel().await;
    outcome.reports.extend(finished);
    if let Some(err) = early_failure {
        outcome.failures.insert(0, err);
    }
    drop(feeds);
    metrics.gauge(ENGINE_UP, &[], 0.0);

    let (cash, orders) = {
        let l = ledger::lock(&ledger)?;
        (l.cash(), l.trades().len() as u64)
    };
    let stored: u64 = cfg.symbols.iter().map(|s| store.count(s).unwrap_or(0)).sum();
    log_session_summary(
        started.elapsed().as_secs(),
        stored,
        metrics.readings().total(CAPSULES_TOTAL) as u64,
        orders,
        cash,
    );
    outcome.into_result().map(|_| ())
}
