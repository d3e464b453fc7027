//! Live trading loop: one task per symbol.
//!
//! Each task owns its `PriceBuffer`. The ledger and capsule store are shared;
//! the read-cash, size, submit sequence for an order runs under one ledger
//! lock so concurrent symbols cannot interleave inside it.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;
use tokio::task::JoinSet;

use crate::capsule::ProofCapsule;
use crate::feed::{PriceTick, TickSource};
use crate::ledger::{self, FillAck, Order, Side, SharedLedger};
use crate::logging::{log, log_capsule, log_risk_check, log_signal, log_tick, obj, v_str, Domain, Level};
use crate::metrics::{MetricsSink, BROKER_CASH, CAPSULES_TOTAL, LAST_PRICE, OPEN_POSITION};
use crate::risk::RiskPolicy;
use crate::signals::{EntropyAnalyzer, EntropySignal};
use crate::state::PriceBuffer;
use crate::storage::{is_duplicate_hash, CapsuleStore};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolReport {
    pub symbol: String,
    pub ticks: u64,
    pub capsules: u64,
    pub duplicate_capsules: u64,
    pub orders: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub signal: Option<EntropySignal>,
    pub capsule: Option<ProofCapsule>,
    pub capsule_id: Option<i64>,
    pub duplicate: bool,
    pub fill: Option<FillAck>,
}

pub struct LiveTrader {
    analyzer: EntropyAnalyzer,
    risk: RiskPolicy,
    ledger: SharedLedger,
    store: Arc<CapsuleStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl LiveTrader {
    pub fn new(
        analyzer: EntropyAnalyzer,
        risk: RiskPolicy,
        ledger: SharedLedger,
        store: Arc<CapsuleStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { analyzer, risk, ledger, store, metrics }
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn new_buffer(&self) -> PriceBuffer {
        PriceBuffer::new(self.analyzer.window())
    }

    /// Run one tick through buffer → analyzer → store → risk → ledger.
    ///
    /// A trade whose computed quantity is not positive (cash at or below
    /// zero) is skipped and never reaches the ledger's trade log.
    pub fn process_tick(&self, buffer: &mut PriceBuffer, tick: &PriceTick) -> Result<TickOutcome> {
        if !(tick.price.is_finite() && tick.price > 0.0) {
            bail!("{}: tick price must be finite and positive, got {}", tick.symbol, tick.price);
        }
        let symbol = tick.symbol.as_str();
        buffer.push(tick.price);
        log_tick(symbol, tick.price, buffer.len());

        {
            let ledger = ledger::lock(&self.ledger)?;
            self.metrics.gauge(LAST_PRICE, &[("symbol", symbol)], tick.price);
            self.metrics.gauge(BROKER_CASH, &[], ledger.cash());
            self.metrics.gauge(OPEN_POSITION, &[("symbol", symbol)], ledger.position(symbol));
        }

        let mut outcome = TickOutcome::default();
        if !buffer.is_full() {
            return Ok(outcome);
        }

        let signal = self.analyzer.analyze(buffer.as_slice())?;
        log_signal(
            symbol,
            signal.delta_phi,
            signal.confidence,
            signal.np_wall,
            signal.no_recovery,
            signal.direction,
        );

        let fingerprint = format!("{}-last{}", symbol, buffer.len());
        let capsule = self.analyzer.capsule_for(&signal, &fingerprint);
        match self.store.store(symbol, &capsule) {
            Ok(id) => {
                self.metrics.incr(CAPSULES_TOTAL, &[("symbol", symbol)], 1.0);
                log_capsule(symbol, &capsule.signal_hash, capsule.provenance.verdict.as_str(), id);
                outcome.capsule_id = Some(id);
            }
            Err(err) if is_duplicate_hash(&err) => {
                log(
                    Level::Warn,
                    Domain::Audit,
                    "capsule_duplicate",
                    obj(&[
                        ("symbol", v_str(symbol)),
                        ("signal_hash", v_str(&capsule.signal_hash)),
                    ]),
                );
                outcome.duplicate = true;
            }
            Err(err) => {
                return Err(err.context(format!("{}: storing capsule", symbol)));
            }
        }
        outcome.capsule = Some(capsule);
        outcome.signal = Some(signal);

        if self.risk.should_trade(&signal) {
            let mut ledger = ledger::lock(&self.ledger)?;
            let cash = ledger.cash();
            let size = self.risk.size(&signal, cash);
            let qty = if size.fraction > 0.0 {
                (cash * size.fraction / tick.price).max(0.0)
            } else {
                0.0
            };
            if qty > 0.0 {
                let order = Order::new(symbol, qty, Side::from_direction(signal.direction), tick.price)?;
                outcome.fill = Some(ledger.submit(order));
            } else {
                log_risk_check("order_qty", "skip", qty, 0.0);
            }
        }
        Ok(outcome)
    }

    /// Consume `source` until it ends. A broken stream ends the task.
    pub async fn run_symbol<S>(self: Arc<Self>, symbol: String, mut source: S) -> Result<SymbolReport>
    where
        S: TickSource,
    {
        let mut buffer = self.new_buffer();
        let mut report = SymbolReport { symbol: symbol.clone(), ..Default::default() };
        log(Level::Info, Domain::System, "symbol_started", obj(&[("symbol", v_str(&symbol))]));

        while let Some(tick) = source.next_tick().await {
            if tick.symbol != symbol {
                bail!("{}: received tick for {}", symbol, tick.symbol);
            }
            let outcome = self.process_tick(&mut buffer, &tick)?;
            report.ticks += 1;
            if outcome.capsule_id.is_some() {
                report.capsules += 1;
            }
            if outcome.duplicate {
                report.duplicate_capsules += 1;
            }
            if outcome.fill.is_some() {
                report.orders += 1;
            }
            tokio::task::yield_now().await;
        }

        log(
            Level::Info,
            Domain::System,
            "symbol_stream_ended",
            obj(&[
                ("symbol", v_str(&symbol)),
                ("ticks", json!(report.ticks)),
                ("capsules", json!(report.capsules)),
                ("orders", json!(report.orders)),
            ]),
        );
        Ok(report)
    }

    /// Start one task per `(symbol, source)` pair.
    pub fn spawn(self: Arc<Self>, sources: Vec<(String, Box<dyn TickSource>)>) -> LiveSession {
        let mut tasks = JoinSet::new();
        for (symbol, source) in sources {
            let trader = Arc::clone(&self);
            tasks.spawn(trader.run_symbol(symbol, source));
        }
        LiveSession { tasks }
    }
}

/// Running symbol tasks. Dropping the session aborts every task.
pub struct LiveSession {
    tasks: JoinSet<Result<SymbolReport>>,
}

/// What a stopped session left behind: reports from tasks whose streams
/// ended and the errors of tasks that failed.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub reports: Vec<SymbolReport>,
    pub failures: Vec<anyhow::Error>,
}

impl SessionOutcome {
    /// The reports, or the first failure if any task failed.
    pub fn into_result(mut self) -> Result<Vec<SymbolReport>> {
        if self.failures.is_empty() {
            Ok(self.reports)
        } else {
            Err(self.failures.swap_remove(0))
        }
    }
}

fn log_task_failure(err: &anyhow::Error) {
    log(
        Level::Error,
        Domain::System,
        "symbol_task_failed",
        obj(&[("error", v_str(&format!("{:#}", err)))]),
    );
}

impl LiveSession {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next task to finish. `None` once no tasks remain. A task that
    /// failed or panicked yields `Err`, logged at error level.
    pub async fn join_next(&mut self) -> Option<Result<SymbolReport>> {
        loop {
            let joined = self.tasks.join_next().await?;
            let result = match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => Err(anyhow::Error::new(err).context("symbol task panicked")),
            };
            if let Err(err) = &result {
                log_task_failure(err);
            }
            return Some(result);
        }
    }

    /// Wait for every stream to end; the first task error is returned.
    pub async fn join(mut self) -> Result<Vec<SymbolReport>> {
        let mut reports = Vec::new();
        while let Some(result) = self.join_next().await {
            reports.push(result?);
        }
        reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(reports)
    }

    /// Abort every symbol task and wait until all have stopped. Tasks that
    /// had already finished contribute their report or their error.
    pub async fn cancel(mut self) -> SessionOutcome {
        self.tasks.abort_all();
        let mut outcome = SessionOutcome::default();
        while let Some(result) = self.join_next().await {
            match result {
                Ok(report) => outcome.reports.push(report),
                Err(err) => outcome.failures.push(err),
            }
        }
        outcome.reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        log(
            Level::Info,
            Domain::System,
            "live_cancelled",
            obj(&[
                ("finished", json!(outcome.reports.len())),
                ("failed", json!(outcome.failures.len())),
            ]),
        );
        outcome
    }
}
