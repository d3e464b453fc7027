//! Historical replay of the entropy strategy.
//!
//! The drift, wall and recovery series are computed over the whole history
//! in one pass. At every trigger index the analyzer is re-run on the history
//! truncated at that index, so each recorded signal is exactly what a live
//! run would have seen; a rising regression goes long and anything else goes
//! short for the next `HOLD_TICKS` bars (later triggers overwrite earlier
//! spans).

use std::io::BufRead;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::indicators::{max_drawdown, mean, pct_returns, rolling_delta_phi, sample_std};
use crate::logging::{log, obj, v_num, Domain, Level, ProfileScope};
use crate::signals::{finite_or_null, AnalyzerParams, EntropyAnalyzer, EntropySignal};

pub const HOLD_TICKS: usize = 5;
pub const TRIGGER_CONFIDENCE: f64 = 0.85;
pub const PERIODS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: i64,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: i64,
    pub equity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggeredSignal {
    pub index: usize,
    pub ts: i64,
    pub signal: EntropySignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    #[serde(with = "finite_or_null")]
    pub ann_return: f64,
    #[serde(with = "finite_or_null")]
    pub ann_vol: f64,
    #[serde(with = "finite_or_null")]
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub total_return: f64,
    /// Number of position changes.
    pub trades: u64,
    pub bars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub summary: BacktestSummary,
    pub equity_curve: Vec<EquityPoint>,
    pub positions: Vec<f64>,
    pub signals: Vec<TriggeredSignal>,
}

pub struct Backtester {
    analyzer: EntropyAnalyzer,
}

impl Backtester {
    pub fn new(params: AnalyzerParams) -> Result<Self> {
        Ok(Self { analyzer: EntropyAnalyzer::new(params)? })
    }

    pub fn analyzer(&self) -> &EntropyAnalyzer {
        &self.analyzer
    }

    /// Backtest closes indexed by their position (ts = 0, 1, 2, ...).
    pub fn run_closes(&self, closes: &[f64], start_capital: f64) -> Result<BacktestResult> {
        let data: Vec<PricePoint> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PricePoint { ts: i as i64, close })
            .collect();
        self.run(&data, start_capital)
    }

    pub fn run(&self, data: &[PricePoint], start_capital: f64) -> Result<BacktestResult> {
        validate_series(data)?;
        if !(start_capital.is_finite() && start_capital > 0.0) {
            bail!("start capital must be positive, got {}", start_capital);
        }
        let _scope = ProfileScope::with_context("backtest", &[("bars", json!(data.len()))]);

        let closes: Vec<f64> = data.iter().map(|p| p.close).collect();
        let n = closes.len();
        let w = self.analyzer.window();

        let dphi = rolling_delta_phi(&closes, w);
        let mut positions = vec![0.0; n];
        let mut signals = Vec::new();
        for i in w.saturating_sub(1)..n {
            let np_wall = self.analyzer.is_np_wall(dphi[i]);
            let no_recovery = self.analyzer.is_no_recovery(&dphi[i + 1 - w..=i]);
            let confidence = self.analyzer.confidence(dphi[i]);
            if confidence < TRIGGER_CONFIDENCE || !(np_wall || no_recovery) {
                continue;
            }
            let signal = self.analyzer.analyze(&closes[..=i])?;
            let side = trigger_side(signal.direction);
            let end = (i + HOLD_TICKS).min(n);
            for p in &mut positions[i..end] {
                *p = side;
            }
            signals.push(TriggeredSignal { index: i, ts: data[i].ts, signal });
        }

        let returns = pct_returns(&closes);
        let mut equity = Vec::with_capacity(n);
        let mut value = start_capital;
        equity.push(value);
        for i in 1..n {
            value *= 1.0 + positions[i - 1] * returns[i];
            equity.push(value);
        }

        let summary = performance(&equity, &positions);
        log(
            Level::Info,
            Domain::System,
            "backtest_summary",
            obj(&[
                ("bars", json!(n)),
                ("signals", json!(signals.len())),
                ("ann_return", v_num(summary.ann_return)),
                ("ann_vol", v_num(summary.ann_vol)),
                ("sharpe", v_num(summary.sharpe)),
                ("max_drawdown", v_num(summary.max_drawdown)),
                ("trades", json!(summary.trades)),
            ]),
        );

        Ok(BacktestResult {
            summary,
            equity_curve: data
                .iter()
                .zip(&equity)
                .map(|(p, &e)| EquityPoint { ts: p.ts, equity: e })
                .collect(),
            positions,
            signals,
        })
    }
}

/// Position taken at a trigger: long on a rising window, short otherwise.
fn trigger_side(direction: i8) -> f64 {
    if direction > 0 {
        1.0
    } else {
        -1.0
    }
}

fn validate_series(data: &[PricePoint]) -> Result<()> {
    if data.is_empty() {
        bail!("price series is empty");
    }
    for (i, p) in data.iter().enumerate() {
        if !(p.close.is_finite() && p.close > 0.0) {
            bail!("close at index {} must be finite and positive, got {}", i, p.close);
        }
        if i > 0 && p.ts <= data[i - 1].ts {
            bail!("time index not strictly increasing at {} ({} after {})", i, p.ts, data[i - 1].ts);
        }
    }
    Ok(())
}

/// Summary statistics of an equity curve.
pub fn performance(equity: &[f64], positions: &[f64]) -> BacktestSummary {
    let returns: Vec<f64> = pct_returns(equity).into_iter().skip(1).collect();
    let ann_return = mean(&returns) * PERIODS_PER_YEAR;
    let ann_vol = sample_std(&returns) * PERIODS_PER_YEAR.sqrt();
    let sharpe = if ann_vol > 0.0 { ann_return / ann_vol } else { f64::NAN };
    let total_return = match (equity.first(), equity.last()) {
        (Some(&first), Some(&last)) if first > 0.0 => last / first - 1.0,
        _ => 0.0,
    };
    let mut trades = 0;
    let mut prev = 0.0;
    for &p in positions {
        if p != prev {
            trades += 1;
        }
        prev = p;
    }
    BacktestSummary {
        ann_return,
        ann_vol,
        sharpe,
        max_drawdown: max_drawdown(equity),
        total_return,
        trades,
        bars: equity.len(),
    }
}

// =============================================================================
// Buy-and-hold baseline
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineResult {
    pub sharpe: f64,
    pub cagr: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub trades: u64,
}

impl BaselineResult {
    fn zero() -> Self {
        Self { sharpe: 0.0, cagr: 0.0, total_return: 0.0, max_drawdown: 0.0, trades: 0 }
    }
}

/// Long-and-hold the series. Fewer than three prices yields an all-zero result.
pub fn buy_and_hold(closes: &[f64], periods_per_year: f64) -> Result<BaselineResult> {
    if closes.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
        bail!("closes must be finite and positive");
    }
    if !(periods_per_year > 0.0) {
        bail!("periods_per_year must be positive, got {}", periods_per_year);
    }
    if closes.len() < 3 {
        return Ok(BaselineResult::zero());
    }
    let returns: Vec<f64> = pct_returns(closes).into_iter().skip(1).collect();
    let std = sample_std(&returns);
    let sharpe = if std > 0.0 {
        mean(&returns) / std * periods_per_year.sqrt()
    } else {
        0.0
    };
    let mut nav = Vec::with_capacity(returns.len());
    let mut v = 1.0;
    for r in &returns {
        v *= 1.0 + r;
        nav.push(v);
    }
    let first = closes[0];
    let last = closes[closes.len() - 1];
    let years = (closes.len() as f64 / periods_per_year).max(1e-9);
    Ok(BaselineResult {
        sharpe,
        cagr: (last / first).powf(1.0 / years) - 1.0,
        total_return: v - 1.0,
        max_drawdown: max_drawdown(&nav),
        trades: 0,
    })
}

// =============================================================================
// CSV input
// =============================================================================

/// Parse a `ts,close` row; extra columns are ignored.
pub fn parse_price_line(line: &str) -> Result<PricePoint> {
    let mut parts = line.split(',');
    let ts = parts
        .next()
        .ok_or_else(|| anyhow!("missing ts column"))?
        .trim()
        .parse::<i64>()
        .with_context(|| format!("bad ts in {:?}", line))?;
    let close = parts
        .next()
        .ok_or_else(|| anyhow!("missing close column in {:?}", line))?
        .trim()
        .parse::<f64>()
        .with_context(|| format!("bad close in {:?}", line))?;
    Ok(PricePoint { ts, close })
}

/// Read a price series, skipping blank lines, `#` comments and a header row.
pub fn load_prices<R: BufRead>(reader: R) -> Result<Vec<PricePoint>> {
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if out.is_empty() && trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
            continue;
        }
        out.push(parse_price_line(trimmed).with_context(|| format!("line {}", lineno + 1))?);
    }
    validate_series(&out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backtester(window: usize) -> Backtester {
        Backtester::new(AnalyzerParams { window, ..AnalyzerParams::default() }).unwrap()
    }

    fn choppy(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 1.3).sin() * 12.0 + i as f64 * 0.5)
            .collect()
    }

    #[test]
    fn test_flat_series_never_trades() {
        let res = backtester(21).run_closes(&[100.0; 60], 100_000.0).unwrap();
        assert!(res.positions.iter().all(|&p| p == 0.0));
        assert!(res.signals.is_empty());
        assert_eq!(res.summary.trades, 0);
        assert!(res.summary.sharpe.is_nan());
        assert_eq!(res.summary.ann_vol, 0.0);
        assert_eq!(res.summary.max_drawdown, 0.0);
        assert!(res.equity_curve.iter().all(|e| e.equity == 100_000.0));
    }

    #[test]
    fn test_short_series_no_triggers() {
        let res = backtester(21).run_closes(&[100.0, 150.0, 90.0], 1_000.0).unwrap();
        assert!(res.signals.is_empty());
        assert_eq!(res.equity_curve.len(), 3);
    }

    #[test]
    fn test_single_bar_summary_is_nan() {
        let res = backtester(5).run_closes(&[100.0], 1_000.0).unwrap();
        assert!(res.summary.ann_return.is_nan());
        assert!(res.summary.sharpe.is_nan());
        assert_eq!(res.summary.total_return, 0.0);
    }

    #[test]
    fn test_signals_match_live_analysis() {
        let bt = backtester(5);
        let closes = choppy(80);
        let res = bt.run_closes(&closes, 10_000.0).unwrap();
        assert!(!res.signals.is_empty());
        let dphi = rolling_delta_phi(&closes, 5);
        for t in &res.signals {
            let live = bt.analyzer().analyze(&closes[..=t.index]).unwrap();
            assert_eq!(t.signal, live);
            assert_eq!(t.signal.delta_phi, dphi[t.index]);
            assert!(t.signal.confidence >= TRIGGER_CONFIDENCE);
            assert!(t.signal.np_wall || t.signal.no_recovery);
        }
    }

    #[test]
    fn test_position_spans_hold_and_overwrite() {
        let bt = backtester(5);
        let closes = choppy(80);
        let res = bt.run_closes(&closes, 10_000.0).unwrap();
        let mut expected = vec![0.0; closes.len()];
        for t in &res.signals {
            let end = (t.index + HOLD_TICKS).min(closes.len());
            for p in &mut expected[t.index..end] {
                *p = trigger_side(t.signal.direction);
            }
        }
        assert_eq!(res.positions, expected);
        for i in 0..4 {
            assert_eq!(res.positions[i], 0.0);
        }
    }

    #[test]
    fn test_flat_slope_trigger_goes_short() {
        let res = backtester(3)
            .run_closes(&[100.0, 80.0, 100.0, 100.0, 100.0], 1_000.0)
            .unwrap();
        let fired: Vec<(usize, i8)> = res.signals.iter().map(|t| (t.index, t.signal.direction)).collect();
        assert_eq!(fired, vec![(2, 0), (3, 1)]);
        assert_eq!(res.positions, vec![0.0, 0.0, -1.0, 1.0, 1.0]);
        assert_eq!(res.summary.trades, 2);
    }

    #[test]
    fn test_equity_lags_position_by_one_tick() {
        let bt = backtester(5);
        let closes = choppy(60);
        let res = bt.run_closes(&closes, 1_000.0).unwrap();
        let rets = pct_returns(&closes);
        let mut e = 1_000.0;
        for i in 1..closes.len() {
            e *= 1.0 + res.positions[i - 1] * rets[i];
            assert!((res.equity_curve[i].equity - e).abs() < 1e-9);
        }
        assert!(res.summary.max_drawdown <= 0.0);
    }

    #[test]
    fn test_rejects_bad_input() {
        let bt = backtester(5);
        assert!(bt.run_closes(&[], 1_000.0).is_err());
        assert!(bt.run_closes(&[1.0, f64::NAN], 1_000.0).is_err());
        assert!(bt.run_closes(&[1.0, -2.0], 1_000.0).is_err());
        assert!(bt.run_closes(&[1.0, 2.0], 0.0).is_err());
        let unordered = [PricePoint { ts: 2, close: 1.0 }, PricePoint { ts: 2, close: 1.1 }];
        assert!(bt.run(&unordered, 1_000.0).is_err());
    }

    #[test]
    fn test_performance_sharpe() {
        let s = performance(&[100.0, 110.0, 99.0, 108.9], &[1.0, 1.0, 0.0]);
        assert!(s.ann_vol > 0.0);
        assert!((s.sharpe - s.ann_return / s.ann_vol).abs() < 1e-12);
        assert!((s.max_drawdown - (99.0 / 110.0 - 1.0)).abs() < 1e-12);
        assert_eq!(s.trades, 2);
        assert_eq!(s.bars, 4);
    }

    #[test]
    fn test_buy_and_hold_baseline() {
        let res = buy_and_hold(&[100.0, 110.0, 99.0, 121.0], 252.0).unwrap();
        assert!((res.total_return - 0.21).abs() < 1e-12);
        assert!((res.max_drawdown - (99.0 / 110.0 - 1.0)).abs() < 1e-12);
        assert_eq!(res.trades, 0);
        assert_eq!(buy_and_hold(&[1.0, 2.0], 252.0).unwrap(), BaselineResult::zero());
        let flat = buy_and_hold(&[5.0; 10], 252.0).unwrap();
        assert_eq!(flat.sharpe, 0.0);
    }

    #[test]
    fn test_load_prices_skips_header_and_comments() {
        let text = "ts,close\n# sample\n1,100.5\n\n2,101.0\n3,99.75,extra\n";
        let rows = load_prices(text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], PricePoint { ts: 3, close: 99.75 });
    }

    #[test]
    fn test_load_prices_rejects_garbage() {
        assert!(load_prices("1,100\n2,abc\n".as_bytes()).is_err());
        assert!(load_prices("2,100\n1,101\n".as_bytes()).is_err());
        assert!(parse_price_line("7").is_err());
    }
}
