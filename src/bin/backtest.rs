use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use serde_json::json;

use entropylab::backtest::{buy_and_hold, load_prices, Backtester, PERIODS_PER_YEAR};
use entropylab::logging::{log, obj, v_num, v_str, Domain, Level};
use entropylab::state::Config;

fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "data.csv".to_string());
    let cfg = Config::from_env();
    let capital = match std::env::args().nth(2) {
        Some(raw) => raw.parse::<f64>().with_context(|| format!("bad capital {:?}", raw))?,
        None => cfg.start_capital,
    };

    let file = File::open(&path).with_context(|| format!("failed to open {}", path))?;
    let data = load_prices(BufReader::new(file)).with_context(|| format!("reading {}", path))?;
    let closes: Vec<f64> = data.iter().map(|p| p.close).collect();

    let backtester = Backtester::new(cfg.analyzer_params())?;
    let result = backtester.run(&data, capital)?;
    let baseline = buy_and_hold(&closes, PERIODS_PER_YEAR)?;

    log(
        Level::Info,
        Domain::System,
        "backtest_complete",
        obj(&[
            ("path", v_str(&path)),
            ("bars", json!(result.summary.bars)),
            ("signals", json!(result.signals.len())),
            ("total_return", v_num(result.summary.total_return)),
        ]),
    );

    let report = json!({
        "path": path,
        "capital": capital,
        "summary": result.summary,
        "signals": result.signals.len(),
        "final_equity": result.equity_curve.last().map(|p| p.equity),
        "baseline": baseline,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
