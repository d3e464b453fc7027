use std::collections::VecDeque;

use anyhow::{bail, Result};

use crate::risk::RiskPolicy;
use crate::signals::{AnalyzerParams, DEFAULT_NP_THRESHOLD, DEFAULT_P_THRESHOLD, DEFAULT_WINDOW};

/// Process configuration. Only binaries read it from the environment;
/// core components take the derived parameter structs.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub symbols: Vec<String>,
    pub window: usize,
    pub p_threshold: f64,
    pub np_threshold: f64,
    pub max_position_size: f64,
    pub confidence_threshold: f64,
    pub start_capital: f64,
    pub database_path: String,
    pub tick_interval_ms: u64,
    /// Seed for the simulated feed; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: ["SPY", "QQQ", "VTI", "BTC-USD", "ETH-USD"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            window: DEFAULT_WINDOW,
            p_threshold: DEFAULT_P_THRESHOLD,
            np_threshold: DEFAULT_NP_THRESHOLD,
            max_position_size: 0.25,
            confidence_threshold: 0.85,
            start_capital: 100_000.0,
            database_path: "./entropy_capsules.db".to_string(),
            tick_interval_ms: 50,
            seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            symbols: std::env::var("ENTROPY_SYMBOLS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.symbols),
            window: env_parse("ENTROPY_WINDOW").unwrap_or(d.window),
            p_threshold: env_parse("ENTROPY_P_THRESHOLD").unwrap_or(d.p_threshold),
            np_threshold: env_parse("ENTROPY_NP_THRESHOLD").unwrap_or(d.np_threshold),
            max_position_size: env_parse("ENTROPY_MAX_POSITION_SIZE").unwrap_or(d.max_position_size),
            confidence_threshold: env_parse("ENTROPY_CONFIDENCE_THRESHOLD").unwrap_or(d.confidence_threshold),
            start_capital: env_parse("ENTROPY_START_CAPITAL").unwrap_or(d.start_capital),
            database_path: std::env::var("ENTROPY_DATABASE_PATH").unwrap_or(d.database_path),
            tick_interval_ms: env_parse("ENTROPY_TICK_INTERVAL_MS").unwrap_or(d.tick_interval_ms),
            seed: env_parse("ENTROPY_SEED"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("at least one symbol is required");
        }
        self.analyzer_params().validate()?;
        self.risk_policy()?;
        if !(self.start_capital.is_finite() && self.start_capital > 0.0) {
            bail!("start_capital must be positive, got {}", self.start_capital);
        }
        Ok(())
    }

    pub fn analyzer_params(&self) -> AnalyzerParams {
        AnalyzerParams {
            window: self.window,
            p_threshold: self.p_threshold,
            np_threshold: self.np_threshold,
        }
    }

    pub fn risk_policy(&self) -> Result<RiskPolicy> {
        RiskPolicy::new(self.max_position_size, self.confidence_threshold)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Bounded FIFO of the most recent prices for one symbol.
#[derive(Debug, Clone)]
pub struct PriceBuffer {
    prices: VecDeque<f64>,
    capacity: usize,
}

impl PriceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, price: f64) {
        self.prices.push_back(price);
        while self.prices.len() > self.capacity {
            self.prices.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.prices.len() >= self.capacity
    }

    /// Contiguous view, oldest first.
    pub fn as_slice(&mut self) -> &[f64] {
        self.prices.make_contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.analyzer_params(), AnalyzerParams::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = Config::default();
        cfg.np_threshold = 0.01;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.start_capital = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.max_position_size = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut buf = PriceBuffer::new(3);
        for p in [1.0, 2.0, 3.0, 4.0, 5.0] {
            buf.push(p);
            assert!(buf.len() <= 3);
        }
        assert!(buf.is_full());
        assert_eq!(buf.as_slice(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_buffer_fills_gradually() {
        let mut buf = PriceBuffer::new(4);
        assert!(buf.is_empty());
        buf.push(10.0);
        buf.push(11.0);
        assert!(!buf.is_full());
        assert_eq!(buf.as_slice(), &[10.0, 11.0]);
    }
}
