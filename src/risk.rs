use anyhow::{bail, Result};

use crate::logging::log_risk_check;
use crate::signals::EntropySignal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSize {
    /// Fraction of account value, in `[0, max_position_size]`.
    pub fraction: f64,
    pub hedge: bool,
}

impl PositionSize {
    pub fn flat() -> Self {
        Self { fraction: 0.0, hedge: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskPolicy {
    max_position_size: f64,
    confidence_threshold: f64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            max_position_size: 0.25,
            confidence_threshold: 0.85,
        }
    }
}

impl RiskPolicy {
    pub fn new(max_position_size: f64, confidence_threshold: f64) -> Result<Self> {
        if !(max_position_size > 0.0 && max_position_size <= 1.0) {
            bail!("max_position_size must be in (0, 1], got {}", max_position_size);
        }
        if !(0.0..=1.0).contains(&confidence_threshold) {
            bail!("confidence_threshold must be in [0, 1], got {}", confidence_threshold);
        }
        Ok(Self { max_position_size, confidence_threshold })
    }

    pub fn max_position_size(&self) -> f64 {
        self.max_position_size
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Fraction scales with confidence and is capped at the max position size.
    /// `_account_value` is accepted for policies that size in absolute terms.
    pub fn size(&self, signal: &EntropySignal, _account_value: f64) -> PositionSize {
        if signal.confidence < self.confidence_threshold {
            log_risk_check("confidence", "flat", signal.confidence, self.confidence_threshold);
            return PositionSize::flat();
        }
        PositionSize {
            fraction: self
                .max_position_size
                .min(signal.confidence * self.max_position_size),
            hedge: signal.np_wall,
        }
    }

    pub fn should_trade(&self, signal: &EntropySignal) -> bool {
        signal.confidence >= self.confidence_threshold && (signal.np_wall || signal.no_recovery)
    }
}
