//! Entropy-drift signal analyzer.
//!
//! A signal is a pure function of a trailing price window:
//! prices → ΔΦ series → {np_wall, no_recovery, confidence, direction}.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::capsule::ProofCapsule;
use crate::indicators::{delta_phi, direction_of, min_finite, regression_slope, rolling_delta_phi, EPS};

pub const DEFAULT_WINDOW: usize = 21;
pub const DEFAULT_P_THRESHOLD: f64 = 0.045;
pub const DEFAULT_NP_THRESHOLD: f64 = 0.09;

/// Fixed for the lifetime of an analyzer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerParams {
    pub window: usize,
    pub p_threshold: f64,
    pub np_threshold: f64,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            p_threshold: DEFAULT_P_THRESHOLD,
            np_threshold: DEFAULT_NP_THRESHOLD,
        }
    }
}

impl AnalyzerParams {
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            bail!("window must be at least 2, got {}", self.window);
        }
        if !self.p_threshold.is_finite() || !self.np_threshold.is_finite() {
            bail!("thresholds must be finite");
        }
        if self.p_threshold < 0.0 {
            bail!("p_threshold must be non-negative, got {}", self.p_threshold);
        }
        if self.p_threshold >= self.np_threshold {
            bail!(
                "p_threshold ({}) must be below np_threshold ({})",
                self.p_threshold,
                self.np_threshold
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntropySignal {
    pub np_wall: bool,
    pub no_recovery: bool,
    #[serde(with = "finite_or_null")]
    pub delta_phi: f64,
    pub p_threshold: f64,
    pub np_threshold: f64,
    pub window: usize,
    pub confidence: f64,
    pub direction: i8,
}

impl EntropySignal {
    /// Start-up reading before a full window exists.
    pub fn degenerate(params: &AnalyzerParams) -> Self {
        Self {
            np_wall: false,
            no_recovery: false,
            delta_phi: f64::NAN,
            p_threshold: params.p_threshold,
            np_threshold: params.np_threshold,
            window: params.window,
            confidence: 0.0,
            direction: 0,
        }
    }

    pub fn is_sat(&self) -> bool {
        self.np_wall && self.no_recovery
    }
}

#[derive(Debug, Clone)]
pub struct EntropyAnalyzer {
    params: AnalyzerParams,
}

impl EntropyAnalyzer {
    pub fn new(params: AnalyzerParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &AnalyzerParams {
        &self.params
    }

    pub fn window(&self) -> usize {
        self.params.window
    }

    /// Clamp of the drift's position between the two thresholds; 0 for NaN.
    pub fn confidence(&self, dphi: f64) -> f64 {
        if dphi.is_nan() {
            return 0.0;
        }
        let span = (self.params.np_threshold - self.params.p_threshold).max(EPS);
        ((dphi - self.params.p_threshold) / span).clamp(0.0, 1.0)
    }

    pub fn is_np_wall(&self, dphi: f64) -> bool {
        dphi > self.params.np_threshold
    }

    /// True when every finite drift reading in `trail` is at or above P.
    pub fn is_no_recovery(&self, trail: &[f64]) -> bool {
        min_finite(trail).map_or(false, |m| m >= self.params.p_threshold)
    }

    /// Analyze the most recent window of `prices` (most recent last).
    ///
    /// Fewer than `window` prices yields the degenerate signal. Only the last
    /// `2 * window - 1` prices can influence the result, so longer histories
    /// are trimmed before the rolling pass. Non-finite prices in that tail
    /// are rejected; older prices are never read.
    pub fn analyze(&self, prices: &[f64]) -> Result<EntropySignal> {
        let w = self.params.window;
        let start = prices.len().saturating_sub(2 * w - 1);
        let tail = &prices[start..];
        if let Some((i, p)) = tail.iter().enumerate().find(|(_, p)| !p.is_finite()) {
            bail!("price at index {} is not finite: {}", start + i, p);
        }
        if prices.len() < w {
            return Ok(EntropySignal::degenerate(&self.params));
        }

        let series = rolling_delta_phi(tail, w);
        let window = &tail[tail.len() - w..];
        let dphi = delta_phi(window);
        let trail = &series[series.len() - w..];

        Ok(EntropySignal {
            np_wall: self.is_np_wall(dphi),
            no_recovery: self.is_no_recovery(trail),
            delta_phi: dphi,
            p_threshold: self.params.p_threshold,
            np_threshold: self.params.np_threshold,
            window: w,
            confidence: self.confidence(dphi),
            direction: direction_of(regression_slope(window)),
        })
    }

    pub fn capsule_for(&self, signal: &EntropySignal, inputs_fingerprint: &str) -> ProofCapsule {
        ProofCapsule::build(signal, inputs_fingerprint)
    }
}

/// Serializes non-finite floats as `null` and reads `null` back as NaN.
pub(crate) mod finite_or_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_f64(*v)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer(window: usize) -> EntropyAnalyzer {
        EntropyAnalyzer::new(AnalyzerParams {
            window,
            ..AnalyzerParams::default()
        })
        .unwrap()
    }

    #[test]
    fn test_insufficient_history_is_degenerate() {
        let a = analyzer(21);
        let sig = a.analyze(&[100.0; 20]).unwrap();
        assert!(!sig.np_wall && !sig.no_recovery);
        assert!(sig.delta_phi.is_nan());
        assert_eq!(sig.confidence, 0.0);
        assert_eq!(sig.direction, 0);
        assert_eq!(sig.window, 21);
    }

    #[test]
    fn test_rejects_non_finite_prices() {
        let a = analyzer(3);
        assert!(a.analyze(&[1.0, f64::NAN, 2.0]).is_err());
        assert!(a.analyze(&[1.0, f64::INFINITY]).is_err());
    }

    #[test]
    fn test_only_trailing_prices_are_read() {
        let a = analyzer(3);
        let mut prices = vec![f64::NAN, 7.0];
        prices.extend([100.0, 101.0, 99.0, 102.0, 103.0]);
        let clean = a.analyze(&prices[2..]).unwrap();
        assert_eq!(a.analyze(&prices).unwrap(), clean);

        prices[4] = f64::NAN;
        let err = a.analyze(&prices).unwrap_err();
        assert!(err.to_string().contains("index 4"));
    }

    #[test]
    fn test_rejects_bad_params() {
        let bad = AnalyzerParams { p_threshold: 0.1, np_threshold: 0.05, ..AnalyzerParams::default() };
        assert!(EntropyAnalyzer::new(bad).is_err());
        let tiny = AnalyzerParams { window: 1, ..AnalyzerParams::default() };
        assert!(EntropyAnalyzer::new(tiny).is_err());
    }

    #[test]
    fn test_flat_window() {
        let a = analyzer(5);
        let sig = a.analyze(&[100.0; 12]).unwrap();
        assert_eq!(sig.delta_phi, 0.0);
        assert!(!sig.np_wall);
        assert!(!sig.no_recovery);
        assert_eq!(sig.confidence, 0.0);
        assert_eq!(sig.direction, 0);
    }

    #[test]
    fn test_volatile_rising_window_hits_wall() {
        let a = analyzer(5);
        // every 5-window spans at least a 20% range
        let prices = [100.0, 80.0, 100.0, 80.0, 100.0, 80.0, 100.0, 90.0, 120.0];
        let sig = a.analyze(&prices).unwrap();
        assert!(sig.np_wall);
        assert!(sig.no_recovery);
        assert!(sig.is_sat());
        assert_eq!(sig.confidence, 1.0);
        assert_eq!(sig.direction, 1);
    }

    #[test]
    fn test_falling_window_direction() {
        let a = analyzer(5);
        let prices: Vec<f64> = (0..10).map(|i| 200.0 - 10.0 * i as f64).collect();
        let sig = a.analyze(&prices).unwrap();
        assert_eq!(sig.direction, -1);
    }

    #[test]
    fn test_confidence_monotone_and_bounded() {
        let a = analyzer(21);
        let mut prev = -1.0;
        for i in 0..200 {
            let d = i as f64 * 0.001;
            let c = a.confidence(d);
            assert!((0.0..=1.0).contains(&c));
            assert!(c >= prev);
            prev = c;
        }
        assert_eq!(a.confidence(f64::NAN), 0.0);
    }

    #[test]
    fn test_long_history_matches_trimmed_history() {
        let a = analyzer(6);
        let prices: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 8.0)
            .collect();
        let full = a.analyze(&prices).unwrap();
        let trimmed = a.analyze(&prices[prices.len() - 11..]).unwrap();
        assert_eq!(full, trimmed);
    }

    #[test]
    fn test_signal_json_nan_round_trip() {
        let sig = EntropySignal::degenerate(&AnalyzerParams::default());
        let text = serde_json::to_string(&sig).unwrap();
        assert!(text.contains("\"delta_phi\":null"));
        let back: EntropySignal = serde_json::from_str(&text).unwrap();
        assert!(back.delta_phi.is_nan());
    }
}
