//! Window statistics over price series.
//!
//! The drift reading (ΔΦ) of a window is its normalized range
//! `(max - min) / max(|max|, EPS)`. `RollingRange` maintains it incrementally;
//! the free functions are the point-in-time forms used by the analyzer.

use std::collections::VecDeque;

/// Floor for denominators that may collapse to zero (zero price, zero range).
pub const EPS: f64 = 1e-9;

/// Added to the index variance before dividing in the regression slope.
const SLOPE_EPS: f64 = 1e-12;

// =============================================================================
// Drift
// =============================================================================

/// Drift of a single window. NaN for an empty window.
pub fn delta_phi(window: &[f64]) -> f64 {
    if window.is_empty() {
        return f64::NAN;
    }
    let hi = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lo = window.iter().copied().fold(f64::INFINITY, f64::min);
    normalized_range(hi, lo)
}

#[inline]
fn normalized_range(hi: f64, lo: f64) -> f64 {
    (hi - lo) / hi.abs().max(EPS)
}

/// Rolling max/min over a fixed window using monotonic deques.
#[derive(Debug, Clone)]
pub struct RollingRange {
    period: usize,
    seen: usize,
    maxq: VecDeque<(usize, f64)>,
    minq: VecDeque<(usize, f64)>,
}

impl RollingRange {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            seen: 0,
            maxq: VecDeque::with_capacity(period),
            minq: VecDeque::with_capacity(period),
        }
    }

    /// Push the next price; returns the window drift once `period` prices were seen.
    pub fn update(&mut self, price: f64) -> Option<f64> {
        let idx = self.seen;
        self.seen += 1;

        while matches!(self.maxq.back(), Some(&(_, v)) if v <= price) {
            self.maxq.pop_back();
        }
        self.maxq.push_back((idx, price));
        while matches!(self.minq.back(), Some(&(_, v)) if v >= price) {
            self.minq.pop_back();
        }
        self.minq.push_back((idx, price));

        let oldest = (idx + 1).saturating_sub(self.period);
        while matches!(self.maxq.front(), Some(&(i, _)) if i < oldest) {
            self.maxq.pop_front();
        }
        while matches!(self.minq.front(), Some(&(i, _)) if i < oldest) {
            self.minq.pop_front();
        }

        if !self.is_ready() {
            return None;
        }
        let hi = self.maxq.front().map(|&(_, v)| v)?;
        let lo = self.minq.front().map(|&(_, v)| v)?;
        Some(normalized_range(hi, lo))
    }

    pub fn is_ready(&self) -> bool {
        self.seen >= self.period
    }
}

/// Drift of every window ending at each index. Indices before `window - 1` are NaN.
pub fn rolling_delta_phi(prices: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; prices.len()];
    if window == 0 || prices.len() < window {
        return out;
    }
    let mut range = RollingRange::new(window);
    for (i, &p) in prices.iter().enumerate() {
        if let Some(d) = range.update(p) {
            out[i] = d;
        }
    }
    out
}

/// Minimum of the finite entries, `None` when there are none.
pub fn min_finite(values: &[f64]) -> Option<f64> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.min(v))))
}

// =============================================================================
// Trend
// =============================================================================

/// Least-squares slope of `y` against its index 0..n (population moments).
pub fn regression_slope(y: &[f64]) -> f64 {
    let n = y.len();
    if n == 0 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = y.iter().sum::<f64>() / nf;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, &v) in y.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (v - mean_y);
        var += dx * dx;
    }
    (cov / nf) / (var / nf + SLOPE_EPS)
}

/// Sign of a slope as -1, 0 or 1.
pub fn direction_of(slope: f64) -> i8 {
    if slope > 0.0 {
        1
    } else if slope < 0.0 {
        -1
    } else {
        0
    }
}

// =============================================================================
// Returns
// =============================================================================

/// Simple period returns; the first entry is 0.
pub fn pct_returns(prices: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(prices.len());
    for i in 0..prices.len() {
        if i == 0 {
            out.push(0.0);
        } else {
            out.push(prices[i] / prices[i - 1] - 1.0);
        }
    }
    out
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1). NaN with fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Most negative `value / running_peak - 1` over the series.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.min(v / peak - 1.0);
        }
    }
    worst
}
