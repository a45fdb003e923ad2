//! Per-node short-horizon demand forecaster.
//!
//! Pure function of history and parameters: flat-fill below `min_samples`,
//! otherwise a low-order Fourier fit. Deterministic, never negative.

use std::collections::VecDeque;
use std::f64::consts::PI;

use rayon::prelude::*;
use statrs::statistics::Statistics;

/// Tunable forecaster parameters (mirrors the startup config knobs).
#[derive(Debug, Clone, Copy)]
pub struct ForecasterConfig {
    pub min_samples: usize,
    pub fourier_k: usize,
    pub fourier_period: f64,
    /// Residual-variance window.
    pub variance_window: usize,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            min_samples: 32,
            fourier_k: 2,
            fourier_period: 120.0,
            variance_window: 64,
        }
    }
}

/// One node's forecast output for this tick.
#[derive(Debug, Clone)]
pub struct NodeForecast {
    pub node_id: u8,
    /// `d_forecast[n][1..=horizon]`, one entry per future tick.
    pub projection: Vec<f32>,
    /// Mean squared residual of the fit over the last `variance_window`
    /// samples, used by the Confidence Gate.
    pub variance: f64,
}

struct FourierCoeffs {
    a0: f64,
    terms: Vec<(f64, f64)>, // (a_k, b_k) for k = 1..=K
}

fn fit_fourier(history: &[f32], period: f64, k_terms: usize) -> FourierCoeffs {
    let n = history.len() as f64;
    let a0 = history.iter().map(|&v| v as f64).mean();

    let mut terms = Vec::with_capacity(k_terms);
    for k in 1..=k_terms {
        let mut a_k = 0.0;
        let mut b_k = 0.0;
        for (i, &v) in history.iter().enumerate() {
            let phase = 2.0 * PI * (k as f64) * (i as f64) / period;
            a_k += v as f64 * phase.cos();
            b_k += v as f64 * phase.sin();
        }
        a_k *= 2.0 / n;
        b_k *= 2.0 / n;
        terms.push((a_k, b_k));
    }

    FourierCoeffs { a0, terms }
}

fn project(coeffs: &FourierCoeffs, period: f64, t: f64) -> f64 {
    let mut y = coeffs.a0;
    for (k, (a_k, b_k)) in coeffs.terms.iter().enumerate() {
        let k = (k + 1) as f64;
        let phase = 2.0 * PI * k * t / period;
        y += a_k * phase.cos() + b_k * phase.sin();
    }
    y.max(0.0)
}

/// Residual variance of the fit over the last `window` in-sample points.
fn residual_variance(history: &[f32], coeffs: &FourierCoeffs, period: f64, window: usize) -> f64 {
    let n = history.len();
    let start = n.saturating_sub(window);
    let residuals: Vec<f64> = history[start..]
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let t = (start + i) as f64;
            let fitted = project(coeffs, period, t);
            (v as f64 - fitted).powi(2)
        })
        .collect();
    if residuals.is_empty() {
        0.0
    } else {
        residuals.iter().copied().mean()
    }
}

/// Forecast one node's demand over `horizon` future ticks.
pub fn forecast_node(
    node_id: u8,
    history: &VecDeque<f32>,
    horizon: usize,
    cfg: &ForecasterConfig,
) -> NodeForecast {
    if history.len() < cfg.min_samples {
        let latest = history.back().copied().unwrap_or(0.0).max(0.0);
        return NodeForecast {
            node_id,
            projection: vec![latest; horizon],
            variance: 0.0,
        };
    }

    let hist: Vec<f32> = history.iter().copied().collect();
    let coeffs = fit_fourier(&hist, cfg.fourier_period, cfg.fourier_k);
    let n = hist.len() as f64;

    let projection = (1..=horizon)
        .map(|h| project(&coeffs, cfg.fourier_period, n + h as f64 - 1.0) as f32)
        .collect();

    let variance = residual_variance(&hist, &coeffs, cfg.fourier_period, cfg.variance_window);

    NodeForecast {
        node_id,
        projection,
        variance,
    }
}

/// Forecast every node in `histories`, fanned out across nodes with rayon
/// (the per-node fit is independent and this is the one place in the tick
/// pipeline where that parallelism pays for itself under budget).
pub fn forecast_all(
    histories: &[(u8, &VecDeque<f32>)],
    horizon: usize,
    cfg: &ForecasterConfig,
) -> Vec<NodeForecast> {
    histories
        .par_iter()
        .map(|(id, hist)| forecast_node(*id, hist, horizon, cfg))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_fill_below_min_samples() {
        let cfg = ForecasterConfig::default();
        let mut hist = VecDeque::new();
        hist.extend([1.0, 2.0, 3.0]);
        let f = forecast_node(1, &hist, 5, &cfg);
        assert_eq!(f.projection, vec![3.0; 5]);
        assert_eq!(f.variance, 0.0);
    }

    #[test]
    fn forecast_never_negative() {
        let cfg = ForecasterConfig {
            min_samples: 4,
            ..Default::default()
        };
        let mut hist = VecDeque::new();
        hist.extend([0.0, 0.0, 0.0, 0.0, 0.0]);
        let f = forecast_node(1, &hist, 10, &cfg);
        assert!(f.projection.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn periodic_signal_is_tracked() {
        let cfg = ForecasterConfig {
            min_samples: 8,
            fourier_k: 1,
            fourier_period: 10.0,
            variance_window: 64,
        };
        let mut hist = VecDeque::new();
        for i in 0..60 {
            let v = 5.0 + 3.0 * (2.0 * PI * i as f64 / 10.0).sin();
            hist.push_back(v.max(0.0) as f32);
        }
        let f = forecast_node(1, &hist, 10, &cfg);
        assert!(f.variance < 1.0, "expected a tight fit, got {}", f.variance);
        assert!(f.projection.iter().all(|&v| v >= 0.0 && v <= 9.0));
    }

    #[test]
    fn deterministic_across_calls() {
        let cfg = ForecasterConfig {
            min_samples: 4,
            ..Default::default()
        };
        let mut hist = VecDeque::new();
        hist.extend([1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let a = forecast_node(1, &hist, 5, &cfg);
        let b = forecast_node(1, &hist, 5, &cfg);
        assert_eq!(a.projection, b.projection);
    }
}
