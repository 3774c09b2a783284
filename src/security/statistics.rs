//! Stateless numeric primitives used by the anomaly detectors.
//!
//! Non-finite inputs are filtered out before any computation and an empty
//! sequence yields zeroed statistics rather than an error.

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

pub fn mean(values: &[f64]) -> f64 {
    let values = finite(values);
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (divisor n-1). Zero when fewer than two points.
pub fn variance(values: &[f64]) -> f64 {
    let values = finite(values);
    if values.len() <= 1 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    sum_sq / (values.len() - 1) as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Elements whose z-score against the full sequence is at or beyond
/// `threshold`. A zero standard deviation yields no outliers.
pub fn detect_outliers(values: &[f64], threshold: f64) -> Vec<f64> {
    let values = finite(values);
    let sd = std_dev(&values);
    if sd == 0.0 {
        return Vec::new();
    }
    let m = mean(&values);
    values
        .into_iter()
        .filter(|v| ((v - m) / sd).abs() >= threshold)
        .collect()
}

/// Has the newest measurement broken from recent history? All but the last
/// element form the baseline; the last is flagged when its z-score against
/// the baseline reaches `k`. A flat baseline yields no anomaly, matching the
/// zero-stddev guard in `detect_outliers`. Requires at least 3 points.
pub fn is_last_point_anomalous(values: &[f64], k: f64) -> bool {
    let values = finite(values);
    if values.len() < 3 {
        return false;
    }
    let (baseline, last) = values.split_at(values.len() - 1);
    let last = last[0];
    let m = mean(baseline);
    let sd = std_dev(baseline);
    last_point_z(last, m, sd) >= k
}

/// Z-score of the newest point against a baseline; zero when the baseline
/// has no spread.
pub fn last_point_z(last: f64, baseline_mean: f64, baseline_sd: f64) -> f64 {
    if baseline_sd > 0.0 {
        (last - baseline_mean) / baseline_sd
    } else {
        0.0
    }
}
