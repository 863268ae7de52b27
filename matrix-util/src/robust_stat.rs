//! Order statistics for outlier thresholds.

/// Median of a slice; `None` if empty or any value is NaN
pub fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() || values.iter().any(|x| x.is_nan()) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    } else {
        Some(sorted[n / 2])
    }
}

/// Median and median absolute deviation `median(|x - median(x)|)`
/// multiplied by `consistency` (1.4826 for the normal-consistent
/// estimator, 1 for the raw MAD)
pub fn median_mad(values: &[f32], consistency: f32) -> Option<(f32, f32)> {
    let m = median(values)?;
    let dev = values.iter().map(|&x| (x - m).abs()).collect::<Vec<_>>();
    let mad = median(&dev)?;
    Some((m, mad * consistency))
}
