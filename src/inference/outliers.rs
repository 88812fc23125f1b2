/// Percentile with linear interpolation between closest ranks.
/// `sorted` must be ascending and non-empty; `p` is in `[0, 100]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Upper fence `Q3 + multiplier * IQR` of `prices`. `None` when empty.
pub fn upper_fence(prices: &[i64], multiplier: f64) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = prices.iter().map(|p| *p as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    Some(q3 + multiplier * (q3 - q1))
}
