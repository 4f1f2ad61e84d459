//! Shared numeric helpers.

/// Pivot magnitude below which a linear solve is treated as singular.
pub const PIVOT_EPSILON: f64 = 1e-12;

#[inline]
pub fn logsumexp(arr: &[f64]) -> f64 {
    if arr.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = arr.iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// `sigmoid(x) - sigmoid(y)` for `x > y`, without cancellation when both
/// sides saturate.
#[inline]
pub fn sigmoid_difference(x: f64, y: f64) -> f64 {
    sigmoid(x) * sigmoid(-y) * -(y - x).exp_m1()
}

#[inline]
pub fn clip(x: f64, min: f64, max: f64) -> f64 {
    x.max(min).min(max)
}

/// Rounds to a fixed number of decimal places.
#[inline]
pub fn round_to(x: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (x * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sigmoid_is_symmetric() {
        for &x in &[-40.0, -3.5, -0.1, 0.0, 0.7, 12.0, 40.0] {
            assert_relative_eq!(sigmoid(x) + sigmoid(-x), 1.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn log_sigmoid_does_not_underflow() {
        assert_relative_eq!(log_sigmoid(-800.0), -800.0, epsilon = 1e-9);
        assert!(log_sigmoid(800.0).abs() < 1e-300);
    }

    #[test]
    fn logsumexp_handles_large_values() {
        let v = [1000.0, 1000.0];
        assert_relative_eq!(logsumexp(&v), 1000.0 + 2f64.ln(), epsilon = 1e-12);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn sigmoid_difference_matches_naive_in_the_middle() {
        let naive = sigmoid(0.8) - sigmoid(-0.3);
        assert_relative_eq!(sigmoid_difference(0.8, -0.3), naive, epsilon = 1e-14);
        assert!(sigmoid_difference(60.0, 59.0) > 0.0);
    }

    #[test]
    fn round_to_keeps_requested_decimals() {
        assert_eq!(round_to(1.497_449, 4), 1.4974);
        assert_eq!(round_to(-0.000_04, 4), -0.0);
    }
}
