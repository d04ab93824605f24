// =============================================================================
// Mean Reversion Analyzer — tick-price statistics and return autocorrelation
// =============================================================================

/// Mean and population standard deviation of a price series.
pub fn mean_stddev(prices: &[f64]) -> (f64, f64) {
    if prices.is_empty() {
        return (0.0, 0.0);
    }

    let n = prices.len() as f64;
    let mean = prices.iter().sum::<f64>() / n;
    let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;

    (mean, variance.sqrt())
}

/// Deviation of `price` from the window mean in standard deviations.
/// Zero when the window shows no dispersion.
pub fn zscore(price: f64, mean: f64, stddev: f64) -> f64 {
    if stddev <= 0.0 {
        return 0.0;
    }
    (price - mean) / stddev
}

/// Lag-1 autocorrelation of log returns over the most recent `samples`
/// prices. Returns 0 when fewer than three returns exist or the returns show
/// no variance. The result is clamped to [-1, 1].
pub fn lag1_autocorrelation(prices: &[f64], samples: usize) -> f64 {
    let window = if prices.len() > samples {
        &prices[prices.len() - samples..]
    } else {
        prices
    };

    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();

    if returns.len() < 3 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum();

    if variance <= 0.0 {
        return 0.0;
    }

    let covariance: f64 = returns
        .windows(2)
        .map(|w| (w[0] - mean) * (w[1] - mean))
        .sum();

    (covariance / variance).clamp(-1.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_stddev_of_known_series() {
        let (mean, stddev) = mean_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((stddev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_series_is_zero() {
        assert_eq!(mean_stddev(&[]), (0.0, 0.0));
    }

    #[test]
    fn zscore_sign_and_magnitude() {
        assert!((zscore(104.0, 100.0, 2.0) - 2.0).abs() < 1e-9);
        assert!((zscore(96.0, 100.0, 2.0) + 2.0).abs() < 1e-9);
        // Flat window: no dispersion, no signal.
        assert_eq!(zscore(104.0, 100.0, 0.0), 0.0);
    }

    #[test]
    fn alternating_returns_are_anticorrelated() {
        // Price ping-pongs: returns alternate sign, so lag-1 correlation is
        // strongly negative.
        let mut prices = Vec::new();
        for i in 0..60 {
            prices.push(if i % 2 == 0 { 100.0 } else { 101.0 });
        }
        let r = lag1_autocorrelation(&prices, 100);
        assert!(r < -0.9, "expected strong anticorrelation, got {r}");
    }

    #[test]
    fn trending_returns_are_positively_correlated() {
        // Accelerating uptrend: consecutive returns grow together.
        let mut prices = vec![100.0];
        let mut step = 0.1;
        for _ in 0..60 {
            let last = *prices.last().unwrap();
            prices.push(last + step);
            step *= 1.05;
        }
        let r = lag1_autocorrelation(&prices, 100);
        assert!(r > 0.5, "expected positive correlation, got {r}");
    }

    #[test]
    fn short_or_flat_series_is_zero() {
        assert_eq!(lag1_autocorrelation(&[100.0, 101.0], 100), 0.0);
        assert_eq!(lag1_autocorrelation(&[100.0; 50], 100), 0.0);
    }

    #[test]
    fn result_is_clamped() {
        let mut prices = Vec::new();
        for i in 0..200 {
            prices.push(100.0 + i as f64);
        }
        let r = lag1_autocorrelation(&prices, 100);
        assert!((-1.0..=1.0).contains(&r));
    }
}
