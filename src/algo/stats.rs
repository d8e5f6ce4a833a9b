//! Statistical helpers over slices of samples.

use thiserror::Error;

/// Errors from slice statistics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    /// No finite values to compute the statistic from.
    #[error("insufficient data: {total} total values, 0 usable (all NaN or empty)")]
    Empty {
        /// Total number of input values, including NaN.
        total: usize,
    },
}

/// Median of a slice, filtering out NaN values.
///
/// For even-length data returns the average of the two middle values.
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return Err(StatsError::Empty {
            total: values.len(),
        });
    }

    valid.sort_by(|a, b| a.partial_cmp(b).expect("NaN filtered above"));

    let mid = valid.len() / 2;
    let median = if valid.len() % 2 == 0 {
        (valid[mid - 1] + valid[mid]) / 2.0
    } else {
        valid[mid]
    };
    Ok(median)
}

/// Arithmetic mean. Returns NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation. Returns NaN for an empty slice.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Robust standard deviation estimate from the median absolute deviation.
///
/// `σ ≈ 1.4826 · MAD` for Gaussian data; insensitive to a small fraction of
/// outliers, which makes it the right scale estimate for defect detection.
pub fn robust_sigma(values: &[f64]) -> Result<f64, StatsError> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    Ok(1.4826 * median(&deviations)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
    }

    #[test]
    fn test_median_even() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
    }

    #[test]
    fn test_median_filters_nan() {
        assert_eq!(median(&[f64::NAN, 5.0, 1.0, 3.0]).unwrap(), 3.0);
    }

    #[test]
    fn test_median_empty_errors() {
        assert!(matches!(median(&[]), Err(StatsError::Empty { total: 0 })));
        assert!(median(&[f64::NAN]).is_err());
    }

    #[test]
    fn test_mean_and_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(mean(&values), 5.0);
        assert_relative_eq!(std_dev(&values), 2.0);
    }

    #[test]
    fn test_robust_sigma_ignores_outlier() {
        // Tight cluster plus one wild outlier: classical std explodes,
        // the MAD estimate stays at the cluster scale.
        let mut values: Vec<f64> = (0..99).map(|i| 100.0 + (i % 5) as f64).collect();
        values.push(10_000.0);
        let robust = robust_sigma(&values).unwrap();
        assert!(robust < 5.0, "robust sigma {robust} should stay small");
        assert!(std_dev(&values) > 100.0);
    }
}
