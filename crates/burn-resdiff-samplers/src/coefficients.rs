//! Per-step coefficient sequences
//!
//! Both the residual weights and the noise-variance weights of the forward
//! process come from [`gen_coefficients`]: a sequence over the horizon that
//! sums to one before scaling.

/// Shape of a coefficient sequence over the timestep horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoefficientShape {
    /// Linear ramp `i / (T(T+1)/2)` for `i = 1..=T`
    #[default]
    Increased,
    /// The increased ramp reversed
    Decreased,
    /// Constant `1/T`
    Average,
}

/// Tolerance on the unscaled sum of a generated sequence
pub const SUM_TOLERANCE: f64 = 1e-10;

/// Generates `num_timesteps` weights of the given shape, multiplied by `sum_scale`
///
/// # Panics
///
/// If the unscaled sequence does not sum to one within [`SUM_TOLERANCE`].
/// That cannot happen for any `num_timesteps >= 1` and signals a bug.
pub fn gen_coefficients(num_timesteps: usize, shape: CoefficientShape, sum_scale: f64) -> Vec<f64> {
    let t = num_timesteps as f64;
    let ramp_total = 0.5 * t * (t + 1.0);

    let raw: Vec<f64> = match shape {
        CoefficientShape::Increased => (1..=num_timesteps).map(|i| i as f64 / ramp_total).collect(),
        CoefficientShape::Decreased => (1..=num_timesteps).rev().map(|i| i as f64 / ramp_total).collect(),
        CoefficientShape::Average => vec![1.0 / t; num_timesteps],
    };

    let sum: f64 = raw.iter().sum();
    assert!(
        (sum - 1.0).abs() < SUM_TOLERANCE,
        "{shape:?} coefficients over {num_timesteps} steps sum to {sum}, expected 1"
    );

    raw.into_iter().map(|c| c * sum_scale).collect()
}

/// Running sum clipped to `[0, 1]`
pub fn clipped_cumsum(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .scan(0.0, |acc, &v| {
            *acc += v;
            Some(acc.clamp(0.0, 1.0))
        })
        .collect()
}

/// `values` shifted right by one, with `first` in front (length preserved)
pub(crate) fn shifted_prev(values: &[f64], first: f64) -> Vec<f64> {
    std::iter::once(first)
        .chain(values.iter().copied().take(values.len().saturating_sub(1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_sum_to_one() {
        for t in [1, 2, 7, 10, 100, 1000, 4096] {
            for shape in [
                CoefficientShape::Increased,
                CoefficientShape::Decreased,
                CoefficientShape::Average,
            ] {
                let sum: f64 = gen_coefficients(t, shape, 1.0).iter().sum();
                assert!((sum - 1.0).abs() < SUM_TOLERANCE, "{shape:?} T={t}: {sum}");
            }
        }
    }

    #[test]
    fn test_shapes_are_monotone() {
        let inc = gen_coefficients(50, CoefficientShape::Increased, 1.0);
        let dec = gen_coefficients(50, CoefficientShape::Decreased, 1.0);
        assert!(inc.windows(2).all(|w| w[0] < w[1]));
        assert!(dec.windows(2).all(|w| w[0] > w[1]));

        let rev: Vec<f64> = inc.iter().rev().copied().collect();
        assert_eq!(rev, dec);
    }

    #[test]
    fn test_scale_is_applied() {
        let scaled = gen_coefficients(10, CoefficientShape::Increased, 0.01);
        let sum: f64 = scaled.iter().sum();
        assert!((sum - 0.01).abs() < 1e-12);
        assert!((scaled[9] - 0.01 * 10.0 / 55.0).abs() < 1e-15);

        let avg = gen_coefficients(4, CoefficientShape::Average, 2.0);
        assert_eq!(avg, vec![0.5; 4]);
    }

    #[test]
    fn test_clipped_cumsum() {
        assert_eq!(clipped_cumsum(&[0.25, 0.5, 0.5]), vec![0.25, 0.75, 1.0]);
        assert_eq!(shifted_prev(&[1.0, 2.0, 3.0], 9.0), vec![9.0, 1.0, 2.0]);
    }
}
