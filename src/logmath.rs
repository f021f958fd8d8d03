//! Log-domain arithmetic.
//!
//! Probabilities in the lattice are carried as natural logarithms. Adding two
//! probabilities is `log_add`; `-inf` is the additive identity and
//! `log_add(-inf, -inf)` is `-inf`, never NaN.

/// Log of zero probability.
pub const NEG_INF: f32 = f32::NEG_INFINITY;

/// `ln(exp(a) + exp(b))`, computed without overflow.
#[inline]
pub fn log_add(a: f32, b: f32) -> f32 {
    if a == NEG_INF {
        return b;
    }
    if b == NEG_INF {
        return a;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// `a - b` where `b` is a log-normalizer of `a`.
///
/// Zero over zero is taken as zero, so `log_div(-inf, -inf)` is `-inf`.
#[inline]
pub fn log_div(a: f32, b: f32) -> f32 {
    if a == NEG_INF || b == NEG_INF {
        return NEG_INF;
    }
    a - b
}

/// `ln(Σ exp(x_i))` with the max-shift trick.
///
/// Returns `-inf` for an empty slice or when every element is `-inf`.
#[inline]
pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(NEG_INF, f32::max);
    if max == NEG_INF {
        return NEG_INF;
    }
    let sum: f32 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn test_log_add_identity() {
        assert_eq!(log_add(NEG_INF, NEG_INF), NEG_INF);
        assert_eq!(log_add(NEG_INF, -2.5), -2.5);
        assert_eq!(log_add(-2.5, NEG_INF), -2.5);
    }

    #[test]
    fn test_log_add_matches_direct() {
        for &(a, b) in &[(-1.0f32, -2.0f32), (0.0, 0.0), (-30.0, -0.1), (3.0, -4.0)] {
            let expected = (a.exp() + b.exp()).ln();
            assert!((log_add(a, b) - expected).abs() < EPSILON, "a={a} b={b}");
            assert_eq!(log_add(a, b), log_add(b, a));
        }
    }

    #[test]
    fn test_log_add_large_magnitudes() {
        let r = log_add(1000.0, 1000.0);
        assert!((r - (1000.0 + 2f32.ln())).abs() < 1e-3);
        assert!(log_add(-1000.0, -1000.0).is_finite());
    }

    #[test]
    fn test_log_div_degenerate() {
        assert_eq!(log_div(NEG_INF, NEG_INF), NEG_INF);
        assert_eq!(log_div(NEG_INF, -3.0), NEG_INF);
        assert!((log_div(-1.0, 0.5) + 1.5).abs() < EPSILON);
        let degenerate = log_div(NEG_INF, log_sum_exp(&[NEG_INF; 3]));
        assert!(!degenerate.is_nan());
    }

    #[test]
    fn test_log_sum_exp() {
        let values = [0.5f32, -1.0, 2.0];
        let expected = values.iter().map(|x| x.exp()).sum::<f32>().ln();
        assert!((log_sum_exp(&values) - expected).abs() < EPSILON);
        assert_eq!(log_sum_exp(&[]), NEG_INF);
        assert_eq!(log_sum_exp(&[NEG_INF, NEG_INF]), NEG_INF);
        assert!((log_sum_exp(&[500.0, 500.0]) - (500.0 + 2f32.ln())).abs() < 1e-3);
    }
}
