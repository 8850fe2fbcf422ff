//! Distribution functions needed by the paired tests.

/// Complementary error function (Chebyshev fit, fractional error < 1.2e-7).
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Upper tail of the chi-squared distribution with one degree of freedom.
pub fn chi2_sf_1df(x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    erfc((x / 2.0).sqrt())
}

/// P(X <= k) for X ~ Binomial(n, 1/2).
pub fn binomial_half_cdf(k: u64, n: u64) -> f64 {
    let mut coeff = 1.0_f64;
    let mut sum = 0.0_f64;
    for i in 0..=k.min(n) {
        if i > 0 {
            coeff = coeff * (n - i + 1) as f64 / i as f64;
        }
        sum += coeff;
    }
    sum / 2f64.powi(n as i32)
}

/// Null distribution of the signed-rank sum W+ for `n` untied ranks:
/// `counts[s]` is the number of sign assignments with W+ = s.
pub fn signed_rank_counts(n: usize) -> Vec<f64> {
    let max = n * (n + 1) / 2;
    let mut counts = vec![0.0; max + 1];
    counts[0] = 1.0;
    for rank in 1..=n {
        for s in (rank..=max).rev() {
            counts[s] += counts[s - rank];
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn reference_values() {
        assert!(close(erfc(0.0), 1.0, 1e-7));
        assert!(close(erfc(1.0), 0.157_299_207, 1e-6));
        assert!(close(erfc(-1.0), 1.842_700_793, 1e-6));
        assert!(close(normal_cdf(1.959_964), 0.975, 1e-6));
        assert!(close(chi2_sf_1df(3.841_459), 0.05, 1e-6));
        assert!(close(binomial_half_cdf(0, 10), 1.0 / 1024.0, 1e-12));
        assert!(close(binomial_half_cdf(10, 10), 1.0, 1e-12));
    }

    #[test]
    fn signed_rank_counts_sum_to_all_assignments() {
        let counts = signed_rank_counts(5);
        assert_eq!(counts.len(), 16);
        assert_eq!(counts.iter().sum::<f64>(), 32.0);
        assert_eq!(&counts[..6], &[1.0, 1.0, 1.0, 2.0, 2.0, 3.0]);
    }
}
