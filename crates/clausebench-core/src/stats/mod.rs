//! Paired significance tests, multiple-comparison correction, effect size and
//! bootstrap intervals. Everything here is pure; randomness comes from a seed.

pub mod dist;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ClauseBenchError, Result};

pub const DEFAULT_RESAMPLES: usize = 1000;
pub const DEFAULT_SEED: u64 = 42;

/// Discordant pairs at or above this count use the chi-squared approximation.
pub const MCNEMAR_EXACT_LIMIT: usize = 25;
/// Largest untied sample for which the exact signed-rank distribution is used.
pub const WILCOXON_EXACT_LIMIT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
    McNemarExact,
    McNemarChiSquare,
    WilcoxonExact,
    WilcoxonNormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub method: TestMethod,
    pub statistic: f64,
    pub p_value: f64,
    /// Pairs that carried information (discordant pairs, non-zero differences).
    pub n: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn contains(&self, x: f64) -> bool {
        self.lower <= x && x <= self.upper
    }
}

fn check_paired(a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(ClauseBenchError::Stats(format!(
            "paired inputs differ in length: {a} vs {b}"
        )));
    }
    Ok(())
}

/// Linear interpolation between order statistics (`q` in [0, 100]).
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Percentile bootstrap of an arbitrary statistic over resampled items.
pub fn bootstrap_ci_by<T, F>(items: &[T], resamples: usize, seed: u64, mut statistic: F) -> Result<ConfidenceInterval>
where
    F: FnMut(&[&T]) -> f64,
{
    if items.is_empty() {
        return Err(ClauseBenchError::Stats("bootstrap of an empty sample".into()));
    }
    if resamples == 0 {
        return Err(ClauseBenchError::Stats("bootstrap needs at least one resample".into()));
    }

    let all: Vec<&T> = items.iter().collect();
    let estimate = statistic(&all);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut draws = Vec::with_capacity(resamples);
    let mut resample: Vec<&T> = Vec::with_capacity(items.len());
    for _ in 0..resamples {
        resample.clear();
        resample.extend((0..items.len()).map(|_| &items[rng.gen_range(0..items.len())]));
        draws.push(statistic(&resample));
    }
    draws.sort_by(f64::total_cmp);

    Ok(ConfidenceInterval {
        estimate,
        lower: percentile(&draws, 2.5),
        upper: percentile(&draws, 97.5),
    })
}

/// 95% percentile bootstrap interval of the mean.
pub fn bootstrap_ci(values: &[f64], resamples: usize, seed: u64) -> Result<ConfidenceInterval> {
    bootstrap_ci_by(values, resamples, seed, |xs| {
        xs.iter().copied().sum::<f64>() / xs.len() as f64
    })
}

/// McNemar test on paired correctness. `b` counts pairs where A is wrong and B
/// right, `c` the reverse.
pub fn mcnemar(a_correct: &[bool], b_correct: &[bool]) -> Result<TestOutcome> {
    check_paired(a_correct.len(), b_correct.len())?;
    let (mut b, mut c) = (0usize, 0usize);
    for (&a, &bb) in a_correct.iter().zip(b_correct) {
        match (a, bb) {
            (false, true) => b += 1,
            (true, false) => c += 1,
            _ => {}
        }
    }
    Ok(mcnemar_counts(b, c))
}

pub fn mcnemar_counts(b: usize, c: usize) -> TestOutcome {
    let n = b + c;
    if n == 0 {
        return TestOutcome {
            method: TestMethod::McNemarExact,
            statistic: 0.0,
            p_value: 1.0,
            n,
        };
    }
    if n >= MCNEMAR_EXACT_LIMIT {
        let diff = (b as f64 - c as f64).abs() - 1.0;
        let statistic = diff.max(0.0).powi(2) / n as f64;
        return TestOutcome {
            method: TestMethod::McNemarChiSquare,
            statistic,
            p_value: dist::chi2_sf_1df(statistic),
            n,
        };
    }
    let k = b.min(c);
    TestOutcome {
        method: TestMethod::McNemarExact,
        statistic: k as f64,
        p_value: (2.0 * dist::binomial_half_cdf(k as u64, n as u64)).min(1.0),
        n,
    }
}

/// Two-sided Wilcoxon signed-rank test on paired differences `a - b`.
pub fn wilcoxon(a: &[f64], b: &[f64]) -> Result<TestOutcome> {
    check_paired(a.len(), b.len())?;
    let diffs: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).filter(|d| *d != 0.0).collect();
    let n = diffs.len();
    if n == 0 {
        return Ok(TestOutcome {
            method: TestMethod::WilcoxonExact,
            statistic: 0.0,
            p_value: 1.0,
            n,
        });
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| diffs[i].abs().total_cmp(&diffs[j].abs()));

    // Average ranks over runs of equal |d|, collecting tie sizes for the variance.
    let mut ranks = vec![0.0; n];
    let mut tie_sizes = Vec::new();
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && (diffs[order[j]].abs() - diffs[order[i]].abs()).abs() <= 1e-12 {
            j += 1;
        }
        let avg = (i + 1 + j) as f64 / 2.0;
        for &k in &order[i..j] {
            ranks[k] = avg;
        }
        if j - i > 1 {
            tie_sizes.push(j - i);
        }
        i = j;
    }

    let w_plus: f64 = (0..n).filter(|&k| diffs[k] > 0.0).map(|k| ranks[k]).sum();
    let w_minus: f64 = (0..n).filter(|&k| diffs[k] < 0.0).map(|k| ranks[k]).sum();
    let t = w_plus.min(w_minus);

    if n <= WILCOXON_EXACT_LIMIT && tie_sizes.is_empty() {
        let counts = dist::signed_rank_counts(n);
        let total = 2f64.powi(n as i32);
        let tail: f64 = counts.iter().take(t.round() as usize + 1).sum();
        return Ok(TestOutcome {
            method: TestMethod::WilcoxonExact,
            statistic: t,
            p_value: (2.0 * tail / total).min(1.0),
            n,
        });
    }

    let nf = n as f64;
    let mean = nf * (nf + 1.0) / 4.0;
    let tie_term: f64 = tie_sizes
        .iter()
        .map(|&s| {
            let s = s as f64;
            s.powi(3) - s
        })
        .sum::<f64>()
        / 48.0;
    let var = nf * (nf + 1.0) * (2.0 * nf + 1.0) / 24.0 - tie_term;
    let p_value = if var <= 0.0 {
        1.0
    } else {
        let z = (t - mean) / var.sqrt();
        (2.0 * dist::normal_cdf(-z.abs())).min(1.0)
    };
    Ok(TestOutcome {
        method: TestMethod::WilcoxonNormal,
        statistic: t,
        p_value,
        n,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BhOutcome {
    pub adjusted: Vec<f64>,
    pub reject: Vec<bool>,
}

/// Benjamini-Hochberg step-up procedure. Output is in input order.
pub fn benjamini_hochberg(p_values: &[f64], alpha: f64) -> Result<BhOutcome> {
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(ClauseBenchError::Stats(format!("alpha must be in (0, 1], got {alpha}")));
    }
    if let Some(bad) = p_values.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(ClauseBenchError::Stats(format!("p-value out of range: {bad}")));
    }

    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| p_values[i].total_cmp(&p_values[j]));

    let cutoff = (0..m)
        .rev()
        .find(|&r| p_values[order[r]] <= (r + 1) as f64 / m as f64 * alpha);

    let mut reject = vec![false; m];
    if let Some(k) = cutoff {
        for &idx in &order[..=k] {
            reject[idx] = true;
        }
    }

    let mut adjusted = vec![0.0; m];
    let mut running = f64::INFINITY;
    for r in (0..m).rev() {
        let idx = order[r];
        running = running.min(p_values[idx] * m as f64 / (r + 1) as f64);
        adjusted[idx] = running.min(1.0);
    }

    Ok(BhOutcome { adjusted, reject })
}

fn mean_and_ss(xs: &[f64]) -> (f64, f64) {
    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
    let ss = xs.iter().map(|x| (x - mean).powi(2)).sum();
    (mean, ss)
}

/// Cohen's d with pooled (ddof = 1) standard deviation: (mean(a) - mean(b)) / s_pooled.
pub fn cohens_d(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.is_empty() || b.is_empty() || a.len() + b.len() < 3 {
        return Err(ClauseBenchError::Stats(format!(
            "Cohen's d needs two non-empty groups and at least 3 observations, got {} and {}",
            a.len(),
            b.len()
        )));
    }
    let (mean_a, ss_a) = mean_and_ss(a);
    let (mean_b, ss_b) = mean_and_ss(b);
    let pooled = ((ss_a + ss_b) / (a.len() + b.len() - 2) as f64).sqrt();
    if pooled == 0.0 || !pooled.is_finite() {
        return Ok(0.0);
    }
    Ok((mean_a - mean_b) / pooled)
}
