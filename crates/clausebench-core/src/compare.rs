//! Run-versus-run comparison: paired tests overall and per tier, corrected as one family.

use serde::{Deserialize, Serialize};
use tabled::{Table, Tabled};

use crate::error::{ClauseBenchError, Result};
use crate::metrics::aggregate;
use crate::stats::{
    benjamini_hochberg, bootstrap_ci, bootstrap_ci_by, cohens_d, mcnemar, wilcoxon, TestMethod,
    DEFAULT_RESAMPLES, DEFAULT_SEED,
};
use crate::types::{RunSummary, SampleEvaluation, Tier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSettings {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_resamples")]
    pub bootstrap_resamples: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_alpha() -> f64 {
    0.05
}

fn default_resamples() -> usize {
    DEFAULT_RESAMPLES
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            bootstrap_resamples: default_resamples(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairedTest {
    /// Per-sample correctness (TP or TN).
    McNemar,
    /// Per-sample Jaccard overlap.
    Wilcoxon,
}

/// One test between two runs on one scope ("overall" or a tier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub test: PairedTest,
    pub scope: String,
    pub method: TestMethod,
    pub n: usize,
    pub statistic: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub reject: bool,
    /// Cohen's d of candidate over baseline on the tested per-sample measure.
    pub effect_size: Option<f64>,
    /// Mean per-sample difference (candidate - baseline).
    pub mean_difference: f64,
    /// Bootstrap 95% interval of the mean difference.
    pub ci: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub baseline: String,
    pub candidate: String,
    pub samples: usize,
    pub alpha: f64,
    pub f2_baseline: f64,
    pub f2_candidate: f64,
    pub f2_candidate_ci: Option<(f64, f64)>,
    pub results: Vec<ComparisonResult>,
}

#[derive(Tabled)]
struct ResultRow {
    test: String,
    scope: String,
    method: String,
    n: usize,
    statistic: String,
    p: String,
    #[tabled(rename = "adj p")]
    adjusted: String,
    reject: bool,
    d: String,
    #[tabled(rename = "95% CI diff")]
    ci: String,
}

impl ComparisonReport {
    pub fn result(&self, test: PairedTest, scope: &str) -> Option<&ComparisonResult> {
        self.results.iter().find(|r| r.test == test && r.scope == scope)
    }

    /// "Performance: ... F2 (95% CI: ...)" plus the comparison line against the baseline,
    /// using the overall McNemar result.
    pub fn summary_line(&self) -> String {
        let overall = self.result(PairedTest::McNemar, "overall");
        format_result(
            "F2",
            self.f2_candidate,
            self.f2_candidate_ci,
            Some(self.f2_baseline),
            overall.map(|r| r.adjusted_p_value),
            overall.and_then(|r| r.effect_size),
        )
    }

    pub fn table(&self) -> String {
        let rows: Vec<ResultRow> = self
            .results
            .iter()
            .map(|r| ResultRow {
                test: format!("{:?}", r.test).to_lowercase(),
                scope: r.scope.clone(),
                method: serde_json::to_value(r.method)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                n: r.n,
                statistic: format!("{:.3}", r.statistic),
                p: format_p(r.p_value),
                adjusted: format_p(r.adjusted_p_value),
                reject: r.reject,
                d: r.effect_size.map(|d| format!("{d:.2}")).unwrap_or_else(|| "-".into()),
                ci: r
                    .ci
                    .map(|(lo, hi)| format!("{lo:+.3} .. {hi:+.3}"))
                    .unwrap_or_else(|| "-".into()),
            })
            .collect();
        format!(
            "{} vs {} ({} samples, alpha {})\n{}\n{}\n",
            self.candidate,
            self.baseline,
            self.samples,
            self.alpha,
            Table::new(rows),
            self.summary_line()
        )
    }
}

fn format_p(p: f64) -> String {
    if p < 0.001 {
        "<0.001".to_string()
    } else {
        format!("{p:.3}")
    }
}

fn pct(x: f64) -> String {
    format!("{:.1}%", x * 100.0)
}

/// Reporting template:
/// `Performance: 87.3% F2 (95% CI: 85.1%-89.5%)` and, with a baseline,
/// `Comparison: +3.2% vs. baseline (p < 0.001, Cohen's d = 0.65)`.
pub fn format_result(
    metric: &str,
    value: f64,
    ci: Option<(f64, f64)>,
    baseline: Option<f64>,
    p_value: Option<f64>,
    effect_size: Option<f64>,
) -> String {
    let mut out = match ci {
        Some((lo, hi)) => format!("Performance: {} {metric} (95% CI: {}-{})", pct(value), pct(lo), pct(hi)),
        None => format!("Performance: {} {metric}", pct(value)),
    };

    if let Some(baseline) = baseline {
        let diff = value - baseline;
        let sign = if diff >= 0.0 { "+" } else { "" };
        out.push_str(&format!("\nComparison: {sign}{} vs. baseline", pct(diff)));
        if let Some(p) = p_value {
            if p < 0.001 {
                out.push_str(" (p < 0.001");
            } else {
                out.push_str(&format!(" (p = {p:.3}"));
            }
            match effect_size {
                Some(d) => out.push_str(&format!(", Cohen's d = {d:.2})")),
                None => out.push(')'),
            }
        }
    }
    out
}

/// Both runs must be complete and list the same sample IDs in the same order.
pub fn check_alignment(baseline: &RunSummary, candidate: &RunSummary) -> Result<()> {
    for run in [baseline, candidate] {
        if !run.complete {
            return Err(ClauseBenchError::Incomplete(run.name.clone()));
        }
    }
    let len = baseline.samples.len().max(candidate.samples.len());
    for index in 0..len {
        let left = baseline.samples.get(index).map(|s| s.id.as_str());
        let right = candidate.samples.get(index).map(|s| s.id.as_str());
        if left != right {
            return Err(ClauseBenchError::Alignment {
                index,
                left: left.map(str::to_string),
                right: right.map(str::to_string),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct Comparator {
    settings: ComparisonSettings,
}

impl Comparator {
    pub fn new(settings: ComparisonSettings) -> Self {
        Self { settings }
    }

    pub fn compare(&self, baseline: &RunSummary, candidate: &RunSummary) -> Result<ComparisonReport> {
        check_alignment(baseline, candidate)?;

        let mut scopes: Vec<(String, Vec<usize>)> =
            vec![("overall".to_string(), (0..baseline.samples.len()).collect())];
        for tier in Tier::ALL {
            let idx: Vec<usize> = baseline
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.tier == tier)
                .map(|(i, _)| i)
                .collect();
            if !idx.is_empty() {
                scopes.push((tier.to_string(), idx));
            }
        }

        let mut results = Vec::with_capacity(scopes.len() * 2);
        for (scope, idx) in &scopes {
            let a_correct = pick(baseline, idx, correctness);
            let b_correct = pick(candidate, idx, correctness);
            let outcome = mcnemar(&to_bools(&a_correct), &to_bools(&b_correct))?;
            results.push(self.result(PairedTest::McNemar, scope, outcome, &a_correct, &b_correct)?);

            let a_jaccard = pick(baseline, idx, |s| s.jaccard);
            let b_jaccard = pick(candidate, idx, |s| s.jaccard);
            let outcome = wilcoxon(&a_jaccard, &b_jaccard)?;
            results.push(self.result(PairedTest::Wilcoxon, scope, outcome, &a_jaccard, &b_jaccard)?);
        }

        let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
        let bh = benjamini_hochberg(&p_values, self.settings.alpha)?;
        for (r, (adjusted, reject)) in results.iter_mut().zip(bh.adjusted.into_iter().zip(bh.reject)) {
            r.adjusted_p_value = adjusted;
            r.reject = reject;
        }

        let f2_candidate_ci = match candidate.metrics.f2_ci {
            Some(ci) => Some(ci),
            None if !candidate.samples.is_empty() => Some(
                bootstrap_ci_by(
                    &candidate.samples,
                    self.settings.bootstrap_resamples,
                    self.settings.seed,
                    |xs| aggregate(xs.iter().copied()).f2,
                )?
                .bounds(),
            ),
            None => None,
        };

        Ok(ComparisonReport {
            baseline: baseline.name.clone(),
            candidate: candidate.name.clone(),
            samples: baseline.samples.len(),
            alpha: self.settings.alpha,
            f2_baseline: baseline.metrics.metrics.f2,
            f2_candidate: candidate.metrics.metrics.f2,
            f2_candidate_ci,
            results,
        })
    }

    fn result(
        &self,
        test: PairedTest,
        scope: &str,
        outcome: crate::stats::TestOutcome,
        baseline: &[f64],
        candidate: &[f64],
    ) -> Result<ComparisonResult> {
        let diffs: Vec<f64> = candidate.iter().zip(baseline).map(|(b, a)| b - a).collect();
        let mean_difference = if diffs.is_empty() {
            0.0
        } else {
            diffs.iter().sum::<f64>() / diffs.len() as f64
        };
        let ci = if diffs.is_empty() {
            None
        } else {
            Some(bootstrap_ci(&diffs, self.settings.bootstrap_resamples, self.settings.seed)?.bounds())
        };

        Ok(ComparisonResult {
            test,
            scope: scope.to_string(),
            method: outcome.method,
            n: outcome.n,
            statistic: outcome.statistic,
            p_value: outcome.p_value,
            adjusted_p_value: outcome.p_value,
            reject: false,
            effect_size: cohens_d(candidate, baseline).ok(),
            mean_difference,
            ci,
        })
    }
}

fn pick(run: &RunSummary, idx: &[usize], f: impl Fn(&SampleEvaluation) -> f64) -> Vec<f64> {
    idx.iter().map(|&i| f(&run.samples[i])).collect()
}

fn correctness(s: &SampleEvaluation) -> f64 {
    if s.classification.is_correct() {
        1.0
    } else {
        0.0
    }
}

fn to_bools(xs: &[f64]) -> Vec<bool> {
    xs.iter().map(|&x| x > 0.5).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Value;

    use super::*;
    use crate::metrics::aggregate_run;
    use crate::types::Classification;

    fn summary(name: &str, outcomes: &[(Tier, Classification, f64)]) -> RunSummary {
        let samples: Vec<SampleEvaluation> = outcomes
            .iter()
            .enumerate()
            .map(|(i, &(tier, classification, jaccard))| SampleEvaluation {
                id: format!("s{i}"),
                category: "Governing Law".into(),
                tier,
                classification,
                jaccard,
                grounding_rate: 1.0,
                lazy: false,
                failed: false,
                parse_error: None,
                failure: None,
                confidence: None,
                specialist: None,
            })
            .collect();
        RunSummary {
            name: name.into(),
            created_at: Utc::now(),
            complete: true,
            config: Value::Null,
            metrics: aggregate_run(&samples).unwrap(),
            samples,
            diagnostics: None,
            architecture: None,
        }
    }

    fn pair() -> (RunSummary, RunSummary) {
        use Classification as C;
        let mut a = Vec::new();
        let mut b = Vec::new();
        for i in 0..40 {
            let tier = if i % 2 == 0 { Tier::Common } else { Tier::Rare };
            // baseline misses most positives; candidate finds them
            let base = if i % 4 == 0 { C::Tp } else { C::Fn };
            a.push((tier, base, if base == C::Tp { 0.6 } else { 0.0 }));
            b.push((tier, C::Tp, 0.5 + (i % 5) as f64 / 10.0));
        }
        (summary("zero_shot", &a), summary("multi_agent", &b))
    }

    #[test]
    fn report_covers_overall_and_tiers() {
        let (a, b) = pair();
        let report = Comparator::default().compare(&a, &b).unwrap();
        // overall + two populated tiers, two tests each
        assert_eq!(report.results.len(), 6);
        let overall = report.result(PairedTest::McNemar, "overall").unwrap();
        assert_eq!(overall.n, 30);
        assert_eq!(overall.method, TestMethod::McNemarChiSquare);
        assert!(overall.reject);
        assert!(overall.adjusted_p_value >= overall.p_value);
        assert!(overall.effect_size.unwrap() > 0.0);
        assert!(overall.mean_difference > 0.0);
        assert!(report.result(PairedTest::Wilcoxon, "rare").is_some());
        assert!(report.result(PairedTest::McNemar, "moderate").is_none());
        assert!(report.f2_candidate > report.f2_baseline);
        assert!(report.summary_line().starts_with("Performance: 100.0% F2 (95% CI:"));
        assert!(report.table().contains("overall"));
    }

    #[test]
    fn table_carries_header_and_result_line_once() {
        let (a, b) = pair();
        let report = Comparator::default().compare(&a, &b).unwrap();
        let table = report.table();
        assert!(table.starts_with("multi_agent vs zero_shot (40 samples, alpha 0.05)"));
        assert_eq!(table.matches(report.summary_line().as_str()).count(), 1);
    }

    #[test]
    fn misaligned_runs_are_rejected() {
        let (a, mut b) = pair();
        b.samples.swap(3, 4);
        let err = Comparator::default().compare(&a, &b).unwrap_err();
        assert!(matches!(err, ClauseBenchError::Alignment { index: 3, .. }));

        let (a, mut b) = pair();
        b.samples.pop();
        let err = Comparator::default().compare(&a, &b).unwrap_err();
        assert!(matches!(err, ClauseBenchError::Alignment { index: 39, right: None, .. }));
    }

    #[test]
    fn incomplete_runs_are_refused() {
        let (a, mut b) = pair();
        b.complete = false;
        let err = Comparator::default().compare(&a, &b).unwrap_err();
        assert!(matches!(err, ClauseBenchError::Incomplete(name) if name == "multi_agent"));
    }

    #[test]
    fn identical_runs_show_no_difference() {
        let (a, _) = pair();
        let mut b = a.clone();
        b.name = "rerun".into();
        let report = Comparator::default().compare(&a, &b).unwrap();
        for r in &report.results {
            assert_eq!(r.p_value, 1.0);
            assert!(!r.reject);
            assert_eq!(r.mean_difference, 0.0);
        }
    }

    #[test]
    fn result_line_template() {
        assert_eq!(
            format_result("F2", 0.873, Some((0.851, 0.895)), Some(0.841), Some(0.0004), Some(0.65)),
            "Performance: 87.3% F2 (95% CI: 85.1%-89.5%)\nComparison: +3.2% vs. baseline (p < 0.001, Cohen's d = 0.65)"
        );
        assert_eq!(
            format_result("F2", 0.5, None, Some(0.6), Some(0.2), None),
            "Performance: 50.0% F2\nComparison: -10.0% vs. baseline (p = 0.200)"
        );
        assert_eq!(format_result("F1", 0.25, None, None, None, None), "Performance: 25.0% F1");
    }
}
