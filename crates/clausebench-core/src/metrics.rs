//! Folding sample evaluations into run metrics.

use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use crate::error::{ClauseBenchError, Result};
use crate::stats::bootstrap_ci_by;
use crate::types::{Classification, Metrics, RunMetrics, SampleEvaluation, Tier};

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// F-beta from precision and recall; 0 when both are 0.
pub fn f_beta(precision: f64, recall: f64, beta: f64) -> f64 {
    let b2 = beta * beta;
    let den = b2 * precision + recall;
    if den == 0.0 {
        0.0
    } else {
        (1.0 + b2) * precision * recall / den
    }
}

/// Pure fold over any subset of a run.
pub fn aggregate<'a, I>(evaluations: I) -> Metrics
where
    I: IntoIterator<Item = &'a SampleEvaluation>,
{
    let mut m = Metrics::default();
    let mut jaccard_sum = 0.0;
    let mut grounding_sum = 0.0;

    for e in evaluations {
        m.total += 1;
        match e.classification {
            Classification::Tp => m.tp += 1,
            Classification::Fp => m.fp += 1,
            Classification::Fn => m.fn_ += 1,
            Classification::Tn => m.tn += 1,
        }
        if e.lazy {
            m.laziness_events += 1;
        }
        if e.failed {
            m.failed += 1;
        }
        if e.parse_error.is_some() {
            m.parse_errors += 1;
        }
        jaccard_sum += e.jaccard;
        grounding_sum += e.grounding_rate;
    }

    m.precision = ratio(m.tp, m.tp + m.fp);
    m.recall = ratio(m.tp, m.tp + m.fn_);
    m.f1 = f_beta(m.precision, m.recall, 1.0);
    m.f2 = f_beta(m.precision, m.recall, 2.0);
    m.laziness_rate = ratio(m.laziness_events, m.positives());
    if m.total > 0 {
        m.avg_jaccard = jaccard_sum / m.total as f64;
        m.avg_grounding_rate = grounding_sum / m.total as f64;
        m.hallucination_rate = 1.0 - m.avg_grounding_rate;
    }
    m
}

fn check_tier_sums(overall: &Metrics, per_tier: &BTreeMap<Tier, Metrics>) -> Result<()> {
    let sum = |f: fn(&Metrics) -> usize| per_tier.values().map(f).sum::<usize>();
    let checks: [(&str, usize, usize); 6] = [
        ("total", overall.total, sum(|m| m.total)),
        ("tp", overall.tp, sum(|m| m.tp)),
        ("fp", overall.fp, sum(|m| m.fp)),
        ("fn", overall.fn_, sum(|m| m.fn_)),
        ("tn", overall.tn, sum(|m| m.tn)),
        ("laziness_events", overall.laziness_events, sum(|m| m.laziness_events)),
    ];
    for (name, total, tiers) in checks {
        if total != tiers {
            return Err(ClauseBenchError::Invariant(format!(
                "per-tier {name} sums to {tiers}, overall is {total}"
            )));
        }
    }
    Ok(())
}

/// Overall, per-tier and per-category metrics. Every tier is present, empty or not.
pub fn aggregate_run(evaluations: &[SampleEvaluation]) -> Result<RunMetrics> {
    let metrics = aggregate(evaluations);

    let per_tier: BTreeMap<Tier, Metrics> = Tier::ALL
        .iter()
        .map(|&tier| (tier, aggregate(evaluations.iter().filter(|e| e.tier == tier))))
        .collect();
    check_tier_sums(&metrics, &per_tier)?;

    let mut by_category: BTreeMap<&str, Vec<&SampleEvaluation>> = BTreeMap::new();
    for e in evaluations {
        by_category.entry(e.category.as_str()).or_default().push(e);
    }
    let per_category = by_category
        .into_iter()
        .map(|(category, evals)| (category.to_string(), aggregate(evals)))
        .collect();

    Ok(RunMetrics {
        metrics,
        per_tier,
        per_category,
        f1_ci: None,
        f2_ci: None,
    })
}

/// Attach percentile-bootstrap intervals for F1 and F2, resampling whole samples.
pub fn with_confidence_intervals(
    mut run: RunMetrics,
    evaluations: &[SampleEvaluation],
    resamples: usize,
    seed: u64,
) -> Result<RunMetrics> {
    if evaluations.is_empty() {
        return Ok(run);
    }
    let f1 = bootstrap_ci_by(evaluations, resamples, seed, |xs| aggregate(xs.iter().copied()).f1)?;
    let f2 = bootstrap_ci_by(evaluations, resamples, seed, |xs| aggregate(xs.iter().copied()).f2)?;
    run.f1_ci = Some(f1.bounds());
    run.f2_ci = Some(f2.bounds());
    Ok(run)
}

/// Result of closing an accumulator against the dataset it was meant to cover.
#[derive(Debug, Clone)]
pub struct Accumulated {
    /// Evaluations in dataset order.
    pub evaluations: Vec<SampleEvaluation>,
    pub metrics: RunMetrics,
    pub missing: Vec<String>,
}

impl Accumulated {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Append-only collection of evaluations owned by the run loop.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    seen: HashSet<String>,
    evaluations: Vec<SampleEvaluation>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, evaluation: SampleEvaluation) -> Result<()> {
        if !self.seen.insert(evaluation.id.clone()) {
            return Err(ClauseBenchError::Invariant(format!(
                "sample '{}' evaluated twice",
                evaluation.id
            )));
        }
        self.evaluations.push(evaluation);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.evaluations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluations.is_empty()
    }

    pub fn evaluations(&self) -> &[SampleEvaluation] {
        &self.evaluations
    }

    /// Reorder to `expected_ids` and aggregate. IDs never evaluated are reported as missing.
    pub fn finish(self, expected_ids: &[String]) -> Result<Accumulated> {
        let mut by_id: BTreeMap<String, SampleEvaluation> = self
            .evaluations
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        let mut evaluations = Vec::with_capacity(by_id.len());
        let mut missing = Vec::new();
        for id in expected_ids {
            match by_id.remove(id) {
                Some(e) => evaluations.push(e),
                None => missing.push(id.clone()),
            }
        }
        if !by_id.is_empty() {
            warn!(extra = by_id.len(), "evaluations for samples outside the dataset");
            evaluations.extend(by_id.into_values());
        }

        let metrics = aggregate_run(&evaluations)?;
        Ok(Accumulated {
            evaluations,
            metrics,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(id: &str, tier: Tier, classification: Classification) -> SampleEvaluation {
        SampleEvaluation {
            id: id.to_string(),
            category: format!("{tier}-cat"),
            tier,
            classification,
            jaccard: if classification.is_correct() { 1.0 } else { 0.0 },
            grounding_rate: 1.0,
            lazy: false,
            failed: false,
            parse_error: None,
            failure: None,
            confidence: None,
            specialist: None,
        }
    }

    fn run() -> Vec<SampleEvaluation> {
        use Classification as C;
        vec![
            eval("1", Tier::Common, C::Tp),
            eval("2", Tier::Common, C::Tp),
            eval("3", Tier::Moderate, C::Fp),
            eval("4", Tier::Moderate, C::Fn),
            eval("5", Tier::Rare, C::Tn),
            eval("6", Tier::Rare, C::Fn),
        ]
    }

    #[test]
    fn f_scores() {
        assert_eq!(f_beta(0.0, 0.0, 2.0), 0.0);
        assert!((f_beta(0.5, 1.0, 1.0) - 2.0 / 3.0).abs() < 1e-12);
        // F2 weights recall: 5 * 0.5 * 1 / (4 * 0.5 + 1)
        assert!((f_beta(0.5, 1.0, 2.0) - 2.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn fold_counts_and_rates() {
        let mut evals = run();
        evals[3].lazy = true;
        evals[5].parse_error = Some("missing terminator marker".into());
        let m = aggregate(&evals);
        assert_eq!((m.tp, m.fp, m.fn_, m.tn, m.total), (2, 1, 2, 1, 6));
        assert!((m.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.recall - 0.5).abs() < 1e-12);
        assert_eq!(m.laziness_events, 1);
        assert!((m.laziness_rate - 0.25).abs() < 1e-12);
        assert_eq!(m.parse_errors, 1);
        assert!((m.avg_jaccard - 0.5).abs() < 1e-12);
        assert_eq!(m.hallucination_rate, 0.0);

        let empty = aggregate(std::iter::empty());
        assert_eq!((empty.precision, empty.recall, empty.f2), (0.0, 0.0, 0.0));
    }

    #[test]
    fn per_tier_sums_to_totals() {
        let run = aggregate_run(&run()).unwrap();
        assert_eq!(run.per_tier.len(), 3);
        assert_eq!(run.per_tier[&Tier::Common].tp, 2);
        assert_eq!(run.per_tier[&Tier::Rare].tn, 1);
        let tier_total: usize = run.per_tier.values().map(|m| m.total).sum();
        assert_eq!(tier_total, run.metrics.total);
        assert_eq!(run.per_category["moderate-cat"].total, 2);
    }

    #[test]
    fn tier_mismatch_is_invariant_error() {
        let overall = aggregate(&run());
        let mut per_tier = aggregate_run(&run()).unwrap().per_tier;
        per_tier.get_mut(&Tier::Rare).unwrap().fn_ += 1;
        let err = check_tier_sums(&overall, &per_tier).unwrap_err();
        assert!(matches!(err, ClauseBenchError::Invariant(msg) if msg.contains("fn")));
    }

    #[test]
    fn accumulator_rejects_duplicates_and_reports_missing() {
        let mut acc = MetricsAccumulator::new();
        for e in run().into_iter().rev().take(4) {
            acc.push(e).unwrap();
        }
        assert!(acc.push(eval("6", Tier::Rare, Classification::Tp)).is_err());
        assert_eq!(acc.len(), 4);

        let ids: Vec<String> = (1..=6).map(|i| i.to_string()).collect();
        let done = acc.finish(&ids).unwrap();
        assert!(!done.is_complete());
        assert_eq!(done.missing, vec!["1", "2"]);
        let order: Vec<&str> = done.evaluations.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["3", "4", "5", "6"]);
        assert_eq!(done.metrics.metrics.total, 4);
    }

    #[test]
    fn confidence_intervals_bracket_point_estimate() {
        let evals: Vec<SampleEvaluation> = run()
            .into_iter()
            .cycle()
            .take(60)
            .enumerate()
            .map(|(i, mut e)| {
                e.id = i.to_string();
                e
            })
            .collect();
        let run = aggregate_run(&evals).unwrap();
        let f2 = run.metrics.f2;
        let run = with_confidence_intervals(run, &evals, 200, 42).unwrap();
        let (lo, hi) = run.f2_ci.unwrap();
        assert!(lo <= f2 && f2 <= hi);
        assert!(run.f1_ci.is_some());
    }

    #[test]
    fn scores_ignore_sample_order() {
        let forward = aggregate(&run());
        let mut reversed = run();
        reversed.reverse();
        reversed.swap(0, 3);
        let shuffled = aggregate(&reversed);
        assert_eq!(forward, shuffled);
    }
}
