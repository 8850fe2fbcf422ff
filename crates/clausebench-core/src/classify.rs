//! Sample-level judgement: TP/FP/FN/TN, span overlap and grounding.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Classification, Sample, SampleEvaluation};
use crate::validator::{normalize_whitespace, AuditedExtraction};

/// Unit over which span overlap is measured. Fixed for a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Token,
    /// Character trigram shingles.
    Character,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::Token => "token",
            Granularity::Character => "character",
        })
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token" => Ok(Granularity::Token),
            "character" | "char" => Ok(Granularity::Character),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

fn normalized_nonempty(spans: &[String]) -> Vec<String> {
    spans
        .iter()
        .map(|s| normalize_whitespace(s))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Label one sample. A hit requires some prediction to fully cover some
/// reference span after whitespace normalization.
pub fn classify(ground_truth: &[String], predicted: &[String]) -> Classification {
    let g = normalized_nonempty(ground_truth);
    let p = normalized_nonempty(predicted);

    match (g.is_empty(), p.is_empty()) {
        (true, true) => Classification::Tn,
        (true, false) => Classification::Fp,
        (false, _) => {
            let covered = p.iter().any(|p| g.iter().any(|g| p.contains(g.as_str())));
            if covered {
                Classification::Tp
            } else {
                Classification::Fn
            }
        }
    }
}

fn units(spans: &[String], granularity: Granularity) -> HashSet<String> {
    let mut out = HashSet::new();
    for span in normalized_nonempty(spans) {
        match granularity {
            Granularity::Token => {
                out.extend(span.split(' ').map(str::to_string));
            }
            Granularity::Character => {
                let chars: Vec<char> = span.chars().collect();
                if chars.len() < 3 {
                    out.insert(span);
                } else {
                    out.extend(chars.windows(3).map(|w| w.iter().collect::<String>()));
                }
            }
        }
    }
    out
}

/// Jaccard of union(P) and union(G). Both empty is a perfect match.
pub fn jaccard(predicted: &[String], ground_truth: &[String], granularity: Granularity) -> f64 {
    let p = units(predicted, granularity);
    let g = units(ground_truth, granularity);
    if p.is_empty() && g.is_empty() {
        return 1.0;
    }
    if p.is_empty() || g.is_empty() {
        return 0.0;
    }
    let intersection = p.intersection(&g).count();
    let union = p.len() + g.len() - intersection;
    intersection as f64 / union as f64
}

/// Judge a validated extraction.
pub fn evaluate_sample(
    sample: &Sample,
    audited: &AuditedExtraction,
    granularity: Granularity,
) -> SampleEvaluation {
    let predicted = audited.predicted();
    let classification = classify(&sample.ground_truth, predicted);
    let lazy = classification == Classification::Fn
        && audited.result.negative_response
        && sample.has_clause();

    SampleEvaluation {
        id: sample.id.clone(),
        category: sample.category.clone(),
        tier: sample.tier,
        classification,
        jaccard: jaccard(predicted, &sample.ground_truth, granularity),
        grounding_rate: audited.grounding_rate(),
        lazy,
        failed: false,
        parse_error: audited.parse_error.clone(),
        failure: None,
        confidence: Some(audited.adjusted_confidence),
        specialist: None,
    }
}

/// Evaluation for a sample whose workflow ended in FAILED: scored as an empty prediction.
pub fn evaluate_failed(sample: &Sample, reason: impl Into<String>) -> SampleEvaluation {
    let classification = classify(&sample.ground_truth, &[]);
    SampleEvaluation {
        id: sample.id.clone(),
        category: sample.category.clone(),
        tier: sample.tier,
        classification,
        jaccard: jaccard(&[], &sample.ground_truth, Granularity::Token),
        grounding_rate: 1.0,
        lazy: false,
        failed: true,
        parse_error: None,
        failure: Some(reason.into()),
        confidence: None,
        specialist: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;
    use crate::validator::Validator;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    const CONTRACT: &str = "Section 9. Governing Law shall be Delaware. All notices in writing.";

    #[test]
    fn full_containment_is_tp() {
        let g = s(&["Governing Law shall be Delaware."]);
        let p = s(&["Section 9. Governing Law  shall be\nDelaware. All notices"]);
        assert_eq!(classify(&g, &p), Classification::Tp);
        // partial coverage does not count
        assert_eq!(
            classify(&g, &s(&["Governing Law shall be"])),
            Classification::Fn
        );
    }

    #[test]
    fn negative_response_without_truth_is_tn() {
        let sample = Sample::new("b", CONTRACT, "Insurance", Tier::Moderate, vec![]);
        let audited = Validator::default().validate("FINAL ANSWER:\nNo related clause.", CONTRACT);
        let eval = evaluate_sample(&sample, &audited, Granularity::Token);
        assert_eq!(eval.classification, Classification::Tn);
        assert!(!eval.lazy);
        assert_eq!(eval.jaccard, 1.0);
    }

    #[test]
    fn unrelated_extraction_without_truth_is_fp() {
        let g: Vec<String> = vec![];
        assert_eq!(
            classify(&g, &s(&["Some unrelated extracted text."])),
            Classification::Fp
        );
    }

    #[test]
    fn missing_terminator_never_scores_tp() {
        let sample = Sample::new(
            "d",
            CONTRACT,
            "Governing Law",
            Tier::Common,
            s(&["Governing Law shall be Delaware."]),
        );
        // The reasoning quotes the clause verbatim but never commits to an answer.
        let raw = "The contract says: Section 9. Governing Law shall be Delaware.";
        let audited = Validator::default().validate(raw, CONTRACT);
        let eval = evaluate_sample(&sample, &audited, Granularity::Token);
        assert_eq!(eval.classification, Classification::Fn);
        assert!(eval.parse_error.is_some());
        assert!(!eval.lazy);
        assert_eq!(eval.jaccard, 0.0);
    }

    #[test]
    fn negative_answer_on_positive_sample_is_lazy() {
        let sample = Sample::new(
            "l",
            CONTRACT,
            "Governing Law",
            Tier::Common,
            s(&["Governing Law shall be Delaware."]),
        );
        let audited = Validator::default().validate("FINAL ANSWER: No related clause", CONTRACT);
        let eval = evaluate_sample(&sample, &audited, Granularity::Token);
        assert_eq!(eval.classification, Classification::Fn);
        assert!(eval.lazy);
    }

    #[test]
    fn jaccard_granularities() {
        let g = s(&["the quick brown fox"]);
        let p = s(&["quick brown  dog"]);
        // {quick, brown} / {the, quick, brown, fox, dog}
        assert!((jaccard(&p, &g, Granularity::Token) - 0.4).abs() < 1e-12);
        assert_eq!(jaccard(&g, &g, Granularity::Character), 1.0);
        let c = jaccard(&p, &g, Granularity::Character);
        assert!(c > 0.0 && c < 1.0);
        assert_eq!(jaccard(&[], &[], Granularity::Token), 1.0);
        assert_eq!(jaccard(&p, &[], Granularity::Token), 0.0);
        assert_eq!(jaccard(&[], &g, Granularity::Character), 0.0);
    }

    #[test]
    fn jaccard_ignores_span_order_and_is_zero_when_disjoint() {
        let g = s(&["governed by Delaware law", "notices in writing"]);
        let p = s(&["notices in writing", "governed by Delaware law"]);
        let q = s(&["laws of Delaware", "written notice"]);
        let q_rev = s(&["written notice", "laws of Delaware"]);
        let disjoint_a = s(&["abc def", "ghi"]);
        let disjoint_b = s(&["xyz uvw", "rst"]);
        for granularity in [Granularity::Token, Granularity::Character] {
            assert_eq!(jaccard(&p, &g, granularity), 1.0);
            assert_eq!(jaccard(&q, &g, granularity), jaccard(&q_rev, &g, granularity));
            assert_eq!(jaccard(&g, &q, granularity), jaccard(&g, &q_rev, granularity));
            assert_eq!(jaccard(&disjoint_a, &disjoint_b, granularity), 0.0);
        }
    }

    #[test]
    fn verbatim_clause_with_numbered_items_is_tp() {
        let contract = "7. Obligations. The Licensee shall:\n1. pay the fees when due;\n2. keep accurate records.";
        let sample = Sample::new(
            "n",
            contract,
            "Audit Rights",
            Tier::Common,
            s(&["The Licensee shall: 1. pay the fees when due; 2. keep accurate records."]),
        );
        let raw = "FINAL ANSWER:\nThe Licensee shall:\n1. pay the fees when due;\n2. keep accurate records.";
        let audited = Validator::default().validate(raw, contract);
        let eval = evaluate_sample(&sample, &audited, Granularity::Token);
        assert_eq!(eval.classification, Classification::Tp);
        assert_eq!(eval.grounding_rate, 1.0);
        assert_eq!(eval.jaccard, 1.0);
    }

    #[test]
    fn failed_samples_score_as_empty_prediction() {
        let pos = Sample::new("p", CONTRACT, "Governing Law", Tier::Common, s(&["Delaware"]));
        let neg = Sample::new("n", CONTRACT, "Insurance", Tier::Moderate, vec![]);
        let a = evaluate_failed(&pos, "permanent provider error");
        let b = evaluate_failed(&neg, "permanent provider error");
        assert_eq!(a.classification, Classification::Fn);
        assert_eq!(b.classification, Classification::Tn);
        assert!(a.failed && b.failed);
        assert_eq!(a.failure.as_deref(), Some("permanent provider error"));
    }

    #[test]
    fn granularity_parses() {
        assert_eq!("Token".parse::<Granularity>().unwrap(), Granularity::Token);
        assert_eq!("character".parse::<Granularity>().unwrap(), Granularity::Character);
        assert!("word".parse::<Granularity>().is_err());
    }
}
