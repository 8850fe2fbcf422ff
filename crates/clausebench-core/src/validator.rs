//! Turns raw agent output into an audited extraction.
//!
//! The response must carry an explicit terminator line separating free-form
//! reasoning from the answer section. Without it the response is invalid and
//! yields zero spans; the reasoning text is never reinterpreted as clauses.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::ClauseBenchError;
use crate::types::{ExtractionResult, ValidationVerdict};

pub const DEFAULT_TERMINATOR: &str = "FINAL ANSWER:";

/// Canonical negative response the prompts ask for.
pub const NO_RELATED_CLAUSE: &str = "No related clause";

const NEGATIVE_RESPONSES: &[&str] = &[
    "no related clause",
    "no relevant clause",
    "none found",
    "not found",
    "n/a",
];

/// Reported confidence assumed when the answer does not state one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*•]\s+(.*)$").expect("static regex"));
static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[*_\s]*(confidence|indicators)[*_\s]*:[*_\s]*(.*?)[*_\s]*$")
        .expect("static regex")
});
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(%)?").expect("static regex"));

/// Collapse whitespace runs to a single space and trim.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A span is grounded iff its whitespace-normalized text is a literal substring
/// of the whitespace-normalized source. Case and punctuation are significant.
pub fn check_grounding(span: &str, source: &str) -> bool {
    grounded_in(&normalize_whitespace(span), &normalize_whitespace(source))
}

fn grounded_in(normalized_span: &str, normalized_source: &str) -> bool {
    !normalized_span.is_empty() && normalized_source.contains(normalized_span)
}

pub fn is_negative_response(text: &str) -> bool {
    let normalized = normalize_whitespace(text).to_lowercase();
    let stripped = normalized
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`')
        .trim_end_matches('.');
    NEGATIVE_RESPONSES.contains(&stripped)
}

/// Multiplier applied to reported confidence; non-increasing in the ungrounded fraction.
pub fn confidence_penalty(ungrounded_fraction: f64) -> f64 {
    (1.0 - ungrounded_fraction).clamp(0.0, 1.0)
}

#[derive(Deserialize)]
struct JsonAnswer {
    #[serde(default, alias = "extracted_clauses", alias = "clauses")]
    spans: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default, alias = "category_indicators_found")]
    indicators: Vec<String>,
}

/// Result of validating one response against its source document.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditedExtraction {
    /// Parsed answer; `spans` holds only well-formed spans (the predicted set P).
    pub result: ExtractionResult,
    /// One verdict per candidate span, including dropped malformed ones.
    pub verdicts: Vec<ValidationVerdict>,
    pub adjusted_confidence: f64,
    pub parse_error: Option<String>,
}

impl AuditedExtraction {
    pub fn predicted(&self) -> &[String] {
        &self.result.spans
    }

    /// Fraction of predicted spans that are grounded; 1.0 when nothing was predicted.
    pub fn grounding_rate(&self) -> f64 {
        let predicted: Vec<&ValidationVerdict> =
            self.verdicts.iter().filter(|v| v.well_formed).collect();
        if predicted.is_empty() {
            return 1.0;
        }
        predicted.iter().filter(|v| v.grounded).count() as f64 / predicted.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    terminator: String,
    terminator_lower: String,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATOR)
    }
}

impl Validator {
    pub fn new(terminator: impl Into<String>) -> Self {
        let terminator: String = terminator.into();
        let terminator_lower = terminator.to_ascii_lowercase();
        Self {
            terminator,
            terminator_lower,
        }
    }

    pub fn terminator(&self) -> &str {
        &self.terminator
    }

    /// Split reasoning from the answer section and parse the answer.
    /// The last occurrence of the terminator (ASCII case-insensitive) wins.
    pub fn parse(&self, raw: &str) -> Result<ExtractionResult, ClauseBenchError> {
        let lowered = raw.to_ascii_lowercase();
        let at = lowered.rfind(&self.terminator_lower).ok_or_else(|| {
            ClauseBenchError::Parse(format!("missing terminator marker '{}'", self.terminator))
        })?;

        let reasoning = raw[..at].trim().to_string();
        let answer = strip_code_fence(raw[at + self.terminator.len()..].trim());

        let mut result = if answer.starts_with('{') {
            let parsed: JsonAnswer = serde_json::from_str(answer)
                .map_err(|e| ClauseBenchError::Parse(format!("malformed answer JSON: {e}")))?;
            let mut reasoning = reasoning;
            if let Some(extra) = parsed.reasoning.filter(|r| !r.trim().is_empty()) {
                if !reasoning.is_empty() {
                    reasoning.push('\n');
                }
                reasoning.push_str(extra.trim());
            }
            ExtractionResult {
                spans: parsed.spans,
                reasoning,
                confidence: parsed.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                indicators: parsed.indicators,
                negative_response: false,
            }
        } else {
            parse_lines(answer, reasoning)
        };

        result.confidence = result.confidence.clamp(0.0, 1.0);
        if !result.spans.is_empty() && result.spans.iter().all(|s| is_negative_response(s)) {
            result.spans.clear();
            result.negative_response = true;
        }
        Ok(result)
    }

    fn well_formed(&self, normalized_span: &str) -> bool {
        !normalized_span.is_empty()
            && !is_negative_response(normalized_span)
            && !normalized_span
                .to_ascii_lowercase()
                .contains(&self.terminator_lower)
    }

    /// Parse, check each span, and adjust confidence. A parse failure yields an
    /// empty extraction carrying the error, never a fallback to the raw text.
    pub fn validate(&self, raw: &str, source: &str) -> AuditedExtraction {
        let parsed = match self.parse(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                return AuditedExtraction {
                    result: ExtractionResult {
                        reasoning: raw.trim().to_string(),
                        ..Default::default()
                    },
                    verdicts: Vec::new(),
                    adjusted_confidence: 0.0,
                    parse_error: Some(err.to_string()),
                }
            }
        };

        let normalized_source = normalize_whitespace(source);
        let verdicts: Vec<ValidationVerdict> = parsed
            .spans
            .iter()
            .map(|span| {
                let normalized = normalize_whitespace(span);
                ValidationVerdict {
                    span: span.clone(),
                    grounded: grounded_in(&normalized, &normalized_source),
                    well_formed: self.well_formed(&normalized),
                }
            })
            .collect();

        let kept: Vec<&ValidationVerdict> = verdicts.iter().filter(|v| v.well_formed).collect();
        let ungrounded_fraction = if kept.is_empty() {
            0.0
        } else {
            kept.iter().filter(|v| !v.grounded).count() as f64 / kept.len() as f64
        };
        let adjusted_confidence =
            (parsed.confidence * confidence_penalty(ungrounded_fraction)).clamp(0.0, 1.0);

        let spans = kept.iter().map(|v| v.span.clone()).collect();
        AuditedExtraction {
            result: ExtractionResult { spans, ..parsed },
            verdicts,
            adjusted_confidence,
            parse_error: None,
        }
    }
}

fn strip_code_fence(answer: &str) -> &str {
    let Some(rest) = answer.strip_prefix("```") else {
        return answer;
    };
    // Drop the info string ("json", "text", ...) on the opening fence line.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().trim_end_matches("```").trim()
}

/// Bullets start spans, blank lines end them, other lines continue the current span.
/// Numbered lines are clause text, not bullets, and keep their numbers.
fn parse_lines(answer: &str, reasoning: String) -> ExtractionResult {
    let mut result = ExtractionResult {
        reasoning,
        confidence: DEFAULT_CONFIDENCE,
        ..Default::default()
    };
    let mut current: Option<String> = None;

    let flush = |current: &mut Option<String>, spans: &mut Vec<String>| {
        if let Some(span) = current.take() {
            let span = strip_quotes(span.trim());
            if !span.is_empty() {
                spans.push(span.to_string());
            }
        }
    };

    for line in answer.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut current, &mut result.spans);
            continue;
        }

        if let Some(caps) = LABEL.captures(line) {
            flush(&mut current, &mut result.spans);
            let value = caps[2].trim();
            if caps[1].eq_ignore_ascii_case("confidence") {
                if let Some(c) = parse_confidence(value) {
                    result.confidence = c;
                }
            } else {
                result.indicators = value
                    .split([',', ';'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            continue;
        }

        if let Some(caps) = BULLET.captures(line) {
            flush(&mut current, &mut result.spans);
            current = Some(caps[1].to_string());
        } else if let Some(span) = current.as_mut() {
            span.push(' ');
            span.push_str(line);
        } else {
            current = Some(line.to_string());
        }
    }
    flush(&mut current, &mut result.spans);

    result
}

fn parse_confidence(value: &str) -> Option<f64> {
    let caps = NUMBER.captures(value)?;
    let n: f64 = caps[1].parse().ok()?;
    let n = if caps.get(2).is_some() || n > 1.0 { n / 100.0 } else { n };
    Some(n.clamp(0.0, 1.0))
}

fn strip_quotes(s: &str) -> &str {
    const PAIRS: &[(char, char)] = &[('"', '"'), ('“', '”'), ('\'', '\'')];
    for (open, close) in PAIRS {
        if let Some(inner) = s.strip_prefix(*open).and_then(|r| r.strip_suffix(*close)) {
            return inner.trim();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "1. Term. This Agreement commences on the Effective Date.\n\n\
        12. Governing Law.   This Agreement shall be governed by the laws of the\n State of Delaware.";

    #[test]
    fn grounding_normalizes_whitespace_only() {
        assert!(check_grounding(
            "shall be governed by the laws of the State of Delaware.",
            CONTRACT
        ));
        assert!(check_grounding("12.  Governing\tLaw.", CONTRACT));
        assert!(!check_grounding("shall be governed by the laws of the state of delaware.", CONTRACT));
        assert!(!check_grounding("   ", CONTRACT));
    }

    #[test]
    fn missing_terminator_fails_closed() {
        let raw = "Step 1: the governing law section is 12.\n\
                   Step 2: This Agreement shall be governed by the laws of the State of Delaware.";
        let audited = Validator::default().validate(raw, CONTRACT);
        assert!(audited.predicted().is_empty());
        assert!(audited.verdicts.is_empty());
        assert!(audited.parse_error.as_deref().unwrap().contains("terminator"));
    }

    #[test]
    fn bullets_and_metadata_lines() {
        let raw = "Looking at section 12 it is clearly governing law.\n\
                   final answer:\n\
                   - \"This Agreement shall be governed by the laws of the\n\
                   State of Delaware.\"\n\
                   - This Agreement commences on the Effective Date.\n\
                   Confidence: 80%\n\
                   Indicators: governed by, laws of the State";
        let parsed = Validator::default().parse(raw).unwrap();
        assert_eq!(
            parsed.spans,
            vec![
                "This Agreement shall be governed by the laws of the State of Delaware.",
                "This Agreement commences on the Effective Date.",
            ]
        );
        assert!((parsed.confidence - 0.8).abs() < 1e-9);
        assert_eq!(parsed.indicators, vec!["governed by", "laws of the State"]);
        assert!(parsed.reasoning.starts_with("Looking at section 12"));
    }

    #[test]
    fn numbered_lines_stay_inside_the_clause() {
        let raw = "FINAL ANSWER:\nThe Licensee shall:\n1. pay the fees when due;\n2. keep accurate records.";
        let parsed = Validator::default().parse(raw).unwrap();
        assert_eq!(
            parsed.spans,
            vec!["The Licensee shall: 1. pay the fees when due; 2. keep accurate records."]
        );

        let raw = "FINAL ANSWER:\n12. Governing Law. This Agreement shall be governed by the laws of the\nState of Delaware.";
        let audited = Validator::default().validate(raw, CONTRACT);
        assert_eq!(
            audited.predicted(),
            ["12. Governing Law. This Agreement shall be governed by the laws of the State of Delaware."]
        );
        assert_eq!(audited.grounding_rate(), 1.0);
    }

    #[test]
    fn last_terminator_wins() {
        let raw = "I will give the FINAL ANSWER: below once done.\nFINAL ANSWER:\n- Delaware";
        let parsed = Validator::default().parse(raw).unwrap();
        assert_eq!(parsed.spans, vec!["Delaware"]);
        assert!(parsed.reasoning.contains("below once done"));
    }

    #[test]
    fn json_answer_section() {
        let raw = "reasoning here\nFINAL ANSWER:\n```json\n{\"extracted_clauses\": [\"State of Delaware.\"], \
                   \"confidence\": 0.9, \"category_indicators_found\": [\"governed\"]}\n```";
        let parsed = Validator::default().parse(raw).unwrap();
        assert_eq!(parsed.spans, vec!["State of Delaware."]);
        assert_eq!(parsed.indicators, vec!["governed"]);
        assert!((parsed.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let raw = "FINAL ANSWER: {\"spans\": [\"unterminated]";
        let audited = Validator::default().validate(raw, CONTRACT);
        assert!(audited.parse_error.as_deref().unwrap().contains("JSON"));
        assert!(audited.predicted().is_empty());
    }

    #[test]
    fn negative_response_yields_empty_prediction() {
        let parsed = Validator::default()
            .parse("Nothing about escrow.\nFINAL ANSWER:\nNo related clause.")
            .unwrap();
        assert!(parsed.spans.is_empty());
        assert!(parsed.negative_response);
        assert!(is_negative_response("  N/A "));
        assert!(!is_negative_response("No related clause was assigned to the Licensee"));
    }

    #[test]
    fn malformed_spans_are_dropped_from_prediction() {
        let raw = "FINAL ANSWER:\n- State of Delaware.\n- No related clause";
        let audited = Validator::default().validate(raw, CONTRACT);
        assert_eq!(audited.verdicts.len(), 2);
        assert!(!audited.verdicts[1].well_formed);
        assert_eq!(audited.predicted(), ["State of Delaware."]);
        assert_eq!(audited.grounding_rate(), 1.0);
    }

    #[test]
    fn confidence_penalised_by_ungrounded_fraction() {
        let raw = "FINAL ANSWER:\n- State of Delaware.\n- The laws of Narnia apply.\nConfidence: 0.8";
        let audited = Validator::default().validate(raw, CONTRACT);
        assert_eq!(audited.grounding_rate(), 0.5);
        assert!((audited.adjusted_confidence - 0.4).abs() < 1e-9);

        let mut last = f64::INFINITY;
        for i in 0..=10 {
            let p = confidence_penalty(i as f64 / 10.0);
            assert!(p <= last && (0.0..=1.0).contains(&p));
            last = p;
        }
    }

    #[test]
    fn empty_prediction_is_fully_grounded() {
        let audited = Validator::default().validate("FINAL ANSWER:\n", CONTRACT);
        assert!(audited.predicted().is_empty());
        assert!(!audited.result.negative_response);
        assert_eq!(audited.grounding_rate(), 1.0);
        assert!(audited.parse_error.is_none());
    }
}
