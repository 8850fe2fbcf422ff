use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabled::{Table, Tabled};

/// Difficulty stratum of a clause category, assigned from prior benchmark F1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
	Common,
	Moderate,
	Rare,
}

impl Tier {
	pub const ALL: [Tier; 3] = [Tier::Common, Tier::Moderate, Tier::Rare];

	pub fn as_str(&self) -> &'static str {
		match self {
			Tier::Common => "common",
			Tier::Moderate => "moderate",
			Tier::Rare => "rare",
		}
	}
}

impl fmt::Display for Tier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Tier {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"common" => Ok(Tier::Common),
			"moderate" => Ok(Tier::Moderate),
			"rare" => Ok(Tier::Rare),
			other => Err(format!("unknown tier '{other}'")),
		}
	}
}

/// Outcome of one sample against its reference spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
	Tp,
	Fp,
	Fn,
	Tn,
}

impl Classification {
	/// TP and TN are the "correct" outcomes used for paired binary tests.
	pub fn is_correct(&self) -> bool {
		matches!(self, Classification::Tp | Classification::Tn)
	}

	/// True when the sample had non-empty ground truth.
	pub fn is_positive(&self) -> bool {
		matches!(self, Classification::Tp | Classification::Fn)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Classification::Tp => "TP",
			Classification::Fp => "FP",
			Classification::Fn => "FN",
			Classification::Tn => "TN",
		}
	}
}

impl fmt::Display for Classification {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Final judgement for one sample in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEvaluation {
	pub id: String,
	pub category: String,
	pub tier: Tier,
	pub classification: Classification,
	pub jaccard: f64,
	pub grounding_rate: f64,
	/// FN produced by an explicit "no related clause" answer.
	#[serde(default)]
	pub lazy: bool,
	/// The workflow ended in FAILED; kept for audit.
	#[serde(default)]
	pub failed: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parse_error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failure: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub confidence: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub specialist: Option<String>,
}

/// Counts and rates for any slice of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
	pub total: usize,
	pub tp: usize,
	pub fp: usize,
	#[serde(rename = "fn")]
	pub fn_: usize,
	pub tn: usize,
	pub precision: f64,
	pub recall: f64,
	pub f1: f64,
	pub f2: f64,
	pub avg_jaccard: f64,
	pub avg_grounding_rate: f64,
	pub hallucination_rate: f64,
	pub laziness_events: usize,
	pub laziness_rate: f64,
	#[serde(default)]
	pub failed: usize,
	#[serde(default)]
	pub parse_errors: usize,
}

impl Metrics {
	/// Samples whose ground truth was non-empty.
	pub fn positives(&self) -> usize {
		self.tp + self.fn_
	}
}

/// Aggregate for a whole run: overall, per tier and per category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
	pub metrics: Metrics,
	pub per_tier: BTreeMap<Tier, Metrics>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub per_category: BTreeMap<String, Metrics>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub f1_ci: Option<(f64, f64)>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub f2_ci: Option<(f64, f64)>,
}

/// Token usage for a single completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
	pub input_tokens: u32,
	pub output_tokens: u32,
	pub total_tokens: u32,
}

impl TokenUsage {
	pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
		Self {
			input_tokens,
			output_tokens,
			total_tokens: input_tokens.saturating_add(output_tokens),
		}
	}
}

/// Record of one completion call made while extracting a sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub sample_id: Option<String>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub specialist: Option<String>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,

	/// Zero-based attempt number within the sample's retry loop.
	pub attempt: u32,

	pub start: SystemTime,
	pub end: SystemTime,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<u64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<TokenUsage>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Trace {
	pub fn start_now() -> TraceBuilder {
		TraceBuilder {
			start: SystemTime::now(),
			sample_id: None,
			specialist: None,
			model: None,
			attempt: 0,
		}
	}
}

pub struct TraceBuilder {
	start: SystemTime,
	sample_id: Option<String>,
	specialist: Option<String>,
	model: Option<String>,
	attempt: u32,
}

impl TraceBuilder {
	pub fn sample(mut self, id: impl Into<String>) -> Self {
		self.sample_id = Some(id.into());
		self
	}

	pub fn specialist(mut self, specialist: impl Into<String>) -> Self {
		self.specialist = Some(specialist.into());
		self
	}

	pub fn model(mut self, model: impl Into<String>) -> Self {
		self.model = Some(model.into());
		self
	}

	pub fn attempt(mut self, attempt: u32) -> Self {
		self.attempt = attempt;
		self
	}

	pub fn finish(self, usage: Option<TokenUsage>) -> Trace {
		self.build(usage, None)
	}

	pub fn finish_with_error(self, error: impl Into<String>) -> Trace {
		self.build(None, Some(error.into()))
	}

	fn build(self, usage: Option<TokenUsage>, error: Option<String>) -> Trace {
		let end = SystemTime::now();
		let duration_ms = end
			.duration_since(self.start)
			.ok()
			.map(|d| d.as_millis() as u64);

		Trace {
			sample_id: self.sample_id,
			specialist: self.specialist,
			model: self.model,
			attempt: self.attempt,
			start: self.start,
			end,
			duration_ms,
			usage,
			error,
		}
	}
}

/// Run-level roll-up of completion calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
	pub calls: usize,
	pub failed_calls: usize,
	pub retries: usize,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub mean_latency_ms: f64,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub calls_per_specialist: BTreeMap<String, usize>,
}

impl Diagnostics {
	pub fn from_traces(traces: &[Trace]) -> Self {
		let mut diag = Diagnostics::default();
		let mut latency_sum = 0u64;
		let mut latency_count = 0usize;

		for t in traces {
			diag.calls += 1;
			if t.error.is_some() {
				diag.failed_calls += 1;
			}
			if t.attempt > 0 {
				diag.retries += 1;
			}
			if let Some(u) = &t.usage {
				diag.input_tokens += u.input_tokens as u64;
				diag.output_tokens += u.output_tokens as u64;
			}
			if let Some(ms) = t.duration_ms {
				latency_sum += ms;
				latency_count += 1;
			}
			if let Some(s) = &t.specialist {
				*diag.calls_per_specialist.entry(s.clone()).or_insert(0) += 1;
			}
		}

		diag.mean_latency_ms = if latency_count == 0 {
			0.0
		} else {
			latency_sum as f64 / latency_count as f64
		};
		diag
	}
}

/// The persisted run document: written once at completion, read by the comparator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
	pub name: String,
	pub created_at: DateTime<Utc>,
	/// False when the run was interrupted before every sample was evaluated.
	pub complete: bool,
	#[serde(default)]
	pub config: Value,
	#[serde(flatten)]
	pub metrics: RunMetrics,
	pub samples: Vec<SampleEvaluation>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub diagnostics: Option<Diagnostics>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub architecture: Option<Value>,
}

#[derive(Debug, Clone, Tabled)]
struct MetricsRow {
	scope: String,
	n: usize,
	tp: usize,
	fp: usize,
	#[tabled(rename = "fn")]
	fn_: usize,
	tn: usize,
	precision: String,
	recall: String,
	f1: String,
	f2: String,
	jaccard: String,
	laziness: String,
}

impl MetricsRow {
	fn new(scope: impl Into<String>, m: &Metrics) -> Self {
		Self {
			scope: scope.into(),
			n: m.total,
			tp: m.tp,
			fp: m.fp,
			fn_: m.fn_,
			tn: m.tn,
			precision: format!("{:.3}", m.precision),
			recall: format!("{:.3}", m.recall),
			f1: format!("{:.3}", m.f1),
			f2: format!("{:.3}", m.f2),
			jaccard: format!("{:.3}", m.avg_jaccard),
			laziness: format!("{:.3}", m.laziness_rate),
		}
	}
}

#[derive(Debug, Clone, Tabled)]
struct AuditRow {
	id: String,
	category: String,
	classification: String,
	issue: String,
}

impl RunSummary {
	pub fn sample_ids(&self) -> impl Iterator<Item = &str> {
		self.samples.iter().map(|s| s.id.as_str())
	}

	pub fn summary_table(&self) -> String {
		let mut rows = vec![MetricsRow::new("overall", &self.metrics.metrics)];
		for (tier, m) in &self.metrics.per_tier {
			rows.push(MetricsRow::new(tier.as_str(), m));
		}
		let table = Table::new(rows).to_string();

		let m = &self.metrics.metrics;
		let mut summary_text = format!(
			"Run: {}  Samples: {}  F1: {:.3}  F2: {:.3}  Grounding: {:.1}%  Failed: {}  Parse errors: {}",
			self.name,
			m.total,
			m.f1,
			m.f2,
			m.avg_grounding_rate * 100.0,
			m.failed,
			m.parse_errors
		);
		if let Some((lo, hi)) = self.metrics.f2_ci {
			summary_text.push_str(&format!("  F2 95% CI: {:.3}-{:.3}", lo, hi));
		}
		if !self.complete {
			summary_text.push_str("  [INCOMPLETE]");
		}

		format!("{}\n\n{}\n", table, summary_text)
	}

	/// Samples flagged for audit: failed workflows and parse errors.
	pub fn audit_table(&self) -> Option<String> {
		let rows: Vec<AuditRow> = self
			.samples
			.iter()
			.filter_map(|s| {
				let issue = s
					.failure
					.as_deref()
					.or(s.parse_error.as_deref())
					.or(if s.failed { Some("failed") } else { None })?;
				Some(AuditRow {
					id: s.id.clone(),
					category: s.category.clone(),
					classification: s.classification.to_string(),
					issue: truncate(issue.to_string(), 64),
				})
			})
			.collect();

		if rows.is_empty() {
			None
		} else {
			Some(Table::new(rows).to_string())
		}
	}
}

fn truncate(s: String, max_len: usize) -> String {
	if s.chars().count() <= max_len {
		return s;
	}
	let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
	truncated.push('…');
	truncated
}
