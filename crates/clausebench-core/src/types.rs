pub use clausebench_types::{
	Classification, Diagnostics, Metrics, RunMetrics, RunSummary, SampleEvaluation, Tier,
	TokenUsage, Trace, TraceBuilder,
};

use serde::{Deserialize, Serialize};

/// One labeled dataset item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
	pub id: String,
	pub contract_text: String,
	pub category: String,
	#[serde(default)]
	pub question: String,
	pub tier: Tier,
	/// Reference spans; empty when the contract has no such clause.
	#[serde(default)]
	pub ground_truth: Vec<String>,
	/// Contract title, when the dataset provides one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
}

impl Sample {
	pub fn new(
		id: impl Into<String>,
		contract_text: impl Into<String>,
		category: impl Into<String>,
		tier: Tier,
		ground_truth: Vec<String>,
	) -> Self {
		let category = category.into();
		let question = format!(
			"Highlight the parts (if any) of this contract related to \"{category}\" that should be reviewed by a lawyer."
		);
		Self {
			id: id.into(),
			contract_text: contract_text.into(),
			category,
			question,
			tier,
			ground_truth,
			title: None,
		}
	}

	pub fn with_question(mut self, question: impl Into<String>) -> Self {
		self.question = question.into();
		self
	}

	pub fn with_title(mut self, title: impl Into<String>) -> Self {
		self.title = Some(title.into());
		self
	}

	pub fn has_clause(&self) -> bool {
		self.ground_truth.iter().any(|g| !g.trim().is_empty())
	}
}

/// One agent's parsed answer for one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
	pub spans: Vec<String>,
	pub reasoning: String,
	pub confidence: f64,
	pub indicators: Vec<String>,
	/// The agent answered with the canonical "no related clause" token.
	pub negative_response: bool,
}

/// Per-span audit derived from the extraction and the source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
	pub span: String,
	pub grounded: bool,
	pub well_formed: bool,
}
