use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::completion::CompletionProvider;
use crate::config::ExperimentConfig;
use crate::datasource::{stratify, DataSource, JsonlDataSource};
use crate::metrics::{with_confidence_intervals, MetricsAccumulator};
use crate::prompts::{PromptRegistry, PromptStore};
use crate::types::{Diagnostics, RunSummary, SampleEvaluation, Trace};
use crate::validator::Validator;
use crate::workflow::Workflow;

/// Durable per-sample progress for resumable runs.
pub trait Checkpoint: Send + Sync {
	/// Register the run; a no-op when it already exists.
	fn begin(&self, run: &str, config: &Value) -> Result<()>;
	/// Samples already evaluated for `run`, with their traces.
	fn completed(&self, run: &str) -> Result<Vec<(SampleEvaluation, Vec<Trace>)>>;
	/// Persist one evaluation. Recording the same sample twice keeps the first.
	fn record(&self, run: &str, evaluation: &SampleEvaluation, traces: &[Trace]) -> Result<()>;
	fn finish(&self, summary: &RunSummary) -> Result<()>;
}

/// In-process checkpoint, handy for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpoint {
	samples: Mutex<BTreeMap<String, Vec<(SampleEvaluation, Vec<Trace>)>>>,
	summaries: Mutex<BTreeMap<String, RunSummary>>,
}

impl MemoryCheckpoint {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn summary(&self, run: &str) -> Option<RunSummary> {
		self.summaries.lock().ok()?.get(run).cloned()
	}
}

impl Checkpoint for MemoryCheckpoint {
	fn begin(&self, run: &str, _config: &Value) -> Result<()> {
		let mut samples = self.samples.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
		samples.entry(run.to_string()).or_default();
		Ok(())
	}

	fn completed(&self, run: &str) -> Result<Vec<(SampleEvaluation, Vec<Trace>)>> {
		let samples = self.samples.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
		Ok(samples.get(run).cloned().unwrap_or_default())
	}

	fn record(&self, run: &str, evaluation: &SampleEvaluation, traces: &[Trace]) -> Result<()> {
		let mut samples = self.samples.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
		let entries = samples.entry(run.to_string()).or_default();
		if !entries.iter().any(|(e, _)| e.id == evaluation.id) {
			entries.push((evaluation.clone(), traces.to_vec()));
		}
		Ok(())
	}

	fn finish(&self, summary: &RunSummary) -> Result<()> {
		let mut summaries = self.summaries.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
		summaries.insert(summary.name.clone(), summary.clone());
		Ok(())
	}
}

#[cfg(feature = "persistence")]
impl Checkpoint for clausebench_store::Store {
	fn begin(&self, run: &str, config: &Value) -> Result<()> {
		self.begin_run(run, config).map(|_| ())
	}

	fn completed(&self, run: &str) -> Result<Vec<(SampleEvaluation, Vec<Trace>)>> {
		self.completed_samples(run)
	}

	fn record(&self, run: &str, evaluation: &SampleEvaluation, traces: &[Trace]) -> Result<()> {
		self.record_sample(run, evaluation, traces).map(|_| ())
	}

	fn finish(&self, summary: &RunSummary) -> Result<()> {
		self.save_summary(summary)
	}
}

pub struct ExperimentBuilder {
	name: Option<String>,
	data_source: Option<Arc<dyn DataSource>>,
	workflow: Option<Workflow>,
	checkpoint: Option<Arc<dyn Checkpoint>>,
	concurrency: usize,
	max_per_tier: Option<usize>,
	config: Value,
	confidence_intervals: Option<(usize, u64)>,
}

impl Default for ExperimentBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ExperimentBuilder {
	pub fn new() -> Self {
		Self {
			name: None,
			data_source: None,
			workflow: None,
			checkpoint: None,
			concurrency: 8,
			max_per_tier: None,
			config: Value::Null,
			confidence_intervals: None,
		}
	}

	/// Wire everything an experiment config describes except the completion provider.
	pub fn from_config(config: &ExperimentConfig, provider: Arc<dyn CompletionProvider>) -> Result<Self> {
		let catalog = Arc::new(config.catalog()?);
		let router = config.router(&catalog)?;

		let mut prompts = PromptRegistry::with_defaults();
		if let Some(dir) = &config.prompts_dir {
			let loaded = prompts.load_dir(dir)?;
			info!(dir = %dir.display(), loaded, "loaded prompt templates");
		}
		for specialist in router.specialists() {
			prompts.get(specialist.as_str())?;
		}

		let workflow = Workflow::new(Arc::new(router), Arc::new(prompts), provider)
			.validator(Validator::new(config.terminator.clone()))
			.sampling(config.sampling_params())
			.retry(config.retry.clone())
			.timeout(config.timeout())
			.granularity(config.granularity);

		let mut builder = Self::new()
			.name(config.name.clone())
			.data_source(Arc::new(JsonlDataSource::with_catalog(&config.data.path, catalog)))
			.workflow(workflow)
			.concurrency(config.concurrency)
			.config(config.to_value())
			.confidence_intervals(config.comparison.bootstrap_resamples, config.comparison.seed);
		if let Some(n) = config.data.max_per_tier {
			builder = builder.max_per_tier(n);
		}
		Ok(builder)
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn data_source(mut self, data_source: Arc<dyn DataSource>) -> Self {
		self.data_source = Some(data_source);
		self
	}

	pub fn workflow(mut self, workflow: Workflow) -> Self {
		self.workflow = Some(workflow);
		self
	}

	pub fn checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
		self.checkpoint = Some(checkpoint);
		self
	}

	pub fn concurrency(mut self, n: usize) -> Self {
		self.concurrency = n.max(1);
		self
	}

	pub fn max_per_tier(mut self, n: usize) -> Self {
		self.max_per_tier = Some(n);
		self
	}

	/// Configuration recorded verbatim in the run summary.
	pub fn config(mut self, config: Value) -> Self {
		self.config = config;
		self
	}

	/// Attach bootstrap F1/F2 intervals to the final metrics.
	pub fn confidence_intervals(mut self, resamples: usize, seed: u64) -> Self {
		self.confidence_intervals = Some((resamples, seed));
		self
	}

	pub fn build(self) -> Result<Experiment> {
		Ok(Experiment {
			name: self.name.ok_or_else(|| anyhow!("name must be set"))?,
			data_source: self.data_source.ok_or_else(|| anyhow!("data_source must be set"))?,
			workflow: self.workflow.ok_or_else(|| anyhow!("workflow must be set"))?,
			checkpoint: self.checkpoint,
			concurrency: self.concurrency,
			max_per_tier: self.max_per_tier,
			config: self.config,
			confidence_intervals: self.confidence_intervals,
		})
	}
}

pub struct Experiment {
	name: String,
	data_source: Arc<dyn DataSource>,
	workflow: Workflow,
	checkpoint: Option<Arc<dyn Checkpoint>>,
	concurrency: usize,
	max_per_tier: Option<usize>,
	config: Value,
	confidence_intervals: Option<(usize, u64)>,
}

impl Experiment {
	pub fn builder() -> ExperimentBuilder {
		ExperimentBuilder::new()
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn run(&self) -> Result<RunSummary> {
		self.run_until(std::future::pending::<()>()).await
	}

	/// Run until every sample is evaluated or `shutdown` resolves. An interrupted
	/// run returns a summary marked incomplete; completed samples stay checkpointed.
	pub async fn run_until<F>(&self, shutdown: F) -> Result<RunSummary>
	where
		F: Future<Output = ()>,
	{
		let mut samples = self.data_source.load().await?;
		if let Some(n) = self.max_per_tier {
			samples = stratify(samples, n);
		}
		self.workflow
			.router()
			.check_categories(samples.iter().map(|s| s.category.as_str()))?;
		let expected: Vec<String> = samples.iter().map(|s| s.id.clone()).collect();

		let mut acc = MetricsAccumulator::new();
		let mut traces: Vec<Trace> = Vec::new();
		if let Some(checkpoint) = &self.checkpoint {
			checkpoint.begin(&self.name, &self.config)?;
			let wanted: HashSet<&str> = expected.iter().map(String::as_str).collect();
			for (evaluation, sample_traces) in checkpoint.completed(&self.name)? {
				if wanted.contains(evaluation.id.as_str()) {
					acc.push(evaluation)?;
					traces.extend(sample_traces);
				}
			}
			if !acc.is_empty() {
				info!(run = %self.name, resumed = acc.len(), "resuming from checkpoint");
			}
		}

		let pending: Vec<_> = samples.into_iter().filter(|s| !acc.contains(&s.id)).collect();
		info!(
			run = %self.name,
			total = expected.len(),
			pending = pending.len(),
			concurrency = self.concurrency,
			"starting run"
		);

		let workflow = &self.workflow;
		let mut results = stream::iter(pending)
			.map(|sample| async move { workflow.run(&sample).await })
			.buffer_unordered(self.concurrency);

		tokio::pin!(shutdown);
		let mut interrupted = false;
		loop {
			tokio::select! {
				biased;
				_ = &mut shutdown => {
					interrupted = true;
					break;
				}
				next = results.next() => match next {
					Some(outcome) => {
						if let Some(checkpoint) = &self.checkpoint {
							checkpoint.record(&self.name, &outcome.evaluation, &outcome.traces)?;
						}
						debug!(
							sample = %outcome.evaluation.id,
							classification = %outcome.evaluation.classification,
							state = %outcome.final_state(),
							"sample evaluated"
						);
						traces.extend(outcome.traces);
						acc.push(outcome.evaluation)?;
					}
					None => break,
				},
			}
		}
		drop(results);

		let done = acc.finish(&expected)?;
		let complete = done.is_complete();
		if interrupted {
			warn!(run = %self.name, missing = done.missing.len(), "run interrupted");
		}

		let mut metrics = done.metrics;
		if let Some((resamples, seed)) = self.confidence_intervals {
			metrics = with_confidence_intervals(metrics, &done.evaluations, resamples, seed)?;
		}

		let summary = RunSummary {
			name: self.name.clone(),
			created_at: Utc::now(),
			complete,
			config: self.config.clone(),
			metrics,
			samples: done.evaluations,
			diagnostics: Some(Diagnostics::from_traces(&traces)),
			architecture: Some(self.workflow.router().describe()),
		};

		if complete {
			if let Some(checkpoint) = &self.checkpoint {
				checkpoint.finish(&summary)?;
			}
		}
		info!(
			run = %self.name,
			complete,
			f2 = summary.metrics.metrics.f2,
			failed = summary.metrics.metrics.failed,
			"run finished"
		);
		Ok(summary)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;
	use crate::catalog::Catalog;
	use crate::completion::{from_async_fn, CompletionResponse};
	use crate::datasource::VecDataSource;
	use crate::router::Router;
	use crate::types::{Classification, Sample, Tier};
	use crate::workflow::RetryPolicy;

	const CONTRACT: &str = "1. Parties. ACME Corp and Beta LLC. 9. Governing Law. This Agreement is governed by the laws of Delaware.";

	fn samples() -> Vec<Sample> {
		vec![
			Sample::new("s1", CONTRACT, "Governing Law", Tier::Common, vec!["governed by the laws of Delaware".into()]),
			Sample::new("s2", CONTRACT, "Parties", Tier::Common, vec!["ACME Corp and Beta LLC".into()]),
			Sample::new("s3", CONTRACT, "Insurance", Tier::Moderate, vec![]),
			Sample::new("s4", CONTRACT, "Source Code Escrow", Tier::Rare, vec![]),
		]
	}

	/// Answers with the governing-law clause for every category.
	fn experiment(calls: Arc<AtomicUsize>, delay: Duration) -> ExperimentBuilder {
		let provider = from_async_fn(move |_req| {
			calls.fetch_add(1, Ordering::SeqCst);
			async move {
				tokio::time::sleep(delay).await;
				Ok(CompletionResponse::text(
					"FINAL ANSWER:\n- This Agreement is governed by the laws of Delaware.\nConfidence: 0.7",
				))
			}
		});
		let catalog = Catalog::cuad();
		let workflow = Workflow::new(
			Arc::new(Router::from_catalog(&catalog).unwrap()),
			Arc::new(PromptRegistry::with_defaults()),
			provider,
		)
		.retry(RetryPolicy::no_retry());

		Experiment::builder()
			.name("multi_agent")
			.data_source(Arc::new(VecDataSource::new(samples())))
			.workflow(workflow)
			.concurrency(2)
	}

	#[tokio::test]
	async fn run_produces_ordered_summary() {
		let calls = Arc::new(AtomicUsize::new(0));
		let summary = experiment(calls.clone(), Duration::ZERO).build().unwrap().run().await.unwrap();

		assert!(summary.complete);
		assert_eq!(calls.load(Ordering::SeqCst), 4);
		assert_eq!(summary.sample_ids().collect::<Vec<_>>(), vec!["s1", "s2", "s3", "s4"]);
		let classes: Vec<Classification> = summary.samples.iter().map(|s| s.classification).collect();
		assert_eq!(
			classes,
			vec![Classification::Tp, Classification::Fn, Classification::Fp, Classification::Fp]
		);
		assert_eq!(summary.metrics.metrics.total, 4);
		assert_eq!(summary.diagnostics.as_ref().unwrap().calls, 4);
		assert_eq!(summary.architecture.as_ref().unwrap()["specialists"]["temporal_renewal"], 11);
	}

	#[tokio::test]
	async fn resume_skips_checkpointed_samples() {
		let checkpoint = Arc::new(MemoryCheckpoint::new());

		let first_calls = Arc::new(AtomicUsize::new(0));
		let first = experiment(first_calls.clone(), Duration::ZERO)
			.checkpoint(checkpoint.clone())
			.build()
			.unwrap()
			.run()
			.await
			.unwrap();
		assert!(first.complete);
		assert!(checkpoint.summary("multi_agent").is_some());

		let second_calls = Arc::new(AtomicUsize::new(0));
		let second = experiment(second_calls.clone(), Duration::ZERO)
			.checkpoint(checkpoint.clone())
			.build()
			.unwrap()
			.run()
			.await
			.unwrap();
		assert_eq!(second_calls.load(Ordering::SeqCst), 0);
		assert!(second.complete);
		assert_eq!(second.metrics.metrics, first.metrics.metrics);
		assert_eq!(second.diagnostics.unwrap().calls, 4);
	}

	#[tokio::test]
	async fn shutdown_marks_summary_incomplete() {
		let calls = Arc::new(AtomicUsize::new(0));
		let checkpoint = Arc::new(MemoryCheckpoint::new());
		let exp = experiment(calls, Duration::from_secs(30))
			.checkpoint(checkpoint.clone())
			.build()
			.unwrap();

		let summary = exp
			.run_until(tokio::time::sleep(Duration::from_millis(20)))
			.await
			.unwrap();
		assert!(!summary.complete);
		assert!(summary.samples.is_empty());
		assert!(checkpoint.summary("multi_agent").is_none());
	}

	#[tokio::test]
	async fn unroutable_dataset_fails_before_any_call() {
		let calls = Arc::new(AtomicUsize::new(0));
		let mut data = samples();
		data.push(Sample::new("s5", CONTRACT, "Force Majeure", Tier::Rare, vec![]));
		let err = experiment(calls.clone(), Duration::ZERO)
			.data_source(Arc::new(VecDataSource::new(data)))
			.build()
			.unwrap()
			.run()
			.await
			.unwrap_err();
		assert!(err.to_string().contains("Force Majeure"));
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn build_requires_parts() {
		assert!(Experiment::builder().name("x").build().is_err());
	}
}
