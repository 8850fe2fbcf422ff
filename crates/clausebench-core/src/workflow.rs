//! Per-sample extraction workflow: ROUTE → EXTRACT(n) → VALIDATE → FINALIZE | FAILED.
//!
//! State changes go through [`transition`], a pure function of the current
//! state, the outcome of the step just executed and the retry policy.
//! [`Workflow::run`] only performs the side effects of each state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::{evaluate_failed, evaluate_sample, Granularity};
use crate::completion::{CompletionProvider, CompletionRequest, SamplingParams};
use crate::diagnostics::{report_trace, scope_traces};
use crate::error::{ClauseBenchError, ProviderError, Result};
use crate::prompts::PromptStore;
use crate::router::{Router, SpecialistId};
use crate::types::{Sample, SampleEvaluation, Trace};
use crate::validator::{AuditedExtraction, Validator};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Scale each delay by a random factor in [0.8, 1.2).
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retrying after failed attempt `attempt`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let delay_ms = (base * self.multiplier.powi(attempt as i32)).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(Duration::from_millis(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Route,
    Extract { attempt: u32 },
    Validate,
    Finalize,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Finalize | WorkflowState::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Route => f.write_str("ROUTE"),
            WorkflowState::Extract { attempt } => write!(f, "EXTRACT({attempt})"),
            WorkflowState::Validate => f.write_str("VALIDATE"),
            WorkflowState::Finalize => f.write_str("FINALIZE"),
            WorkflowState::Failed => f.write_str("FAILED"),
        }
    }
}

/// What happened while executing one state.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Routed,
    Unroutable(String),
    Extracted,
    TransientError(String),
    PermanentError(String),
    /// Validation always completes; a parse error is carried on the extraction.
    Validated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub next: WorkflowState,
    /// Backoff to wait before entering `next`.
    pub delay: Option<Duration>,
}

impl Step {
    fn to(next: WorkflowState) -> Self {
        Self { next, delay: None }
    }
}

pub fn transition(state: WorkflowState, outcome: &StepOutcome, policy: &RetryPolicy) -> Result<Step> {
    use StepOutcome as O;
    use WorkflowState as S;

    let step = match (state, outcome) {
        (S::Route, O::Routed) => Step::to(S::Extract { attempt: 0 }),
        (S::Route, O::Unroutable(_)) => Step::to(S::Failed),
        (S::Extract { .. }, O::Extracted) => Step::to(S::Validate),
        (S::Extract { attempt }, O::TransientError(_)) if attempt < policy.max_retries => Step {
            next: S::Extract { attempt: attempt + 1 },
            delay: Some(policy.delay_for(attempt)),
        },
        (S::Extract { .. }, O::TransientError(_)) => Step::to(S::Failed),
        (S::Extract { .. }, O::PermanentError(_)) => Step::to(S::Failed),
        (S::Validate, O::Validated) => Step::to(S::Finalize),
        (state, outcome) => {
            return Err(ClauseBenchError::Invariant(format!(
                "no transition from {state} on {outcome:?}"
            )))
        }
    };
    Ok(step)
}

/// Everything one workflow run produced for a sample.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub evaluation: SampleEvaluation,
    pub visited: Vec<WorkflowState>,
    pub audited: Option<AuditedExtraction>,
    pub traces: Vec<Trace>,
}

impl WorkflowOutcome {
    pub fn final_state(&self) -> WorkflowState {
        self.visited.last().copied().unwrap_or(WorkflowState::Route)
    }
}

/// Immutable per-run wiring shared by all sample workflows.
#[derive(Clone)]
pub struct Workflow {
    router: Arc<Router>,
    prompts: Arc<dyn PromptStore>,
    provider: Arc<dyn CompletionProvider>,
    validator: Validator,
    sampling: SamplingParams,
    retry: RetryPolicy,
    timeout: Duration,
    granularity: Granularity,
}

impl Workflow {
    pub fn new(
        router: Arc<Router>,
        prompts: Arc<dyn PromptStore>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            router,
            prompts,
            provider,
            validator: Validator::default(),
            sampling: SamplingParams::default(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
            granularity: Granularity::default(),
        }
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Drive one sample to a terminal state. Never fails: every sample gets an evaluation.
    pub async fn run(&self, sample: &Sample) -> WorkflowOutcome {
        let (mut outcome, traces) = scope_traces(self.drive(sample)).await;
        outcome.traces = traces;
        outcome
    }

    async fn drive(&self, sample: &Sample) -> WorkflowOutcome {
        let mut state = WorkflowState::Route;
        let mut visited = vec![state];
        let mut specialist: Option<SpecialistId> = None;
        let mut request: Option<CompletionRequest> = None;
        let mut raw: Option<String> = None;
        let mut audited: Option<AuditedExtraction> = None;
        let mut failure: Option<String> = None;

        while !state.is_terminal() {
            let outcome = match state {
                WorkflowState::Route => match self.prepare(sample) {
                    Ok((id, req)) => {
                        specialist = Some(id);
                        request = Some(req);
                        StepOutcome::Routed
                    }
                    Err(err) => StepOutcome::Unroutable(err.to_string()),
                },
                WorkflowState::Extract { attempt } => {
                    match (&request, &specialist) {
                        (Some(req), Some(id)) => match self.call(sample, id, req, attempt).await {
                            Ok(text) => {
                                raw = Some(text);
                                StepOutcome::Extracted
                            }
                            Err(err) if err.is_transient() => StepOutcome::TransientError(err.to_string()),
                            Err(err) => StepOutcome::PermanentError(err.to_string()),
                        },
                        _ => StepOutcome::PermanentError("extraction entered without a routed request".into()),
                    }
                }
                WorkflowState::Validate => {
                    let text = raw.as_deref().unwrap_or_default();
                    audited = Some(self.validator.validate(text, &sample.contract_text));
                    StepOutcome::Validated
                }
                WorkflowState::Finalize | WorkflowState::Failed => break,
            };

            if let StepOutcome::Unroutable(reason)
            | StepOutcome::TransientError(reason)
            | StepOutcome::PermanentError(reason) = &outcome
            {
                failure = Some(reason.clone());
            }

            let step = match transition(state, &outcome, &self.retry) {
                Ok(step) => step,
                Err(err) => {
                    failure = Some(err.to_string());
                    Step::to(WorkflowState::Failed)
                }
            };
            if let Some(delay) = step.delay {
                let delay = self.retry.jittered(delay);
                debug!(sample = %sample.id, next = %step.next, ?delay, "retrying extraction");
                tokio::time::sleep(delay).await;
            }
            state = step.next;
            visited.push(state);
        }

        let mut evaluation = match (&state, &audited) {
            (WorkflowState::Finalize, Some(audited)) => evaluate_sample(sample, audited, self.granularity),
            _ => {
                let reason = failure.unwrap_or_else(|| "workflow failed".to_string());
                warn!(sample = %sample.id, reason = %reason, "sample failed");
                evaluate_failed(sample, reason)
            }
        };
        evaluation.specialist = specialist.map(|s| s.to_string());

        WorkflowOutcome {
            evaluation,
            visited,
            audited,
            traces: Vec::new(),
        }
    }

    fn prepare(&self, sample: &Sample) -> Result<(SpecialistId, CompletionRequest)> {
        let specialist = self.router.route(&sample.category)?.clone();
        let template = self.prompts.get(specialist.as_str())?;
        let vars: HashMap<&str, String> = HashMap::from([
            ("contract_text", sample.contract_text.clone()),
            ("question", sample.question.clone()),
            ("category", sample.category.clone()),
            ("indicators", template.format_indicators(&sample.category)),
            ("terminator", self.validator.terminator().to_string()),
        ]);
        let rendered = template.render(&vars)?;
        Ok((
            specialist,
            CompletionRequest {
                system: rendered.system,
                user: rendered.user,
                params: self.sampling.clone(),
            },
        ))
    }

    async fn call(
        &self,
        sample: &Sample,
        specialist: &SpecialistId,
        request: &CompletionRequest,
        attempt: u32,
    ) -> std::result::Result<String, ProviderError> {
        let trace = Trace::start_now()
            .sample(sample.id.as_str())
            .specialist(specialist.as_str())
            .model(self.sampling.model.as_str())
            .attempt(attempt);

        let result = match tokio::time::timeout(self.timeout, self.provider.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.timeout)),
        };

        match result {
            Ok(response) => {
                report_trace(trace.finish(Some(response.usage)));
                Ok(response.raw_text)
            }
            Err(err) => {
                debug!(sample = %sample.id, attempt, error = %err, "completion failed");
                report_trace(trace.finish_with_error(err.to_string()));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalog::{Catalog, TEMPORAL_RENEWAL};
    use crate::completion::{from_async_fn, CompletionResponse};
    use crate::prompts::PromptRegistry;
    use crate::types::{Classification, Tier};

    const CONTRACT: &str = "12. Governing Law. This Agreement is governed by the laws of Delaware.";

    fn sample() -> Sample {
        Sample::new(
            "gl-1",
            CONTRACT,
            "Governing Law",
            Tier::Common,
            vec!["governed by the laws of Delaware".to_string()],
        )
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        }
    }

    /// Fails with `failure` for the first `fail_times` calls, then answers correctly.
    fn workflow(fail_times: usize, failure: ProviderError, calls: Arc<AtomicUsize>) -> Workflow {
        let provider = from_async_fn(move |_req| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let failure = failure.clone();
            async move {
                if n < fail_times {
                    Err(failure)
                } else {
                    Ok(CompletionResponse::text(
                        "Section 12 is the governing law clause.\nFINAL ANSWER:\n\
                         - This Agreement is governed by the laws of Delaware.\nConfidence: 0.9",
                    ))
                }
            }
        });
        let catalog = Catalog::cuad();
        Workflow::new(
            Arc::new(Router::from_catalog(&catalog).unwrap()),
            Arc::new(PromptRegistry::with_defaults()),
            provider,
        )
    }

    #[test]
    fn transitions_follow_retry_bound() {
        let policy = fast_retry(2);
        let t = |s, o: StepOutcome| transition(s, &o, &policy).unwrap();

        assert_eq!(t(WorkflowState::Route, StepOutcome::Routed).next, WorkflowState::Extract { attempt: 0 });
        assert_eq!(t(WorkflowState::Route, StepOutcome::Unroutable("x".into())).next, WorkflowState::Failed);

        let retry = t(WorkflowState::Extract { attempt: 1 }, StepOutcome::TransientError("429".into()));
        assert_eq!(retry.next, WorkflowState::Extract { attempt: 2 });
        assert_eq!(retry.delay, Some(Duration::from_millis(2)));

        let exhausted = t(WorkflowState::Extract { attempt: 2 }, StepOutcome::TransientError("429".into()));
        assert_eq!(exhausted.next, WorkflowState::Failed);
        let permanent = t(WorkflowState::Extract { attempt: 0 }, StepOutcome::PermanentError("401".into()));
        assert_eq!(permanent.next, WorkflowState::Failed);
        assert_eq!(permanent.delay, None);

        assert_eq!(t(WorkflowState::Validate, StepOutcome::Validated).next, WorkflowState::Finalize);
        assert!(transition(WorkflowState::Finalize, &StepOutcome::Validated, &policy).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        let cap = Duration::from_millis(policy.max_delay_ms);
        for _ in 0..200 {
            assert!(policy.jittered(policy.delay_for(10)) <= cap);
        }
        let low = policy.jittered(policy.delay_for(0));
        assert!(low >= Duration::from_millis(800) && low <= Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn transient_errors_retry_then_finalize() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wf = workflow(2, ProviderError::Transient("HTTP 503".into()), calls.clone()).retry(fast_retry(3));

        let out = wf.run(&sample()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            out.visited,
            vec![
                WorkflowState::Route,
                WorkflowState::Extract { attempt: 0 },
                WorkflowState::Extract { attempt: 1 },
                WorkflowState::Extract { attempt: 2 },
                WorkflowState::Validate,
                WorkflowState::Finalize,
            ]
        );
        assert_eq!(out.evaluation.classification, Classification::Tp);
        assert_eq!(out.evaluation.specialist.as_deref(), Some(TEMPORAL_RENEWAL));
        assert!(!out.evaluation.failed);
        assert_eq!(out.traces.len(), 3);
        assert_eq!(out.traces.iter().filter(|t| t.error.is_some()).count(), 2);
    }

    #[tokio::test]
    async fn permanent_error_fails_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wf = workflow(1, ProviderError::Permanent("HTTP 401".into()), calls.clone()).retry(fast_retry(3));

        let out = wf.run(&sample()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.final_state(), WorkflowState::Failed);
        assert_eq!(out.evaluation.classification, Classification::Fn);
        assert!(out.evaluation.failed);
        assert!(out.evaluation.failure.as_deref().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wf = workflow(usize::MAX, ProviderError::Transient("HTTP 429".into()), calls.clone())
            .retry(fast_retry(2));

        let out = wf.run(&sample()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.final_state(), WorkflowState::Failed);
        assert!(out.audited.is_none());
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_transient() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = from_async_fn(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(CompletionResponse::text("FINAL ANSWER: No related clause"))
            }
        });
        let catalog = Catalog::cuad();
        let wf = Workflow::new(
            Arc::new(Router::from_catalog(&catalog).unwrap()),
            Arc::new(PromptRegistry::with_defaults()),
            provider,
        )
        .retry(fast_retry(1))
        .timeout(Duration::from_millis(10));

        let out = wf.run(&sample()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(out.evaluation.failed);
        assert!(out.evaluation.failure.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unroutable_category_fails_before_any_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wf = workflow(0, ProviderError::Permanent("unused".into()), calls.clone());
        let mut s = sample();
        s.category = "Force Majeure".into();

        let out = wf.run(&s).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.visited, vec![WorkflowState::Route, WorkflowState::Failed]);
        assert!(out.evaluation.failed);
    }
}
