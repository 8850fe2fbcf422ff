//! clausebench-core: evaluation harness for clause-extraction agents.
//! Route each sample to a specialist, extract, validate against the contract,
//! classify, aggregate, and compare runs with paired significance tests.
//! See `examples/simple.rs` for a quickstart.

pub mod catalog;
pub mod classify;
pub mod compare;
pub mod completion;
pub mod config;
pub mod datasource;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod prompts;
pub mod router;
pub mod runner;
pub mod stats;
pub mod testing;
pub mod types;
pub mod validator;
pub mod workflow;

pub use catalog::{Catalog, ClauseCategory};
pub use classify::{classify, evaluate_sample, jaccard, Granularity};
pub use compare::{Comparator, ComparisonReport, ComparisonResult, ComparisonSettings, PairedTest};
pub use completion::{
    from_async_fn, CompletionProvider, CompletionRequest, CompletionResponse, OpenAiCompatProvider,
    SamplingParams,
};
pub use config::{Architecture, ExperimentConfig};
pub use datasource::{DataSource, DatasetStats, JsonlDataSource, VecDataSource};
pub use error::{ClauseBenchError, ProviderError};
pub use metrics::{aggregate, aggregate_run, MetricsAccumulator};
pub use prompts::{PromptRegistry, PromptStore, PromptTemplate};
pub use router::{Router, SpecialistId};
pub use runner::{Checkpoint, Experiment, ExperimentBuilder, MemoryCheckpoint};
pub use types::{
    Classification, Diagnostics, Metrics, RunMetrics, RunSummary, Sample, SampleEvaluation, Tier,
    Trace,
};
pub use validator::{AuditedExtraction, Validator};
pub use workflow::{RetryPolicy, Workflow, WorkflowOutcome, WorkflowState};
