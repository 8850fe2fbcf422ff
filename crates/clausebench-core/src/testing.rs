use crate::types::RunSummary;
use anyhow::Result;

/// Helper to assert a run's overall F2 meets a threshold.
///
/// Use this in your `#[tokio::test]` functions.
///
/// # Example
/// ```ignore
/// #[tokio::test]
/// async fn test_my_specialists() -> Result<()> {
///     let experiment = Experiment::builder()
///         .name("multi_agent")
///         .data_source(data)
///         .workflow(workflow)
///         .build()?;
///
///     let summary = experiment.run().await?;
///
///     assert_complete(&summary)?;
///     assert_f2_at_least(&summary, 0.6)?;
///
///     Ok(())
/// }
/// ```
pub fn assert_f2_at_least(summary: &RunSummary, min_f2: f64) -> Result<()> {
    if summary.metrics.metrics.f2 < min_f2 {
        anyhow::bail!(
            "Run failed: F2 {:.3} is below threshold {:.3}\n{}",
            summary.metrics.metrics.f2,
            min_f2,
            summary.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert recall meets a threshold.
pub fn assert_recall_at_least(summary: &RunSummary, min_recall: f64) -> Result<()> {
    if summary.metrics.metrics.recall < min_recall {
        anyhow::bail!(
            "Run failed: recall {:.3} is below threshold {:.3}\n{}",
            summary.metrics.metrics.recall,
            min_recall,
            summary.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert no sample ended in the FAILED state.
pub fn assert_no_failures(summary: &RunSummary) -> Result<()> {
    let failed = summary.metrics.metrics.failed;
    if failed > 0 {
        anyhow::bail!(
            "Run failed: {}/{} samples did not complete the workflow\n{}\n{}",
            failed,
            summary.metrics.metrics.total,
            summary.summary_table(),
            summary.audit_table().unwrap_or_default()
        );
    }
    Ok(())
}

/// Helper to assert the run covered its whole dataset.
pub fn assert_complete(summary: &RunSummary) -> Result<()> {
    if !summary.complete {
        anyhow::bail!(
            "Run '{}' is incomplete: {} samples evaluated\n{}",
            summary.name,
            summary.samples.len(),
            summary.summary_table()
        );
    }
    Ok(())
}
