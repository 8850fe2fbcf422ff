//! Per-sample collection of completion-call traces.
//!
//! Each sample's workflow runs inside [`scope_traces`]; the provider wrapper
//! calls [`report_trace`] once per attempt. Scopes never leak across samples,
//! so concurrent workflows cannot mix their traces.

use std::cell::RefCell;
use std::future::Future;

use crate::types::Trace;

tokio::task_local! {
    static TRACES: RefCell<Vec<Trace>>;
}

/// Run a future within a trace scope and return its output along with the collected traces.
pub async fn scope_traces<F, R>(f: F) -> (R, Vec<Trace>)
where
    F: Future<Output = R>,
{
    TRACES
        .scope(RefCell::new(Vec::new()), async move {
            let result = f.await;
            let collected = TRACES.with(|t| t.take());
            (result, collected)
        })
        .await
}

/// Record a trace in the current scope. Outside a scope this is a no-op.
pub fn report_trace(trace: Trace) {
    let _ = TRACES.try_with(|traces| traces.borrow_mut().push(trace));
}

/// Snapshot of the traces recorded so far in the current scope.
pub fn current_traces() -> Vec<Trace> {
    TRACES
        .try_with(|traces| traces.borrow().clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Diagnostics, TokenUsage};

    #[tokio::test]
    async fn traces_stay_inside_their_scope() {
        let (value, traces) = scope_traces(async {
            report_trace(
                Trace::start_now()
                    .sample("s1")
                    .specialist("risk_liability")
                    .attempt(0)
                    .finish_with_error("HTTP 429"),
            );
            report_trace(
                Trace::start_now()
                    .sample("s1")
                    .specialist("risk_liability")
                    .attempt(1)
                    .finish(Some(TokenUsage::new(100, 20))),
            );
            assert_eq!(current_traces().len(), 2);
            7
        })
        .await;

        assert_eq!(value, 7);
        assert_eq!(traces.len(), 2);
        let diag = Diagnostics::from_traces(&traces);
        assert_eq!(diag.calls, 2);
        assert_eq!(diag.failed_calls, 1);
        assert_eq!(diag.retries, 1);
        assert_eq!(diag.input_tokens, 100);

        // no scope: silently dropped
        report_trace(Trace::start_now().finish(None));
        assert!(current_traces().is_empty());
    }
}
