use std::sync::Arc;

use clausebench_core::{
    from_async_fn, Catalog, Comparator, CompletionResponse, Experiment, ExperimentConfig,
    ExperimentBuilder, PromptRegistry, Router, Sample, Tier, VecDataSource, Workflow,
};

const CONTRACT: &str = "MASTER SERVICES AGREEMENT between ACME Corp and Beta LLC. \
    9. Governing Law. This Agreement shall be governed by the laws of the State of Delaware. \
    12. Term. This Agreement shall remain in effect for three (3) years.";

fn samples() -> Vec<Sample> {
    vec![
        Sample::new("0", CONTRACT, "Governing Law", Tier::Common, vec!["governed by the laws of the State of Delaware".into()]),
        Sample::new("1", CONTRACT, "Expiration Date", Tier::Common, vec!["remain in effect for three (3) years".into()]),
        Sample::new("2", CONTRACT, "Insurance", Tier::Moderate, vec![]),
        Sample::new("3", CONTRACT, "Source Code Escrow", Tier::Rare, vec![]),
    ]
}

/// A scripted specialist: finds governing-law and term clauses, declines everything else.
fn workflow(router: Router, finds_term: bool) -> Workflow {
    let provider = from_async_fn(move |req| {
        let user = req.user.clone();
        async move {
            let answer = if user.contains("Category: Governing Law") {
                "FINAL ANSWER:\n- This Agreement shall be governed by the laws of the State of Delaware.\nConfidence: 0.9"
            } else if finds_term && user.contains("Category: Expiration Date") {
                "FINAL ANSWER:\n- This Agreement shall remain in effect for three (3) years.\nConfidence: 0.7"
            } else {
                "The contract does not address this.\nFINAL ANSWER: No related clause"
            };
            Ok(CompletionResponse::text(answer))
        }
    });
    Workflow::new(Arc::new(router), Arc::new(PromptRegistry::with_defaults()), provider)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Example 1: Two scripted configurations on inline samples, then a paired comparison
    let catalog = Catalog::cuad();

    let baseline = Experiment::builder()
        .name("single_agent")
        .data_source(Arc::new(VecDataSource::new(samples())))
        .workflow(workflow(Router::single(&catalog, "zero_shot")?, false))
        .build()?
        .run()
        .await?;
    println!("{}", baseline.summary_table());

    let candidate = Experiment::builder()
        .name("multi_agent")
        .data_source(Arc::new(VecDataSource::new(samples())))
        .workflow(workflow(Router::from_catalog(&catalog)?, true))
        .concurrency(4)
        .build()?
        .run()
        .await?;
    println!("{}", candidate.summary_table());

    let report = Comparator::default().compare(&baseline, &candidate)?;
    println!("{}", report.table());

    // Example 2: Run an experiment config against a real endpoint if provided
    if let Some(path) = std::env::args().nth(1) {
        let config = ExperimentConfig::from_path(path)?;
        let summary = ExperimentBuilder::from_config(&config, config.provider()?)?
            .build()?
            .run()
            .await?;
        println!("{}", summary.summary_table());
    }

    Ok(())
}
