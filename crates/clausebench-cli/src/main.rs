use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clausebench_core::{
	Catalog, Comparator, DataSource, DatasetStats, ExperimentBuilder, ExperimentConfig,
	JsonlDataSource, RunSummary,
};
use clausebench_core::compare::ComparisonSettings;
use clausebench_core::stats::{DEFAULT_RESAMPLES, DEFAULT_SEED};
use clausebench_store::{load_summary_json, save_summary_json, Store};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clausebench", about = "Evaluate clause-extraction agents and compare configurations")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run one experiment config; resumes from the checkpoint store when one is set
	Run(RunArgs),
	/// Paired significance tests between two completed runs
	Compare(CompareArgs),
	/// Print the metrics table of a completed run
	Summary(SummaryArgs),
	/// List runs recorded in a checkpoint store
	Runs {
		#[arg(long)]
		store: PathBuf,
	},
	/// Describe a dataset without running anything
	Stats {
		#[arg(long)]
		data: PathBuf,
		/// Category catalog YAML (built-in CUAD catalog by default)
		#[arg(long)]
		catalog: Option<PathBuf>,
	},
}

#[derive(Debug, Clone, Parser)]
struct RunArgs {
	/// Experiment config (YAML, or JSON by extension)
	#[arg(long)]
	config: PathBuf,

	/// Override the config's checkpoint database
	#[arg(long)]
	store: Option<PathBuf>,

	/// Override the config's summary output path
	#[arg(long)]
	json_out: Option<PathBuf>,

	/// Override concurrency (samples in flight)
	#[arg(long)]
	concurrency: Option<usize>,

	/// Override the per-tier sample cap
	#[arg(long)]
	max_per_tier: Option<usize>,
}

#[derive(Debug, Clone, Parser)]
struct CompareArgs {
	/// Baseline run: a summary JSON file, or a run name with --store
	baseline: String,

	/// Candidate run: a summary JSON file, or a run name with --store
	candidate: String,

	/// Read both runs from this checkpoint database
	#[arg(long)]
	store: Option<PathBuf>,

	/// Family-wise false discovery rate
	#[arg(long, default_value_t = 0.05)]
	alpha: f64,

	#[arg(long, default_value_t = DEFAULT_RESAMPLES)]
	resamples: usize,

	#[arg(long, default_value_t = DEFAULT_SEED)]
	seed: u64,

	/// Write the comparison report as JSON
	#[arg(long)]
	json_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Parser)]
struct SummaryArgs {
	/// A summary JSON file, or a run name with --store
	run: String,

	#[arg(long)]
	store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	match cli.command {
		Commands::Run(args) => run(args).await?,
		Commands::Compare(args) => compare(args)?,
		Commands::Summary(args) => {
			let summary = load_run(&args.run, args.store.as_ref())?;
			println!("{}", summary.summary_table());
			if let Some(audit) = summary.audit_table() {
				println!("Flagged samples:\n{}", audit);
			}
		}
		Commands::Runs { store } => {
			let store = Store::open(&store)?;
			for run in store.list_runs()? {
				println!(
					"{}\t{}\t{} samples\t{}",
					run.name,
					run.created_at.to_rfc3339(),
					run.samples,
					if run.complete { "complete" } else { "incomplete" }
				);
			}
		}
		Commands::Stats { data, catalog } => {
			let catalog = match catalog {
				Some(path) => Catalog::from_path(path)?,
				None => Catalog::cuad(),
			};
			let samples = JsonlDataSource::with_catalog(&data, Arc::new(catalog)).load().await?;
			println!("{}", serde_json::to_string_pretty(&DatasetStats::of(&samples))?);
		}
	}
	Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
	let mut config = ExperimentConfig::from_path(&args.config)?;
	if let Some(store) = args.store {
		config.store = Some(store);
	}
	if let Some(out) = args.json_out {
		config.output = Some(out);
	}
	if let Some(n) = args.concurrency {
		config.concurrency = n;
	}
	if let Some(n) = args.max_per_tier {
		config.data.max_per_tier = Some(n);
	}
	config.validate()?;

	let mut builder = ExperimentBuilder::from_config(&config, config.provider()?)?;
	if let Some(path) = &config.store {
		let store = Store::open(path)?;
		builder = builder.checkpoint(Arc::new(store));
	}
	let experiment = builder.build()?;

	info!(run = %config.name, config = %args.config.display(), "starting experiment");
	let summary = experiment.run_until(interrupted(tokio::signal::ctrl_c())).await?;

	println!("{}", summary.summary_table());
	if let Some(audit) = summary.audit_table() {
		println!("Flagged samples:\n{}", audit);
	}

	if !summary.complete {
		bail!(
			"run '{}' was interrupted after {} samples; rerun with the same store to resume",
			summary.name,
			summary.samples.len()
		);
	}
	if let Some(path) = &config.output {
		save_summary_json(path, &summary)?;
		info!(path = %path.display(), "summary written");
	}
	Ok(())
}

fn compare(args: CompareArgs) -> Result<()> {
	let baseline = load_run(&args.baseline, args.store.as_ref())?;
	let candidate = load_run(&args.candidate, args.store.as_ref())?;

	let comparator = Comparator::new(ComparisonSettings {
		alpha: args.alpha,
		bootstrap_resamples: args.resamples,
		seed: args.seed,
	});
	let report = comparator.compare(&baseline, &candidate)?;

	println!("{}", report.table());

	if let Some(path) = args.json_out {
		let json = serde_json::to_string_pretty(&report)?;
		std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
	}
	Ok(())
}

/// Resolves when `signal` reports an interrupt. If the handler cannot be
/// installed the run is never interrupted.
async fn interrupted<F, E>(signal: F)
where
	F: Future<Output = std::result::Result<(), E>>,
	E: std::fmt::Display,
{
	match signal.await {
		Ok(()) => warn!("interrupt received; finishing recorded samples and stopping"),
		Err(err) => {
			warn!(error = %err, "could not listen for Ctrl-C; the run can only stop by finishing");
			std::future::pending::<()>().await
		}
	}
}

fn load_run(run: &str, store: Option<&PathBuf>) -> Result<RunSummary> {
	match store {
		Some(path) => Store::open(path)?
			.load_summary(run)?
			.with_context(|| format!("no completed summary for run '{run}' in {:?}", path)),
		None => load_summary_json(run),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn signal_handler_failure_never_interrupts() {
		let failed = interrupted(async { Err::<(), _>(std::io::Error::other("no signal handler")) });
		assert!(tokio::time::timeout(Duration::from_millis(50), failed).await.is_err());

		let received = interrupted(async { Ok::<(), std::io::Error>(()) });
		assert!(tokio::time::timeout(Duration::from_millis(50), received).await.is_ok());
	}
}
