use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::classify::Granularity;
use crate::compare::ComparisonSettings;
use crate::completion::{CompletionProvider, OpenAiCompatProvider, SamplingParams};
use crate::error::{ClauseBenchError, Result};
use crate::router::Router;
use crate::validator::DEFAULT_TERMINATOR;
use crate::workflow::RetryPolicy;

/// One experiment: a dataset, a provider and an agent architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub data: DataConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// SQLite checkpoint database for resumable runs.
    #[serde(default)]
    pub store: Option<PathBuf>,
    /// Where the final run summary JSON is written.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub comparison: ComparisonSettings,
}

fn default_concurrency() -> usize {
    8
}

fn default_terminator() -> String {
    DEFAULT_TERMINATOR.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub path: PathBuf,
    /// Keep only the first N samples of each tier.
    #[serde(default)]
    pub max_per_tier: Option<usize>,
    /// Category catalog YAML; the built-in CUAD catalog when absent.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ProviderConfig {
    OpenaiCompat {
        base_url: String,
        model: String,
        /// Environment variable holding the API key. Local servers need none.
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// One specialist per category group. `partition` overrides the catalog's assignment.
    MultiAgent {
        #[serde(default)]
        partition: Option<BTreeMap<String, Vec<String>>>,
    },
    /// Every category goes to one prompt (zero-shot, chain-of-thought, ...).
    SingleAgent { prompt: String },
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::MultiAgent { partition: None }
    }
}

impl ExperimentConfig {
    /// Load from YAML, or JSON when the extension is `.json`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClauseBenchError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .map_err(|e| ClauseBenchError::Config(format!("invalid config {}: {e}", path.display())))?
        } else {
            Self::from_yaml_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| ClauseBenchError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ClauseBenchError::Config("experiment name is empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ClauseBenchError::Config("concurrency must be at least 1".into()));
        }
        if self.terminator.trim().is_empty() {
            return Err(ClauseBenchError::Config("terminator marker is empty".into()));
        }
        if !(self.comparison.alpha > 0.0 && self.comparison.alpha <= 1.0) {
            return Err(ClauseBenchError::Config(format!(
                "comparison.alpha must be in (0, 1], got {}",
                self.comparison.alpha
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ClauseBenchError::Config("retry.multiplier must be >= 1".into()));
        }
        Ok(())
    }

    pub fn catalog(&self) -> Result<Catalog> {
        match &self.data.catalog {
            Some(path) => Catalog::from_path(path),
            None => Ok(Catalog::cuad()),
        }
    }

    pub fn router(&self, catalog: &Catalog) -> Result<Router> {
        match &self.architecture {
            Architecture::MultiAgent { partition: None } => Router::from_catalog(catalog),
            Architecture::MultiAgent {
                partition: Some(partition),
            } => Router::new(catalog, partition.clone()),
            Architecture::SingleAgent { prompt } => Router::single(catalog, prompt.clone()),
        }
    }

    pub fn sampling_params(&self) -> SamplingParams {
        let ProviderConfig::OpenaiCompat { model, .. } = &self.provider;
        SamplingParams {
            model: model.clone(),
            temperature: self.sampling.temperature,
            max_tokens: self.sampling.max_tokens,
        }
    }

    pub fn timeout(&self) -> Duration {
        let ProviderConfig::OpenaiCompat { timeout_secs, .. } = &self.provider;
        Duration::from_secs(*timeout_secs)
    }

    pub fn provider(&self) -> Result<Arc<dyn CompletionProvider>> {
        match &self.provider {
            ProviderConfig::OpenaiCompat {
                base_url,
                api_key_env,
                ..
            } => {
                let api_key = match api_key_env {
                    Some(var) => Some(std::env::var(var).map_err(|_| {
                        ClauseBenchError::Config(format!("environment variable {var} is not set"))
                    })?),
                    None => None,
                };
                Ok(Arc::new(OpenAiCompatProvider::new(base_url.clone(), api_key)))
            }
        }
    }

    /// Serialized form stored alongside a run's results.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
