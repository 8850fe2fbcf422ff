//! Prompt templates keyed by specialist or baseline name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{IP_COMMERCIAL, RISK_LIABILITY, TEMPORAL_RENEWAL};
use crate::error::{ClauseBenchError, Result};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub user: String,
    /// Variables that must be supplied when rendering.
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub category_indicators: HashMap<String, Vec<String>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

impl PromptTemplate {
    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<RenderedPrompt> {
        let missing: Vec<&str> = self
            .variables
            .iter()
            .map(String::as_str)
            .filter(|v| !vars.contains_key(v))
            .collect();
        if !missing.is_empty() {
            return Err(ClauseBenchError::Config(format!(
                "prompt '{}' is missing variables: {}",
                self.name,
                missing.join(", ")
            )));
        }

        Ok(RenderedPrompt {
            system: substitute(&self.system, vars),
            user: substitute(&self.user, vars),
        })
    }

    pub fn indicators(&self, category: &str) -> &[String] {
        self.category_indicators
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(category))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Indicators as a bullet list for interpolation.
    pub fn format_indicators(&self, category: &str) -> String {
        let indicators = self.indicators(category);
        if indicators.is_empty() {
            return "No specific indicators defined.".to_string();
        }
        indicators
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// Unknown placeholders are left untouched so literal braces in a template survive.
fn substitute(template: &str, vars: &HashMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Source of rendered instructions for the extraction workflow.
pub trait PromptStore: Send + Sync {
    fn get(&self, name: &str) -> Result<&PromptTemplate>;
}

#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    prompts: HashMap<String, PromptTemplate>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in specialist and baseline templates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for template in default_templates() {
            registry.register(template);
        }
        registry
    }

    pub fn register(&mut self, prompt: PromptTemplate) {
        self.prompts.insert(prompt.name.clone(), prompt);
    }

    pub fn load_str(&mut self, yaml: &str) -> Result<&PromptTemplate> {
        let prompt: PromptTemplate = serde_yaml::from_str(yaml)
            .map_err(|e| ClauseBenchError::Config(format!("invalid prompt YAML: {e}")))?;
        let name = prompt.name.clone();
        self.register(prompt);
        self.get(&name)
    }

    /// Load every `*.yaml` / `*.yml` below `dir`. Invalid files are logged and skipped;
    /// later files override earlier templates with the same name.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut loaded = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current).map_err(|e| {
                ClauseBenchError::Config(format!("cannot read {}: {e}", current.display()))
            })?;
            let mut paths: Vec<_> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            paths.sort();
            for path in paths {
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let is_yaml = matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                );
                if !is_yaml {
                    continue;
                }
                let loaded_one = std::fs::read_to_string(&path)
                    .map_err(|e| ClauseBenchError::Config(e.to_string()))
                    .and_then(|content| self.load_str(&content).map(|p| p.name.clone()));
                match loaded_one {
                    Ok(name) => {
                        debug!(prompt = %name, path = %path.display(), "loaded prompt");
                        loaded += 1;
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping prompt file"),
                }
            }
        }
        Ok(loaded)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prompts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prompts.contains_key(name)
    }
}

impl PromptStore for PromptRegistry {
    fn get(&self, name: &str) -> Result<&PromptTemplate> {
        self.prompts.get(name).ok_or_else(|| {
            ClauseBenchError::Config(format!(
                "prompt not found: {name}. Available: {}",
                self.names().join(", ")
            ))
        })
    }
}

const ANSWER_FORMAT: &str = "Think through the contract first. When you are done, write the line \
\"{terminator}\" and after it list each extracted clause as a bullet (\"- \") quoting the contract \
text exactly, without rephrasing. Then add a line \"Confidence: <0.0-1.0>\" and a line \
\"Indicators: <comma-separated indicators you relied on>\". If the contract has no relevant \
clause, write \"No related clause\" as the only answer line.";

const USER: &str = "Context:\n{contract_text}\n\nQuestion:\n{question}\n\nCategory: {category}\n\n\
Indicators to look for:\n{indicators}";

fn specialist(name: &str, domain: &str) -> PromptTemplate {
    PromptTemplate {
        name: name.to_string(),
        version: default_version(),
        description: format!("{domain} specialist"),
        system: format!(
            "You are a legal analyst specialising in {domain} clauses, supporting senior lawyers. \
Extract every clause of the requested category. If you are unsure whether a clause is relevant, \
include it. {ANSWER_FORMAT}"
        ),
        user: USER.to_string(),
        variables: vec![
            "contract_text".into(),
            "question".into(),
            "category".into(),
            "terminator".into(),
        ],
        category_indicators: HashMap::new(),
    }
}

/// Built-in templates: the three CUAD specialists plus two single-agent baselines.
pub fn default_templates() -> Vec<PromptTemplate> {
    let mut zero_shot = specialist("zero_shot", "commercial contract");
    zero_shot.description = "single-agent zero-shot baseline".into();
    zero_shot.system = format!(
        "You are an assistant with strong legal knowledge, supporting senior lawyers by \
preparing reference materials. {ANSWER_FORMAT}"
    );

    let mut cot = zero_shot.clone();
    cot.name = "chain_of_thought".into();
    cot.description = "single-agent chain-of-thought baseline".into();
    cot.system = format!(
        "You are an assistant with strong legal knowledge. Reason step by step: identify the \
key concepts in the question, scan the context for sentences containing them, and keep only \
those that directly address the question. {ANSWER_FORMAT}"
    );

    vec![
        specialist(RISK_LIABILITY, "risk and liability"),
        specialist(TEMPORAL_RENEWAL, "term, renewal and boilerplate"),
        specialist(IP_COMMERCIAL, "intellectual property and commercial"),
        zero_shot,
        cot,
    ]
}
