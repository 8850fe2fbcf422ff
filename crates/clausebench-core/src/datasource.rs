use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::catalog::Catalog;
use crate::types::{Sample, Tier};

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Sample>>;
}

pub struct VecDataSource {
    samples: Vec<Sample>,
}

impl VecDataSource {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

#[async_trait]
impl DataSource for VecDataSource {
    async fn load(&self) -> Result<Vec<Sample>> {
        Ok(self.samples.clone())
    }
}

/// Read JSONL where each line is one sample:
/// - `{"id", "contract_text" | "context", "category"?, "question"?, "tier"?, "title"?,
///    "ground_truth": [..] | "..."}`
/// - or CUAD-style with `"answers": {"text": [..]}` in place of `ground_truth`.
///
/// A missing category is taken from the quoted name in the question. A missing
/// tier is resolved through the catalog, whose spelling of the category wins.
pub struct JsonlDataSource {
    path: PathBuf,
    catalog: Arc<Catalog>,
}

impl JsonlDataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_catalog(path, Arc::new(Catalog::cuad()))
    }

    pub fn with_catalog(path: impl Into<PathBuf>, catalog: Arc<Catalog>) -> Self {
        Self {
            path: path.into(),
            catalog,
        }
    }
}

#[async_trait]
impl DataSource for JsonlDataSource {
    async fn load(&self) -> Result<Vec<Sample>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let samples = parse_jsonl(&content, &self.catalog)?;
        debug!(path = %self.path.display(), samples = samples.len(), "loaded dataset");
        Ok(samples)
    }
}

pub fn parse_jsonl(content: &str, catalog: &Catalog) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    let mut seen = HashSet::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", idx + 1))?;
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("Line {}: expected object", idx + 1))?;
        let sample = parse_sample(obj, catalog).with_context(|| format!("Line {}", idx + 1))?;
        if !seen.insert(sample.id.clone()) {
            bail!("Line {}: duplicate sample id '{}'", idx + 1, sample.id);
        }
        samples.push(sample);
    }
    Ok(samples)
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn parse_sample(obj: &Map<String, Value>, catalog: &Catalog) -> Result<Sample> {
    let id = match obj.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => bail!("missing 'id'"),
    };
    let contract_text = str_field(obj, &["contract_text", "context"])
        .ok_or_else(|| anyhow!("missing 'contract_text'/'context'"))?;
    let question = str_field(obj, &["question"]);

    let category = match str_field(obj, &["category"]) {
        Some(c) => c.to_string(),
        None => question
            .and_then(quoted_category)
            .ok_or_else(|| anyhow!("missing 'category' and none quoted in 'question'"))?,
    };

    let tier = match str_field(obj, &["tier"]) {
        Some(t) => t.parse::<Tier>().map_err(|e| anyhow!(e))?,
        None => catalog
            .tier_of(&category)
            .ok_or_else(|| anyhow!("category '{category}' is not in the catalog and no tier is given"))?,
    };
    let category = catalog
        .get(&category)
        .map(|c| c.name.clone())
        .unwrap_or(category);

    let ground_truth = match obj.get("ground_truth") {
        Some(v) => string_list(v).context("'ground_truth'")?,
        None => match obj.get("answers").and_then(|a| a.get("text")) {
            Some(v) => string_list(v).context("'answers.text'")?,
            None => Vec::new(),
        },
    };

    let mut sample = Sample::new(id, contract_text, category, tier, ground_truth);
    if let Some(q) = question {
        sample = sample.with_question(q);
    }
    if let Some(title) = str_field(obj, &["title"]) {
        sample = sample.with_title(title);
    }
    Ok(sample)
}

fn string_list(v: &Value) -> Result<Vec<String>> {
    match v {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("expected strings, got {i}"))
            })
            .filter(|s| !matches!(s, Ok(s) if s.trim().is_empty()))
            .collect(),
        other => bail!("expected string or array, got {other}"),
    }
}

/// `... related to "Governing Law" that ...` → `Governing Law`.
fn quoted_category(question: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let Some(start) = question.find(quote) else {
            continue;
        };
        let rest = &question[start + 1..];
        if let Some(end) = rest.find(quote) {
            if end > 0 {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

/// Keep the first `max_per_tier` samples of every tier, preserving dataset order.
pub fn stratify(samples: Vec<Sample>, max_per_tier: usize) -> Vec<Sample> {
    let mut taken: BTreeMap<Tier, usize> = BTreeMap::new();
    samples
        .into_iter()
        .filter(|s| {
            let n = taken.entry(s.tier).or_insert(0);
            *n += 1;
            *n <= max_per_tier
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStats {
    pub total: usize,
    pub positive: usize,
    pub negative: usize,
    pub positive_rate: f64,
    pub categories: usize,
    pub contracts: usize,
    pub per_tier: BTreeMap<Tier, usize>,
}

impl DatasetStats {
    pub fn of(samples: &[Sample]) -> Self {
        let positive = samples.iter().filter(|s| s.has_clause()).count();
        let mut per_tier = BTreeMap::new();
        for s in samples {
            *per_tier.entry(s.tier).or_insert(0) += 1;
        }
        Self {
            total: samples.len(),
            positive,
            negative: samples.len() - positive,
            positive_rate: if samples.is_empty() {
                0.0
            } else {
                positive as f64 / samples.len() as f64
            },
            categories: samples.iter().map(|s| s.category.as_str()).collect::<HashSet<_>>().len(),
            contracts: samples
                .iter()
                .filter_map(|s| s.title.as_deref())
                .collect::<HashSet<_>>()
                .len(),
            per_tier,
        }
    }
}
