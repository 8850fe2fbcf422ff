//! Static category → specialist partition, validated once at startup.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{ClauseBenchError, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecialistId(String);

impl SpecialistId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecialistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A total function from catalog categories to specialists.
#[derive(Debug, Clone)]
pub struct Router {
    routes: HashMap<String, SpecialistId>,
    specialists: BTreeMap<SpecialistId, Vec<String>>,
}

impl Router {
    /// Build from an explicit partition. Every catalog category must appear under
    /// exactly one specialist and nothing outside the catalog may appear.
    pub fn new(catalog: &Catalog, partition: BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut routes: HashMap<String, SpecialistId> = HashMap::new();
        let mut specialists: BTreeMap<SpecialistId, Vec<String>> = BTreeMap::new();

        for (specialist, categories) in partition {
            let id = SpecialistId::new(specialist);
            for name in categories {
                let canonical = catalog.get(&name).ok_or_else(|| {
                    ClauseBenchError::Config(format!(
                        "specialist '{id}' lists unknown category '{name}'"
                    ))
                })?;
                let key = canonical.name.to_ascii_lowercase();
                if let Some(previous) = routes.get(&key) {
                    return Err(ClauseBenchError::Config(format!(
                        "category '{}' is assigned to both '{previous}' and '{id}'",
                        canonical.name
                    )));
                }
                routes.insert(key, id.clone());
                specialists
                    .entry(id.clone())
                    .or_default()
                    .push(canonical.name.clone());
            }
        }

        let unmapped: Vec<&str> = catalog
            .categories()
            .iter()
            .filter(|c| !routes.contains_key(&c.name.to_ascii_lowercase()))
            .map(|c| c.name.as_str())
            .collect();
        if !unmapped.is_empty() {
            return Err(ClauseBenchError::Config(format!(
                "categories with no routing entry: {}",
                unmapped.join(", ")
            )));
        }

        Ok(Self { routes, specialists })
    }

    /// Route with the specialist assignment declared in the catalog.
    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        Self::new(catalog, catalog.partition())
    }

    /// Single-agent baselines: every category goes to one prompt.
    pub fn single(catalog: &Catalog, specialist: impl Into<String>) -> Result<Self> {
        let mut partition = BTreeMap::new();
        partition.insert(
            specialist.into(),
            catalog.categories().iter().map(|c| c.name.clone()).collect(),
        );
        Self::new(catalog, partition)
    }

    pub fn route(&self, category: &str) -> Result<&SpecialistId> {
        self.routes
            .get(&category.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                ClauseBenchError::Config(format!("no routing entry for category '{category}'"))
            })
    }

    pub fn specialists(&self) -> impl Iterator<Item = &SpecialistId> {
        self.specialists.keys()
    }

    pub fn categories_of(&self, specialist: &SpecialistId) -> &[String] {
        self.specialists
            .get(specialist)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Fail before any sample runs if the dataset mentions a category we cannot route.
    pub fn check_categories<'a, I>(&self, categories: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for c in categories {
            self.route(c)?;
        }
        Ok(())
    }

    pub fn describe(&self) -> serde_json::Value {
        let sizes: BTreeMap<String, usize> = self
            .specialists
            .iter()
            .map(|(id, cats)| (id.to_string(), cats.len()))
            .collect();
        serde_json::json!({ "specialists": sizes })
    }
}
