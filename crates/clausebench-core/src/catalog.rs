//! The fixed set of clause categories, each with one tier and one default specialist.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClauseBenchError, Result};
use crate::types::Tier;

pub const RISK_LIABILITY: &str = "risk_liability";
pub const TEMPORAL_RENEWAL: &str = "temporal_renewal";
pub const IP_COMMERCIAL: &str = "ip_commercial";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClauseCategory {
    pub name: String,
    pub tier: Tier,
    pub specialist: String,
}

/// CUAD categories: (name, tier, specialist). 6 common / 18 moderate / 17 rare,
/// split 13 / 11 / 17 across the three specialists.
const CUAD: &[(&str, Tier, &str)] = &[
    ("Uncapped Liability", Tier::Rare, RISK_LIABILITY),
    ("Cap On Liability", Tier::Moderate, RISK_LIABILITY),
    ("Liquidated Damages", Tier::Rare, RISK_LIABILITY),
    ("Insurance", Tier::Moderate, RISK_LIABILITY),
    ("Warranty Duration", Tier::Moderate, RISK_LIABILITY),
    ("Audit Rights", Tier::Moderate, RISK_LIABILITY),
    ("Non-Disparagement", Tier::Rare, RISK_LIABILITY),
    ("Covenant Not To Sue", Tier::Rare, RISK_LIABILITY),
    ("Third Party Beneficiary", Tier::Rare, RISK_LIABILITY),
    ("Most Favored Nation", Tier::Rare, RISK_LIABILITY),
    ("Change Of Control", Tier::Moderate, RISK_LIABILITY),
    ("Post-Termination Services", Tier::Moderate, RISK_LIABILITY),
    ("Minimum Commitment", Tier::Rare, RISK_LIABILITY),
    ("Document Name", Tier::Common, TEMPORAL_RENEWAL),
    ("Parties", Tier::Common, TEMPORAL_RENEWAL),
    ("Agreement Date", Tier::Common, TEMPORAL_RENEWAL),
    ("Effective Date", Tier::Common, TEMPORAL_RENEWAL),
    ("Expiration Date", Tier::Common, TEMPORAL_RENEWAL),
    ("Renewal Term", Tier::Moderate, TEMPORAL_RENEWAL),
    ("Notice Period To Terminate Renewal", Tier::Rare, TEMPORAL_RENEWAL),
    ("Termination For Convenience", Tier::Moderate, TEMPORAL_RENEWAL),
    ("Anti-Assignment", Tier::Moderate, TEMPORAL_RENEWAL),
    ("Rofr/Rofo/Rofn", Tier::Moderate, TEMPORAL_RENEWAL),
    ("Governing Law", Tier::Common, TEMPORAL_RENEWAL),
    ("Ip Ownership Assignment", Tier::Moderate, IP_COMMERCIAL),
    ("Joint Ip Ownership", Tier::Rare, IP_COMMERCIAL),
    ("License Grant", Tier::Moderate, IP_COMMERCIAL),
    ("Non-Transferable License", Tier::Moderate, IP_COMMERCIAL),
    ("Affiliate License-Licensor", Tier::Rare, IP_COMMERCIAL),
    ("Affiliate License-Licensee", Tier::Rare, IP_COMMERCIAL),
    ("Unlimited/All-You-Can-Eat-License", Tier::Rare, IP_COMMERCIAL),
    ("Irrevocable Or Perpetual License", Tier::Moderate, IP_COMMERCIAL),
    ("Source Code Escrow", Tier::Rare, IP_COMMERCIAL),
    ("Exclusivity", Tier::Moderate, IP_COMMERCIAL),
    ("Non-Compete", Tier::Moderate, IP_COMMERCIAL),
    ("No-Solicit Of Customers", Tier::Moderate, IP_COMMERCIAL),
    ("No-Solicit Of Employees", Tier::Moderate, IP_COMMERCIAL),
    ("Competitive Restriction Exception", Tier::Rare, IP_COMMERCIAL),
    ("Revenue/Profit Sharing", Tier::Rare, IP_COMMERCIAL),
    ("Price Restrictions", Tier::Rare, IP_COMMERCIAL),
    ("Volume Restriction", Tier::Rare, IP_COMMERCIAL),
];

/// Immutable category registry. Lookups ignore ASCII case because dataset
/// spellings drift ("Cap on Liability" vs "Cap On Liability").
#[derive(Debug, Clone)]
pub struct Catalog {
    categories: Vec<ClauseCategory>,
    index: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct CatalogFile {
    categories: Vec<ClauseCategory>,
}

impl Catalog {
    pub fn new(categories: Vec<ClauseCategory>) -> Result<Self> {
        let mut index = HashMap::with_capacity(categories.len());
        for (i, c) in categories.iter().enumerate() {
            if c.name.trim().is_empty() {
                return Err(ClauseBenchError::Config(format!(
                    "category #{i} has an empty name"
                )));
            }
            if index.insert(key(&c.name), i).is_some() {
                return Err(ClauseBenchError::Config(format!(
                    "duplicate category '{}'",
                    c.name
                )));
            }
        }
        Ok(Self { categories, index })
    }

    /// The 41-category CUAD catalog.
    pub fn cuad() -> Self {
        let categories: Vec<ClauseCategory> = CUAD
            .iter()
            .map(|(name, tier, specialist)| ClauseCategory {
                name: name.to_string(),
                tier: *tier,
                specialist: specialist.to_string(),
            })
            .collect();
        let index = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (key(&c.name), i))
            .collect();
        Self { categories, index }
    }

    /// Parse `categories: [{name, tier, specialist}, ...]`.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(s)
            .map_err(|e| ClauseBenchError::Config(format!("invalid catalog YAML: {e}")))?;
        Self::new(file.categories)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClauseBenchError::Config(format!("failed to read catalog {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn get(&self, name: &str) -> Option<&ClauseCategory> {
        self.index.get(&key(name)).map(|&i| &self.categories[i])
    }

    pub fn tier_of(&self, name: &str) -> Option<Tier> {
        self.get(name).map(|c| c.tier)
    }

    pub fn categories(&self) -> &[ClauseCategory] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Default specialist → categories partition declared by the catalog.
    pub fn partition(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for c in &self.categories {
            out.entry(c.specialist.clone())
                .or_default()
                .push(c.name.clone());
        }
        out
    }
}

fn key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
