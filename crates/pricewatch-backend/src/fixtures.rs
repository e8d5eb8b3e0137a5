//! YAML seed files for the in-memory backend.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::Table;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub tables: BTreeMap<Table, Vec<JsonValue>>,
    /// Fixed RPC results that replace the built-in aggregations.
    #[serde(default)]
    pub rpc: BTreeMap<String, Vec<JsonValue>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    #[serde(default)]
    pub id: Option<String>,
    pub email: String,
    pub password: String,
}

pub fn parse_seed(raw: &str) -> anyhow::Result<Seed> {
    serde_yaml::from_str(raw).context("parsing seed yaml")
}

pub fn load_seed(path: &Path) -> anyhow::Result<Seed> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed fixture {}", path.display()))?;
    parse_seed(&raw).with_context(|| format!("loading seed fixture {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn parses_tables_keyed_by_name() {
        let seed = parse_seed(
            r#"
users:
  - email: a@example.com
    password: pw
tables:
  scrape_jobs:
    - { id: 1, user_id: u1, source: ebay, search_term: "x100v" }
rpc:
  current_low_query: []
"#,
        )
        .expect("seed");
        assert_eq!(seed.users.len(), 1);
        assert!(seed.users[0].id.is_none());
        assert_eq!(seed.tables[&Table::ScrapeJobs][0]["search_term"], "x100v");
        assert!(seed.rpc["current_low_query"].is_empty());
    }

    #[test]
    fn unknown_tables_are_rejected() {
        assert!(parse_seed("tables:\n  users: []\n").is_err());
    }

    #[test]
    fn demo_seed_loads() {
        let seed = load_seed(&workspace_root().join("fixtures/demo/seed.yaml")).expect("demo seed");
        assert!(!seed.users.is_empty());
        assert!(seed.tables.contains_key(&Table::ScrapeJobs));
        assert!(seed.tables.contains_key(&Table::Listings));
    }
}
