//! Row transforms applied between reading and writing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use batchload_core::{EntityRegistry, RawRow};
use batchload_storage::{RecordStore, RetryPolicy};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::lookup::{LookupTable, RefreshPolicy};

#[async_trait]
pub trait RowTransform: Send {
    async fn apply(&mut self, rows: Vec<RawRow>) -> Result<Vec<RawRow>>;
}

#[derive(Default)]
pub struct NoopTransform;

#[async_trait]
impl RowTransform for NoopTransform {
    async fn apply(&mut self, rows: Vec<RawRow>) -> Result<Vec<RawRow>> {
        Ok(rows)
    }
}

/// Rules file, e.g.
///
/// ```yaml
/// version: 1
/// rename: { org_uuid: id }
/// drop: [permalink]
/// constants: { source: crunchbase }
/// lookups:
///   - { source: country_code, target: country, table: countries,
///       key_field: alpha2, value_field: name, refresh_secs: 3600 }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSet {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub lookups: Vec<LookupRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupRule {
    pub source: String,
    pub target: String,
    pub table: String,
    pub key_field: String,
    pub value_field: String,
    #[serde(default)]
    pub refresh_secs: Option<u64>,
}

impl RuleSet {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing transform rules")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Applies a [`RuleSet`] to each row in order: renames, lookups (by the
/// renamed field names), drops, then constants.
pub struct RuleTransform {
    rules: RuleSet,
    lookups: Vec<(LookupRule, LookupTable)>,
}

impl RuleTransform {
    /// Rules without lookups need no store.
    pub fn without_lookups(rules: RuleSet) -> Result<Self> {
        if let Some(rule) = rules.lookups.first() {
            anyhow::bail!("lookup on `{}` needs a store", rule.table);
        }
        Ok(Self {
            rules,
            lookups: Vec::new(),
        })
    }

    pub fn new(
        rules: RuleSet,
        store: Arc<dyn RecordStore>,
        registry: &EntityRegistry,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut lookups = Vec::with_capacity(rules.lookups.len());
        for rule in &rules.lookups {
            let entity = registry.get(&rule.table)?;
            let policy = rule
                .refresh_secs
                .map_or(RefreshPolicy::Manual, |secs| {
                    RefreshPolicy::Every(Duration::from_secs(secs))
                });
            let table = LookupTable::new(
                store.clone(),
                entity,
                rule.key_field.clone(),
                rule.value_field.clone(),
                policy,
            )?
            .with_retry(retry);
            lookups.push((rule.clone(), table));
        }
        Ok(Self { rules, lookups })
    }
}

/// Renames apply simultaneously: `{a: b, b: c}` moves `a` to `b` and the
/// original `b` to `c`, whatever the map order.
fn rename_fields(row: &mut RawRow, rename: &BTreeMap<String, String>) {
    let moved = rename
        .iter()
        .filter_map(|(from, to)| row.remove(from).map(|value| (to.clone(), value)))
        .collect::<Vec<_>>();
    row.extend(moved);
}

#[async_trait]
impl RowTransform for RuleTransform {
    async fn apply(&mut self, mut rows: Vec<RawRow>) -> Result<Vec<RawRow>> {
        for (rule, table) in &mut self.lookups {
            table
                .refresh_if_stale()
                .await
                .with_context(|| format!("refreshing lookup table `{}`", rule.table))?;
        }
        for row in &mut rows {
            rename_fields(row, &self.rules.rename);
            for (rule, table) in &self.lookups {
                let value = row
                    .get(&rule.source)
                    .and_then(|key| table.lookup(key))
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                row.insert(rule.target.clone(), value);
            }
            for field in &self.rules.drop {
                row.remove(field);
            }
            for (field, value) in &self.rules.constants {
                row.insert(field.clone(), value.clone());
            }
        }
        Ok(rows)
    }
}
