// ABOUTME: Source registry: CRUD over definitions keyed by name, persisted store plus in-memory mirror.
// ABOUTME: Writes are serialized and hit the store before the mirror; reads only touch the mirror.

//! Source registry.
//!
//! The mirror is a `tokio::sync::RwLock` snapshot of the store. Every write
//! takes the writer mutex, persists through the [`SourceStore`], and only then
//! updates the mirror, so readers never observe a change the store rejected.

pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{EngineError, Stage};
use crate::registry::store::SourceStore;
use crate::source::normalize::normalize;
use crate::source::patches::{apply_all, PatchContext};
use crate::source::SourceDefinition;

/// Outcome of `add_or_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upsert {
    Created,
    Updated,
}

impl fmt::Display for Upsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upsert::Created => write!(f, "created"),
            Upsert::Updated => write!(f, "updated"),
        }
    }
}

pub struct SourceRegistry {
    store: Arc<dyn SourceStore>,
    mirror: RwLock<BTreeMap<String, SourceDefinition>>,
    writer: Mutex<()>,
    domain_aliases: BTreeMap<String, String>,
}

impl SourceRegistry {
    /// Loads the store into a fresh mirror.
    pub async fn open(
        store: Arc<dyn SourceStore>,
        domain_aliases: BTreeMap<String, String>,
    ) -> Result<Self, EngineError> {
        let rows = store.load_all().await?;
        info!(count = rows.len(), "loaded source registry");
        Ok(Self {
            store,
            mirror: RwLock::new(rows.into_iter().map(|d| (d.name.clone(), d)).collect()),
            writer: Mutex::new(()),
            domain_aliases,
        })
    }

    /// All definitions, ordered by name.
    pub async fn list(&self) -> Vec<SourceDefinition> {
        self.mirror.read().await.values().cloned().collect()
    }

    /// Enabled definitions, ordered by name.
    pub async fn enabled(&self) -> Vec<SourceDefinition> {
        self.mirror
            .read()
            .await
            .values()
            .filter(|d| d.enabled)
            .cloned()
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<SourceDefinition> {
        self.mirror.read().await.get(name.trim()).cloned()
    }

    /// Sorted distinct group labels across all definitions.
    pub async fn groups(&self) -> Vec<String> {
        let mirror = self.mirror.read().await;
        let set: BTreeSet<String> = mirror.values().flat_map(|d| d.groups()).collect();
        set.into_iter().collect()
    }

    pub async fn by_group(&self, group: &str) -> Vec<SourceDefinition> {
        self.mirror
            .read()
            .await
            .values()
            .filter(|d| d.in_group(group))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.mirror.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Inserts or replaces a definition. Usage stats survive an update that carries none.
    pub async fn add_or_update(&self, mut def: SourceDefinition) -> Result<Upsert, EngineError> {
        def.name = def.name.trim().to_string();
        if def.name.is_empty() {
            return Err(EngineError::config(
                Stage::Registry,
                "source definition has no name",
            ));
        }

        let _writer = self.writer.lock().await;
        let existing = self.mirror.read().await.get(&def.name).cloned();
        if let Some(existing) = &existing {
            if def.stats.is_empty() {
                def.stats = existing.stats.clone();
            }
        }
        self.store
            .put(&def)
            .await
            .map_err(|e| e.for_source(def.name.as_str()))?;

        let outcome = if existing.is_some() {
            Upsert::Updated
        } else {
            Upsert::Created
        };
        debug!(source = %def.name, %outcome, "stored source definition");
        self.mirror.write().await.insert(def.name.clone(), def);
        Ok(outcome)
    }

    /// Normalizes, patches and stores one JSON definition.
    pub async fn add_or_update_value(&self, raw: &Value) -> Result<(String, Upsert), EngineError> {
        let def = self.prepare(raw)?;
        let name = def.name.clone();
        let outcome = self.add_or_update(def).await?;
        Ok((name, outcome))
    }

    /// Like [`add_or_update_value`](Self::add_or_update_value) for a JSON document holding one definition.
    pub async fn add_or_update_raw(&self, json: &str) -> Result<(String, Upsert), EngineError> {
        let value: Value = serde_json::from_str(json).map_err(|e| {
            EngineError::parse(Stage::Normalize, "source definition is not valid JSON").caused_by(e)
        })?;
        self.add_or_update_value(&value).await
    }

    /// Normalized and patched definition, not yet stored.
    pub fn prepare(&self, raw: &Value) -> Result<SourceDefinition, EngineError> {
        let mut def = normalize(raw)?;
        apply_all(
            &mut def,
            PatchContext {
                domain_aliases: &self.domain_aliases,
            },
        );
        Ok(def)
    }

    pub async fn delete(&self, name: &str) -> Result<(), EngineError> {
        let name = name.trim();
        let _writer = self.writer.lock().await;
        if !self.mirror.read().await.contains_key(name) {
            return Err(self.not_found(name));
        }
        self.store
            .remove(name)
            .await
            .map_err(|e| e.for_source(name))?;
        self.mirror.write().await.remove(name);
        debug!(source = name, "deleted source definition");
        Ok(())
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        self.modify(name, |def| def.enabled = enabled).await
    }

    /// Bumps the usage counter and last-used time after a successful search.
    pub async fn record_usage(&self, name: &str) -> Result<(), EngineError> {
        self.modify(name, |def| {
            def.stats.count = def.stats.count.saturating_add(1);
            def.stats.last_used = Some(Utc::now());
        })
        .await
    }

    /// JSON array of canonical definitions without usage statistics.
    pub async fn export_json(&self) -> Result<String, EngineError> {
        let defs: Vec<SourceDefinition> = self
            .mirror
            .read()
            .await
            .values()
            .map(SourceDefinition::without_stats)
            .collect();
        serde_json::to_string_pretty(&defs).map_err(EngineError::storage)
    }

    async fn modify(
        &self,
        name: &str,
        change: impl FnOnce(&mut SourceDefinition),
    ) -> Result<(), EngineError> {
        let name = name.trim();
        let _writer = self.writer.lock().await;
        let mut def = self
            .mirror
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(name))?;
        change(&mut def);
        self.store
            .put(&def)
            .await
            .map_err(|e| e.for_source(name))?;
        self.mirror.write().await.insert(def.name.clone(), def);
        Ok(())
    }

    fn not_found(&self, name: &str) -> EngineError {
        EngineError::not_found(Stage::Registry, format!("source {name:?}")).for_source(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::store::MemoryStore;
    use crate::source::normalize::split_batch;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn registry() -> SourceRegistry {
        SourceRegistry::open(Arc::new(MemoryStore::new()), BTreeMap::new())
            .await
            .unwrap()
    }

    fn def(name: &str, group: &str) -> SourceDefinition {
        let mut d = SourceDefinition::new(name, format!("https://{}.example/", name.to_lowercase()));
        d.group = group.to_string();
        d
    }

    #[tokio::test]
    async fn created_then_updated() {
        let reg = registry().await;
        assert_eq!(reg.add_or_update(def("A", "")).await.unwrap(), Upsert::Created);
        assert_eq!(reg.add_or_update(def("A", "x")).await.unwrap(), Upsert::Updated);
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.get("A").await.unwrap().group, "x");
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let reg = registry().await;
        let err = reg.add_or_update(def("  ", "")).await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn groups_are_sorted_and_distinct() {
        let reg = registry().await;
        reg.add_or_update(def("A", "b, a")).await.unwrap();
        reg.add_or_update(def("B", "a;c")).await.unwrap();
        reg.add_or_update(def("C", "")).await.unwrap();
        assert_eq!(reg.groups().await, vec!["a", "b", "c"]);
        let names: Vec<String> = reg.by_group("a").await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn set_enabled_and_delete_unknown_is_not_found() {
        let reg = registry().await;
        reg.add_or_update(def("A", "")).await.unwrap();
        reg.set_enabled("A", false).await.unwrap();
        assert!(reg.enabled().await.is_empty());
        assert!(reg.set_enabled("missing", true).await.unwrap_err().is_not_found());
        assert!(reg.delete("missing").await.unwrap_err().is_not_found());
        reg.delete("A").await.unwrap();
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn record_usage_survives_rule_update() {
        let reg = registry().await;
        reg.add_or_update(def("A", "")).await.unwrap();
        reg.record_usage("A").await.unwrap();
        reg.record_usage("A").await.unwrap();
        reg.add_or_update(def("A", "new")).await.unwrap();
        let stored = reg.get("A").await.unwrap();
        assert_eq!(stored.stats.count, 2);
        assert!(stored.stats.last_used.is_some());
    }

    async fn import_all(reg: &SourceRegistry, json: &str) -> Vec<Result<(String, Upsert), EngineError>> {
        let mut outcomes = Vec::new();
        for item in split_batch(json).unwrap() {
            outcomes.push(reg.add_or_update_value(&item).await);
        }
        outcomes
    }

    #[tokio::test]
    async fn batch_items_upsert_independently() {
        let reg = registry().await;
        let payload = json!([
            {"name": "A", "url": "https://a.example/"},
            {"url": "https://nameless.example/"},
            {"bookSourceName": "A", "bookSourceUrl": "https://a2.example/"}
        ])
        .to_string();
        let outcomes = import_all(&reg, &payload).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].as_ref().unwrap().1, Upsert::Created);
        assert!(outcomes[1].as_ref().unwrap_err().is_config());
        assert_eq!(outcomes[2].as_ref().unwrap().1, Upsert::Updated);
        assert_eq!(reg.get("A").await.unwrap().url, "https://a2.example/");
    }

    #[tokio::test]
    async fn export_then_import_reproduces_registry() {
        let reg = registry().await;
        let mut a = def("A", "g1");
        a.search.url = Some("https://a.example/s?q={keyword}".into());
        a.content.filters = vec!["ad".into()];
        reg.add_or_update(a).await.unwrap();
        reg.add_or_update(def("B", "g2")).await.unwrap();
        reg.record_usage("B").await.unwrap();

        let exported = reg.export_json().await.unwrap();
        assert!(!exported.contains("\"stats\""));

        let copy = registry().await;
        assert!(import_all(&copy, &exported).await.iter().all(Result::is_ok));
        let strip = |defs: Vec<SourceDefinition>| -> Vec<SourceDefinition> {
            defs.iter().map(SourceDefinition::without_stats).collect()
        };
        assert_eq!(strip(copy.list().await), strip(reg.list().await));
    }

    #[tokio::test]
    async fn raw_json_is_patched_on_the_way_in() {
        let mut aliases = BTreeMap::new();
        aliases.insert("old.example".to_string(), "new.example".to_string());
        let reg = SourceRegistry::open(Arc::new(MemoryStore::new()), aliases)
            .await
            .unwrap();
        let (name, _) = reg
            .add_or_update_raw(r#"{"name":"P","url":"https://old.example/","search":{"url":"https://old.example/s?k={{key}}"}}"#)
            .await
            .unwrap();
        let stored = reg.get(&name).await.unwrap();
        assert_eq!(stored.url, "https://new.example/");
        assert_eq!(
            stored.search.url.as_deref(),
            Some("https://new.example/s?k={keyword}")
        );
    }
}
