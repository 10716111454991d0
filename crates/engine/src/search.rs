// ABOUTME: Fan-out search across many sources under one aggregate timeout, merged and deduplicated.
// ABOUTME: Per-source failures are logged and contribute nothing; the aggregate timeout fails the whole call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::parser::cache::ParserCache;
use crate::parser::SearchResult;
use crate::registry::SourceRegistry;
use crate::source::SourceDefinition;

/// Per-call search options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Source names to query; empty means every enabled source.
    pub sources: Vec<String>,
    /// Aggregate timeout; the engine default when `None`.
    pub timeout: Option<Duration>,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, name: impl Into<String>) -> Self {
        self.sources.push(name.into());
        self
    }

    pub fn sources<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct SearchOrchestrator {
    registry: Arc<SourceRegistry>,
    parsers: Arc<ParserCache>,
    max_concurrent: usize,
    default_timeout: Duration,
}

impl SearchOrchestrator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        parsers: Arc<ParserCache>,
        max_concurrent: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            parsers,
            max_concurrent: max_concurrent.max(1),
            default_timeout,
        }
    }

    /// Searches every selected source concurrently and merges the results.
    ///
    /// Results keep source order, then page order. Duplicates by
    /// case-insensitive `(name, author)` keep their first occurrence. If the
    /// aggregate timeout fires before every source finishes, the call fails
    /// with `AggregateTimeout` and no partial results are returned.
    pub async fn search(
        &self,
        keyword: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, EngineError> {
        let targets = self.resolve_targets(&opts.sources).await;
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        info!(keyword, sources = targets.len(), timeout_ms = timeout.as_millis() as u64, "starting search");
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let per_source = stream::iter(targets)
            .map(|def| self.search_one(def, keyword))
            .buffered(self.max_concurrent)
            .collect::<Vec<_>>();

        let per_source = tokio::time::timeout(timeout, per_source)
            .await
            .map_err(|_| {
                warn!(keyword, timeout_ms = timeout.as_millis() as u64, "search aggregate timeout");
                EngineError::aggregate_timeout(timeout)
            })?;

        // Usage is recorded outside the deadline.
        let mut answered = Vec::new();
        let mut pages = Vec::with_capacity(per_source.len());
        for (name, outcome) in per_source {
            if let Some(results) = outcome {
                answered.push(name);
                pages.push(results);
            }
        }
        for name in &answered {
            if let Err(e) = self.registry.record_usage(name).await {
                warn!(source = %name, error = %e, "failed to record source usage");
            }
        }

        let merged = merge_results(pages);
        info!(keyword, results = merged.len(), "search finished");
        Ok(merged)
    }

    /// Runs one source; `None` when it failed.
    async fn search_one(
        &self,
        def: SourceDefinition,
        keyword: &str,
    ) -> (String, Option<Vec<SearchResult>>) {
        let parser = self.parsers.get(&def);
        match parser.search(keyword).await {
            Ok(results) => {
                debug!(source = %def.name, results = results.len(), "source search succeeded");
                (def.name, Some(results))
            }
            Err(e) => {
                warn!(source = %def.name, error = %e, "source search failed");
                (def.name, None)
            }
        }
    }

    /// All enabled sources when `names` is empty; otherwise the named ones that exist.
    async fn resolve_targets(&self, names: &[String]) -> Vec<SourceDefinition> {
        if names.is_empty() {
            return self.registry.enabled().await;
        }
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            if !seen.insert(name.to_string()) {
                continue;
            }
            match self.registry.get(name).await {
                Some(def) => targets.push(def),
                None => warn!(source = name, "unknown source skipped"),
            }
        }
        targets
    }
}

/// Concatenates per-source results, dropping later duplicates.
pub fn merge_results(per_source: Vec<Vec<SearchResult>>) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    per_source
        .into_iter()
        .flatten()
        .filter(|r| seen.insert((r.name.trim().to_lowercase(), r.author.trim().to_lowercase())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DnsMode, EngineOptions};
    use crate::parser::ParserSettings;
    use crate::registry::store::{MemoryStore, SourceStore};
    use crate::resource::Fetcher;
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    /// Memory store whose writes of usage stats are slow.
    struct SlowUsageStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl SourceStore for SlowUsageStore {
        async fn load_all(&self) -> Result<Vec<SourceDefinition>, EngineError> {
            self.inner.load_all().await
        }

        async fn put(&self, def: &SourceDefinition) -> Result<(), EngineError> {
            if !def.stats.is_empty() {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            self.inner.put(def).await
        }

        async fn remove(&self, name: &str) -> Result<bool, EngineError> {
            self.inner.remove(name).await
        }
    }

    fn source(name: &str, server: &MockServer, path: &str) -> SourceDefinition {
        let mut def = SourceDefinition::new(name, server.base_url());
        def.search.url = Some(format!("{path}?q={{keyword}}"));
        def.search.list = Some("li".into());
        def.search.name = Some("a@text".into());
        def.search.book_url = Some("a@href".into());
        def
    }

    fn result(source: &str, name: &str, author: &str) -> SearchResult {
        SearchResult {
            source_name: source.into(),
            name: name.into(),
            author: author.into(),
            kind: None,
            cover: None,
            intro: None,
            book_url: format!("https://{source}.example/{name}"),
        }
    }

    #[test]
    fn merge_keeps_first_occurrence() {
        let merged = merge_results(vec![
            vec![result("a", "Dune", "Herbert"), result("a", "Emma", "Austen")],
            vec![],
            vec![result("b", "DUNE", "herbert "), result("b", "Dune", "Other")],
        ]);
        let keys: Vec<(&str, &str)> = merged
            .iter()
            .map(|r| (r.source_name.as_str(), r.name.as_str()))
            .collect();
        assert_eq!(keys, vec![("a", "Dune"), ("a", "Emma"), ("b", "Dune")]);
        assert_eq!(merged[2].author, "Other");
    }

    #[test]
    fn options_builder() {
        let opts = SearchOptions::new()
            .source("A")
            .sources(["B", "C"])
            .timeout(Duration::from_millis(200));
        assert_eq!(opts.sources, vec!["A", "B", "C"]);
        assert_eq!(opts.timeout, Some(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn usage_bookkeeping_does_not_count_against_the_deadline() {
        let server = MockServer::start_async().await;
        for (path, book) in [("/a", "Alpha"), ("/b", "Beta")] {
            server.mock(|when, then| {
                when.method(GET).path(path);
                then.status(200)
                    .header("content-type", "text/html; charset=utf-8")
                    .body(format!(r#"<ul><li><a href="/book/{book}">{book}</a></li></ul>"#));
            });
        }

        let store: Arc<dyn SourceStore> = Arc::new(SlowUsageStore {
            inner: MemoryStore::new(),
        });
        let registry = Arc::new(SourceRegistry::open(store, BTreeMap::new()).await.unwrap());
        registry.add_or_update(source("A", &server, "/a")).await.unwrap();
        registry.add_or_update(source("B", &server, "/b")).await.unwrap();

        let opts = EngineOptions {
            dns: DnsMode::System,
            ..EngineOptions::default()
        };
        let parsers = Arc::new(ParserCache::new(
            Arc::new(Fetcher::new(&opts).unwrap()),
            ParserSettings {
                allow_loopback: true,
                ..ParserSettings::default()
            },
        ));
        let orchestrator = SearchOrchestrator::new(
            Arc::clone(&registry),
            parsers,
            4,
            Duration::from_millis(250),
        );

        let results = orchestrator
            .search("zzz", &SearchOptions::new())
            .await
            .unwrap();
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
        assert_eq!(registry.get("A").await.unwrap().stats.count, 1);
        assert_eq!(registry.get("B").await.unwrap().stats.count, 1);
    }
}
