// ABOUTME: The Engine facade: owns the registry, parser cache, search orchestrator and task tracker.
// ABOUTME: Exposes source management, fan-out search, detail/chapter/content fetching and background jobs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{EngineError, Stage};
use crate::options::{EngineBuilder, EngineOptions};
use crate::parser::cache::ParserCache;
use crate::parser::{BookDetail, Chapter, ChapterContent, ParserSettings, SearchResult, SourceParser};
use crate::registry::store::SourceStore;
use crate::registry::{SourceRegistry, Upsert};
use crate::resource::Fetcher;
use crate::search::{SearchOptions, SearchOrchestrator};
use crate::source::normalize::split_batch;
use crate::source::SourceDefinition;
use crate::tasks::{ImportTask, ImportTaskTracker, ItemReport, TaskKind};

/// The book-source engine.
///
/// Create one with [`Engine::builder`]. Dropping the engine stops its
/// background task reaper.
pub struct Engine {
    registry: Arc<SourceRegistry>,
    parsers: Arc<ParserCache>,
    orchestrator: SearchOrchestrator,
    tasks: ImportTaskTracker,
    shutdown: Arc<Notify>,
}

impl Engine {
    /// Create a new EngineBuilder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) async fn new(
        opts: EngineOptions,
        store: Arc<dyn SourceStore>,
    ) -> Result<Self, EngineError> {
        let fetcher = Arc::new(Fetcher::new(&opts)?);
        let registry = Arc::new(SourceRegistry::open(store, opts.domain_aliases.clone()).await?);
        let parsers = Arc::new(ParserCache::new(
            fetcher,
            ParserSettings {
                allow_loopback: opts.allow_loopback,
                domain_aliases: Arc::new(opts.domain_aliases.clone()),
            },
        ));
        let orchestrator = SearchOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&parsers),
            opts.max_concurrent_sources,
            opts.search_timeout,
        );
        let tasks = ImportTaskTracker::new(
            opts.max_concurrent_sources,
            opts.task_log_cap,
            opts.task_retention,
        );
        let shutdown = Arc::new(Notify::new());
        tasks.spawn_reaper(opts.reaper_interval, Arc::clone(&shutdown));

        Ok(Self {
            registry,
            parsers,
            orchestrator,
            tasks,
            shutdown,
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    // --- source management ---

    pub async fn list_sources(&self) -> Vec<SourceDefinition> {
        self.registry.list().await
    }

    pub async fn list_groups(&self) -> Vec<String> {
        self.registry.groups().await
    }

    pub async fn get_by_group(&self, group: &str) -> Vec<SourceDefinition> {
        self.registry.by_group(group).await
    }

    pub async fn get_by_name(&self, name: &str) -> Option<SourceDefinition> {
        self.registry.get(name).await
    }

    pub async fn add_or_update(&self, def: SourceDefinition) -> Result<Upsert, EngineError> {
        self.registry.add_or_update(def).await
    }

    /// Normalizes a JSON definition in any accepted shape and stores it.
    pub async fn add_or_update_raw(&self, json: &str) -> Result<(String, Upsert), EngineError> {
        self.registry.add_or_update_raw(json).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), EngineError> {
        self.registry.delete(name).await?;
        self.parsers.invalidate(name.trim());
        Ok(())
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        self.registry.set_enabled(name, enabled).await
    }

    /// JSON array of all definitions in canonical shape, without usage statistics.
    pub async fn export_sources(&self) -> Result<String, EngineError> {
        self.registry.export_json().await
    }

    // --- background jobs ---

    /// Starts importing one definition or an array of them; returns the task id.
    pub fn import_batch(&self, json: impl Into<String>) -> String {
        let json = json.into();
        let registry = Arc::clone(&self.registry);
        self.tasks.submit(
            TaskKind::Import,
            async move { split_batch(&json) },
            move |_, value: Value| {
                let registry = Arc::clone(&registry);
                async move {
                    match registry.add_or_update_value(&value).await {
                        Ok((name, upsert)) => ItemReport::success(Some(name), upsert.to_string()),
                        Err(e) => ItemReport::failure(name_hint(&value), e.to_string()),
                    }
                }
            },
        )
    }

    /// Snapshot of a task, or `None` for an unknown or reaped id.
    pub fn import_progress(&self, task_id: &str) -> Option<ImportTask> {
        self.tasks.get(task_id)
    }

    /// Waits for a task to reach a terminal state.
    pub async fn wait_for_task(&self, task_id: &str) -> Option<ImportTask> {
        self.tasks.wait(task_id, Duration::from_millis(50)).await
    }

    /// Starts a trial search on each named source (all enabled ones when empty).
    ///
    /// A source passes when the trial search returns at least one result.
    pub fn test_sources(&self, names: Vec<String>, keyword: impl Into<String>) -> String {
        let keyword = keyword.into();
        let registry = Arc::clone(&self.registry);
        let parsers = Arc::clone(&self.parsers);
        self.tasks.submit(
            TaskKind::Test,
            async move {
                if names.is_empty() {
                    let all: Vec<(String, Option<SourceDefinition>)> = registry
                        .enabled()
                        .await
                        .into_iter()
                        .map(|def| (def.name.clone(), Some(def)))
                        .collect();
                    return Ok::<_, EngineError>(all);
                }
                let mut items = Vec::with_capacity(names.len());
                for name in names {
                    let def = registry.get(&name).await;
                    items.push((name, def));
                }
                Ok::<_, EngineError>(items)
            },
            move |_, (name, def): (String, Option<SourceDefinition>)| {
                let parsers = Arc::clone(&parsers);
                let keyword = keyword.clone();
                async move {
                    let Some(def) = def else {
                        return ItemReport::failure(Some(name), "unknown source");
                    };
                    match parsers.get(&def).search(&keyword).await {
                        Ok(results) if !results.is_empty() => {
                            ItemReport::success(Some(name), format!("{} results", results.len()))
                        }
                        Ok(_) => ItemReport::failure(Some(name), "no results"),
                        Err(e) => ItemReport::failure(Some(name), e.to_string()),
                    }
                }
            },
        )
    }

    // --- crawling ---

    /// Searches the selected sources concurrently under one aggregate timeout.
    pub async fn search(
        &self,
        keyword: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, EngineError> {
        self.orchestrator.search(keyword, opts).await
    }

    pub async fn get_detail(&self, url: &str, source: &str) -> Result<BookDetail, EngineError> {
        self.parser_for(source, Stage::Detail).await?.detail(url).await
    }

    pub async fn get_chapters(&self, url: &str, source: &str) -> Result<Vec<Chapter>, EngineError> {
        self.parser_for(source, Stage::Chapters)
            .await?
            .chapters(url)
            .await
    }

    pub async fn get_chapter_content(
        &self,
        url: &str,
        source: &str,
    ) -> Result<ChapterContent, EngineError> {
        self.parser_for(source, Stage::Content)
            .await?
            .content(url)
            .await
    }

    async fn parser_for(&self, source: &str, stage: Stage) -> Result<Arc<SourceParser>, EngineError> {
        let def = self.registry.get(source).await.ok_or_else(|| {
            EngineError::not_found(stage, format!("source {:?}", source.trim())).for_source(source.trim())
        })?;
        debug!(source = %def.name, %stage, "resolved parser");
        Ok(self.parsers.get(&def))
    }

    /// Stops background work. Also happens on drop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Best-effort name of a raw definition for log lines about items that failed to import.
fn name_hint(value: &Value) -> Option<String> {
    ["name", "bookSourceName", "sourceName"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DnsMode;
    use crate::tasks::TaskStatus;
    use serde_json::json;

    async fn engine() -> Engine {
        Engine::builder().dns(DnsMode::System).build().await.unwrap()
    }

    #[test]
    fn name_hint_reads_any_shape() {
        assert_eq!(name_hint(&json!({"bookSourceName": " Old "})), Some("Old".into()));
        assert_eq!(name_hint(&json!({"url": "x"})), None);
        assert_eq!(name_hint(&json!(3)), None);
    }

    #[tokio::test]
    async fn import_batch_counts_valid_and_malformed() {
        let engine = engine().await;
        let payload = json!([
            {"name": "Good", "url": "https://good.example/"},
            {"url": "https://nameless.example/"}
        ])
        .to_string();
        let id = engine.import_batch(payload);
        let task = engine.wait_for_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!((task.total, task.success, task.failed), (2, 1, 1));
        assert!(engine.get_by_name("Good").await.is_some());
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let engine = engine().await;
        let err = engine
            .get_detail("https://x.example/b/1", "nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(engine.delete("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sources_reports_unknown_names() {
        let engine = engine().await;
        let id = engine.test_sources(vec!["ghost".into()], "dune");
        let task = engine.wait_for_task(&id).await.unwrap();
        assert_eq!(task.kind, TaskKind::Test);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.log[0].message, "unknown source");
    }
}
