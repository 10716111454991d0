// ABOUTME: Persistence backends for source definitions behind the async SourceStore trait.
// ABOUTME: MemoryStore keeps everything in process; JsonFileStore writes a JSON array atomically via rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::EngineError;
use crate::source::SourceDefinition;

/// Durable storage for source definitions, keyed by name.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Loads every stored definition.
    async fn load_all(&self) -> Result<Vec<SourceDefinition>, EngineError>;

    /// Inserts or replaces the definition with the same name.
    async fn put(&self, def: &SourceDefinition) -> Result<(), EngineError>;

    /// Removes a definition, returning whether it existed.
    async fn remove(&self, name: &str) -> Result<bool, EngineError>;
}

/// In-process store, mostly for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, SourceDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<SourceDefinition>, EngineError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }

    async fn put(&self, def: &SourceDefinition) -> Result<(), EngineError> {
        self.rows.lock().await.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.rows.lock().await.remove(name).is_some())
    }
}

/// Stores all definitions as one JSON array on disk.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so a crash never leaves a half-written file behind.
pub struct JsonFileStore {
    path: PathBuf,
    rows: Mutex<Option<BTreeMap<String, SourceDefinition>>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rows: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<BTreeMap<String, SourceDefinition>, EngineError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(EngineError::storage(e).at_url(self.path.display().to_string())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        let defs: Vec<SourceDefinition> = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::storage(e)
                .message("source store file is not a JSON array of definitions")
                .at_url(self.path.display().to_string())
        })?;
        Ok(defs.into_iter().map(|d| (d.name.clone(), d)).collect())
    }

    async fn write_file(&self, rows: &BTreeMap<String, SourceDefinition>) -> Result<(), EngineError> {
        let defs: Vec<&SourceDefinition> = rows.values().collect();
        let json = serde_json::to_vec_pretty(&defs).map_err(EngineError::storage)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(EngineError::storage)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| EngineError::storage(e).at_url(tmp.display().to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| EngineError::storage(e).at_url(self.path.display().to_string()))?;
        debug!(path = %self.path.display(), count = defs.len(), "wrote source store");
        Ok(())
    }
}

#[async_trait]
impl SourceStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<SourceDefinition>, EngineError> {
        let mut guard = self.rows.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        Ok(guard
            .as_ref()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, def: &SourceDefinition) -> Result<(), EngineError> {
        let mut guard = self.rows.lock().await;
        let mut rows = match guard.take() {
            Some(rows) => rows,
            None => self.read_file().await?,
        };
        rows.insert(def.name.clone(), def.clone());
        // On failure the cached rows are dropped so the next call rereads the file.
        self.write_file(&rows).await?;
        *guard = Some(rows);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, EngineError> {
        let mut guard = self.rows.lock().await;
        let mut rows = match guard.take() {
            Some(rows) => rows,
            None => self.read_file().await?,
        };
        let existed = rows.remove(name).is_some();
        if existed {
            self.write_file(&rows).await?;
        }
        *guard = Some(rows);
        Ok(existed)
    }
}
