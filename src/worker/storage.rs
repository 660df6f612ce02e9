//! Persistent-storage collaborators for the worker lifecycle.
//!
//! `FileStorage` keeps a JSON file per extension and writes through on every
//! change. `MemoryStorage` is shared between clones and used in tests and
//! one-off sessions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{CrxError, CrxResult};

/// Key-value store that outlives the worker.
pub trait PersistentStorage: Send {
    fn get(&self, key: &str) -> CrxResult<Option<Value>>;

    /// Store `value`. The write is durable when this returns.
    fn set(&mut self, key: &str, value: Value) -> CrxResult<()>;
}

impl<S: PersistentStorage + ?Sized> PersistentStorage for Box<S> {
    fn get(&self, key: &str) -> CrxResult<Option<Value>> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: Value) -> CrxResult<()> {
        (**self).set(key, value)
    }
}

/// Storage backed by a JSON file.
///
/// Data is cached in memory and written to disk on modification.
pub struct FileStorage {
    /// Path to the storage file.
    path: PathBuf,
    cache: HashMap<String, Value>,
}

impl FileStorage {
    /// Open `<dir>/<name>.json`, loading it if present.
    ///
    /// An unreadable or corrupt file starts empty, like a cold install.
    pub fn open(dir: &Path, name: &str) -> Self {
        let path = dir.join(format!("{}.json", sanitize(name)));

        let cache = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Discarding corrupt worker state {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self { path, cache }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(&mut self, key: &str) -> CrxResult<()> {
        if self.cache.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    fn flush(&self) -> CrxResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CrxError::Storage(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let contents = serde_json::to_string_pretty(&self.cache)?;
        fs::write(&self.path, contents).map_err(|e| {
            CrxError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

impl PersistentStorage for FileStorage {
    fn get(&self, key: &str) -> CrxResult<Option<Value>> {
        Ok(self.cache.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> CrxResult<()> {
        self.cache.insert(key.to_string(), value);
        self.flush()
    }
}

/// In-memory storage. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStorage for MemoryStorage {
    fn get(&self, key: &str) -> CrxResult<Option<Value>> {
        let map = self
            .inner
            .lock()
            .map_err(|_| CrxError::Storage("memory storage poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> CrxResult<()> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| CrxError::Storage("memory storage poisoned".into()))?;
        map.insert(key.to_string(), value);
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "extension".to_string()
    } else {
        cleaned
    }
}
