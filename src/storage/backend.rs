//! Embedded JSON document store.
//!
//! One JSON file per namespace under a data directory (or nothing on disk for
//! an in-memory store). Every mutation rewrites the namespace file through a
//! temp file + rename so a crash never leaves a half-written document.

use crate::error::AssistantError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Config,
    Settings,
    Cache,
    Chat,
    Files,
    Data,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Config,
        Namespace::Settings,
        Namespace::Cache,
        Namespace::Chat,
        Namespace::Files,
        Namespace::Data,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Config => "config",
            Namespace::Settings => "settings",
            Namespace::Cache => "cache",
            Namespace::Chat => "chat",
            Namespace::Files => "files",
            Namespace::Data => "data",
        }
    }

    fn file_name(self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub key: String,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type Documents = BTreeMap<String, Record<Value>>;

pub struct KvStore {
    dir: Option<PathBuf>,
    namespaces: RwLock<HashMap<Namespace, Documents>>,
}

impl KvStore {
    /// Open (or create) a store under `dir`, loading existing namespace files.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AssistantError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            AssistantError::storage(format!("Failed to create data dir {}: {}", dir.display(), e))
        })?;

        let mut namespaces = HashMap::new();
        for namespace in Namespace::ALL {
            if let Some(docs) = Self::load_from_file(&dir.join(namespace.file_name())) {
                namespaces.insert(namespace, docs);
            }
        }
        log::info!("Storage: opened {}", dir.display());

        Ok(Self {
            dir: Some(dir),
            namespaces: RwLock::new(namespaces),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn load_from_file(path: &Path) -> Option<Documents> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(docs) => Some(docs),
            Err(e) => {
                log::warn!("Storage: ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Namespace, Documents>> {
        self.namespaces.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Namespace, Documents>> {
        self.namespaces.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, namespace: Namespace, docs: &Documents) -> Result<(), AssistantError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(docs)
            .map_err(|e| AssistantError::storage(format!("Failed to serialize {}: {}", namespace, e)))?;

        let path = dir.join(namespace.file_name());
        let tmp = dir.join(format!("{}.tmp", namespace.file_name()));
        fs::write(&tmp, content)
            .map_err(|e| AssistantError::storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| AssistantError::storage(format!("Failed to replace {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Insert or overwrite a value. `created_at` survives overwrites.
    pub fn put(&self, namespace: Namespace, key: &str, value: Value) -> Result<Record<Value>, AssistantError> {
        if key.is_empty() {
            return Err(AssistantError::storage("key must not be empty"));
        }
        let now = Utc::now();
        let mut namespaces = self.write();
        let docs = namespaces.entry(namespace).or_default();
        let created_at = docs.get(key).map(|r| r.created_at).unwrap_or(now);
        let record = Record {
            key: key.to_string(),
            value,
            created_at,
            updated_at: now,
        };
        docs.insert(key.to_string(), record.clone());
        self.persist(namespace, docs)?;
        Ok(record)
    }

    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Record<Value>> {
        self.read().get(&namespace).and_then(|docs| docs.get(key)).cloned()
    }

    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        self.read()
            .get(&namespace)
            .is_some_and(|docs| docs.contains_key(key))
    }

    pub fn delete(&self, namespace: Namespace, key: &str) -> Result<bool, AssistantError> {
        self.delete_where(namespace, |record| record.key == key)
            .map(|removed| removed > 0)
    }

    /// Remove every record matching `pred`, returning how many were removed.
    pub fn delete_where<F>(&self, namespace: Namespace, pred: F) -> Result<usize, AssistantError>
    where
        F: Fn(&Record<Value>) -> bool,
    {
        let mut namespaces = self.write();
        let Some(docs) = namespaces.get_mut(&namespace) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, record| !pred(record));
        let removed = before - docs.len();
        if removed > 0 {
            self.persist(namespace, docs)?;
        }
        Ok(removed)
    }

    /// All records of a namespace, ordered by key.
    pub fn all(&self, namespace: Namespace) -> Vec<Record<Value>> {
        self.read()
            .get(&namespace)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, namespace: Namespace) -> Result<usize, AssistantError> {
        self.delete_where(namespace, |_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KvStore::open(dir.path()).unwrap();
            store.put(Namespace::Settings, "theme", json!("dark")).unwrap();
            store.put(Namespace::Data, "n", json!(3)).unwrap();
        }

        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(Namespace::Settings, "theme").unwrap().value, json!("dark"));
        assert_eq!(store.get(Namespace::Data, "n").unwrap().value, json!(3));
        assert!(dir.path().join("settings.json").exists());
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn test_overwrite_keeps_created_at() {
        let store = KvStore::in_memory();
        let first = store.put(Namespace::Data, "k", json!(1)).unwrap();
        let second = store.put(Namespace::Data, "k", json!(2)).unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.get(Namespace::Data, "k").unwrap().value, json!(2));
    }

    #[test]
    fn test_namespaces_are_separate() {
        let store = KvStore::in_memory();
        store.put(Namespace::Chat, "a", json!(1)).unwrap();
        store.put(Namespace::Files, "a", json!(2)).unwrap();

        assert_eq!(store.clear(Namespace::Chat).unwrap(), 1);
        assert!(!store.contains(Namespace::Chat, "a"));
        assert!(store.contains(Namespace::Files, "a"));
        assert!(!store.delete(Namespace::Chat, "a").unwrap());
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.json"), "{ not json").unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        assert!(store.all(Namespace::Data).is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = KvStore::in_memory();
        assert!(store.put(Namespace::Data, "", json!(null)).is_err());
    }
}
