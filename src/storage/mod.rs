//! Storage abstraction.
//!
//! Six namespaces with the same small interface. Like the router, `Storage`
//! is dual-mode: `Storage::local` executes against a [`LocalStorage`] in this
//! context, `Storage::bridged` ships each operation as a
//! [`StorageCommand`] to the context that owns the data.

mod backend;
mod cache;
mod records;

pub use backend::{KvStore, Namespace, Record};
pub use cache::CacheEntry;
pub use records::{ChatRecord, FileRecord};

use crate::bridge::{BridgeClient, Command};
use crate::error::AssistantError;
use crate::scope::ExecutionScope;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A storage operation, as sent across the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageCommand {
    Save {
        namespace: Namespace,
        key: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_seconds: Option<u64>,
    },
    Load {
        namespace: Namespace,
        key: String,
    },
    LoadRecord {
        namespace: Namespace,
        key: String,
    },
    Exists {
        namespace: Namespace,
        key: String,
    },
    Remove {
        namespace: Namespace,
        key: String,
    },
    GetAll {
        namespace: Namespace,
    },
    Clear {
        namespace: Namespace,
    },
    CleanupExpired,
}

/// Storage owned by this context.
pub struct LocalStorage {
    store: KvStore,
}

impl LocalStorage {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(KvStore::in_memory())
    }

    /// Execute one operation. Results are JSON so they can cross the bridge
    /// unchanged: `load` yields the value or `null`, `exists`/`remove` a
    /// bool, `get_all` an object keyed by record key, `clear` and
    /// `cleanup_expired` the number of removed entries.
    pub fn execute(&self, command: StorageCommand) -> Result<Value, AssistantError> {
        match command {
            StorageCommand::Save {
                namespace,
                key,
                value,
                ttl_seconds,
            } => {
                let value = match (namespace, ttl_seconds) {
                    (Namespace::Cache, ttl) => serde_json::to_value(CacheEntry::new(value, ttl, Utc::now()))?,
                    (_, None) => value,
                    (_, Some(_)) => {
                        return Err(AssistantError::storage(format!(
                            "expiry is only supported in the cache namespace, not {}",
                            namespace
                        )))
                    }
                };
                self.store.put(namespace, &key, value)?;
                Ok(Value::Null)
            }
            StorageCommand::Load { namespace, key } => Ok(self
                .live_record(namespace, &key)?
                .map(|r| r.value)
                .unwrap_or(Value::Null)),
            StorageCommand::LoadRecord { namespace, key } => {
                Ok(serde_json::to_value(self.live_record(namespace, &key)?)?)
            }
            StorageCommand::Exists { namespace, key } => {
                Ok(Value::Bool(self.live_record(namespace, &key)?.is_some()))
            }
            StorageCommand::Remove { namespace, key } => Ok(Value::Bool(self.store.delete(namespace, &key)?)),
            StorageCommand::GetAll { namespace } => {
                let now = Utc::now();
                let mut out = Map::new();
                for record in self.store.all(namespace) {
                    let value = if namespace == Namespace::Cache {
                        let entry = CacheEntry::from_stored(record.value);
                        if entry.is_expired(now) {
                            continue;
                        }
                        entry.value
                    } else {
                        record.value
                    };
                    out.insert(record.key, value);
                }
                Ok(Value::Object(out))
            }
            StorageCommand::Clear { namespace } => Ok(Value::from(self.store.clear(namespace)?)),
            StorageCommand::CleanupExpired => {
                let now = Utc::now();
                let removed = self.store.delete_where(Namespace::Cache, |record| {
                    CacheEntry::from_stored(record.value.clone()).is_expired(now)
                })?;
                if removed > 0 {
                    log::info!("Storage: removed {} expired cache entries", removed);
                }
                Ok(Value::from(removed))
            }
        }
    }

    /// The record for a key, with cache entries unwrapped and expired ones
    /// removed on the way.
    fn live_record(&self, namespace: Namespace, key: &str) -> Result<Option<Record<Value>>, AssistantError> {
        let Some(record) = self.store.get(namespace, key) else {
            return Ok(None);
        };
        if namespace != Namespace::Cache {
            return Ok(Some(record));
        }

        let entry = CacheEntry::from_stored(record.value);
        if entry.is_expired(Utc::now()) {
            log::debug!("Storage: cache entry '{}' expired", key);
            self.store.delete(namespace, key)?;
            return Ok(None);
        }
        Ok(Some(Record {
            key: record.key,
            value: entry.value,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }))
    }
}

/// Dual-mode storage front end.
#[derive(Clone)]
pub enum Storage {
    Local(Arc<LocalStorage>),
    Bridged { client: BridgeClient, scope: ExecutionScope },
}

impl Storage {
    pub fn local(storage: Arc<LocalStorage>) -> Self {
        Storage::Local(storage)
    }

    pub fn bridged(client: BridgeClient, scope: ExecutionScope) -> Self {
        Storage::Bridged { client, scope }
    }

    pub async fn execute(&self, command: StorageCommand) -> Result<Value, AssistantError> {
        match self {
            Storage::Local(local) => local.execute(command),
            Storage::Bridged { client, scope } => client.call(*scope, Command::Storage(command)).await,
        }
    }

    pub fn namespace(&self, namespace: Namespace) -> NamespaceHandle<'_> {
        NamespaceHandle {
            storage: self,
            namespace,
        }
    }

    pub fn config(&self) -> NamespaceHandle<'_> {
        self.namespace(Namespace::Config)
    }

    pub fn settings(&self) -> NamespaceHandle<'_> {
        self.namespace(Namespace::Settings)
    }

    pub fn chat(&self) -> NamespaceHandle<'_> {
        self.namespace(Namespace::Chat)
    }

    pub fn files(&self) -> NamespaceHandle<'_> {
        self.namespace(Namespace::Files)
    }

    pub fn data(&self) -> NamespaceHandle<'_> {
        self.namespace(Namespace::Data)
    }

    pub fn cache(&self) -> CacheHandle<'_> {
        CacheHandle {
            inner: self.namespace(Namespace::Cache),
        }
    }
}

/// Typed access to one namespace.
#[derive(Clone, Copy)]
pub struct NamespaceHandle<'a> {
    storage: &'a Storage,
    namespace: Namespace,
}

impl NamespaceHandle<'_> {
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), AssistantError> {
        self.storage
            .execute(StorageCommand::Save {
                namespace: self.namespace,
                key: key.to_string(),
                value: serde_json::to_value(value)?,
                ttl_seconds: None,
            })
            .await
            .map(|_| ())
    }

    /// Load a value; a missing key (or a stored `null`) is `None`.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AssistantError> {
        let value = self
            .storage
            .execute(StorageCommand::Load {
                namespace: self.namespace,
                key: key.to_string(),
            })
            .await?;
        decode(value)
    }

    pub async fn load_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Record<T>>, AssistantError> {
        let value = self
            .storage
            .execute(StorageCommand::LoadRecord {
                namespace: self.namespace,
                key: key.to_string(),
            })
            .await?;
        decode(value)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, AssistantError> {
        let value = self
            .storage
            .execute(StorageCommand::Exists {
                namespace: self.namespace,
                key: key.to_string(),
            })
            .await?;
        decode(value)
    }

    pub async fn remove(&self, key: &str) -> Result<bool, AssistantError> {
        let value = self
            .storage
            .execute(StorageCommand::Remove {
                namespace: self.namespace,
                key: key.to_string(),
            })
            .await?;
        decode(value)
    }

    pub async fn get_all<T: DeserializeOwned>(&self) -> Result<BTreeMap<String, T>, AssistantError> {
        let value = self
            .storage
            .execute(StorageCommand::GetAll {
                namespace: self.namespace,
            })
            .await?;
        decode(value)
    }

    pub async fn clear(&self) -> Result<usize, AssistantError> {
        let value = self
            .storage
            .execute(StorageCommand::Clear {
                namespace: self.namespace,
            })
            .await?;
        decode(value)
    }
}

/// The cache namespace, with expiry.
#[derive(Clone, Copy)]
pub struct CacheHandle<'a> {
    inner: NamespaceHandle<'a>,
}

impl CacheHandle<'_> {
    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), AssistantError> {
        self.inner.save(key, value).await
    }

    /// Save a value that expires `ttl_seconds` from now.
    pub async fn save_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: u64,
    ) -> Result<(), AssistantError> {
        self.inner
            .storage
            .execute(StorageCommand::Save {
                namespace: Namespace::Cache,
                key: key.to_string(),
                value: serde_json::to_value(value)?,
                ttl_seconds: Some(ttl_seconds),
            })
            .await
            .map(|_| ())
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AssistantError> {
        self.inner.load(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, AssistantError> {
        self.inner.exists(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, AssistantError> {
        self.inner.remove(key).await
    }

    pub async fn get_all<T: DeserializeOwned>(&self) -> Result<BTreeMap<String, T>, AssistantError> {
        self.inner.get_all().await
    }

    pub async fn clear(&self) -> Result<usize, AssistantError> {
        self.inner.clear().await
    }

    /// Remove every expired entry, returning how many were removed.
    pub async fn cleanup_expired(&self) -> Result<usize, AssistantError> {
        let value = self.inner.storage.execute(StorageCommand::CleanupExpired).await?;
        decode(value)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, AssistantError> {
    serde_json::from_value(value).map_err(|e| AssistantError::storage(format!("unexpected stored value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> Storage {
        Storage::local(Arc::new(LocalStorage::in_memory()))
    }

    #[tokio::test]
    async fn test_namespace_operations() {
        let storage = storage();
        let settings = storage.settings();

        settings.save("volume", &7u32).await.unwrap();
        assert_eq!(settings.load::<u32>("volume").await.unwrap(), Some(7));
        assert!(settings.exists("volume").await.unwrap());
        assert_eq!(settings.load::<u32>("missing").await.unwrap(), None);

        settings.save("muted", &false).await.unwrap();
        let all: BTreeMap<String, Value> = settings.get_all().await.unwrap();
        assert_eq!(all.len(), 2);

        assert!(settings.remove("volume").await.unwrap());
        assert!(!settings.remove("volume").await.unwrap());
        assert_eq!(settings.clear().await.unwrap(), 1);
        assert!(storage.data().get_all::<Value>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_envelope() {
        let storage = storage();
        storage.data().save("k", &json!({"x": 1})).await.unwrap();
        let record = storage.data().load_record::<Value>("k").await.unwrap().unwrap();
        assert_eq!(record.key, "k");
        assert_eq!(record.value, json!({"x": 1}));
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let storage = storage();
        let cache = storage.cache();
        cache.save_with_ttl("gone", "v", 0).await.unwrap();
        cache.save_with_ttl("kept", "v", 3600).await.unwrap();
        cache.save("forever", "v").await.unwrap();

        let all: BTreeMap<String, String> = cache.get_all().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["forever", "kept"]);

        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert_eq!(cache.load::<String>("kept").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_expired_entry_removed_on_load() {
        let local = Arc::new(LocalStorage::in_memory());
        let storage = Storage::local(local.clone());
        storage.cache().save_with_ttl("k", &1, 0).await.unwrap();

        assert_eq!(storage.cache().load::<i32>("k").await.unwrap(), None);
        // already gone, nothing left to sweep
        assert_eq!(storage.cache().cleanup_expired().await.unwrap(), 0);
        assert!(!local.store.contains(Namespace::Cache, "k"));
    }

    #[tokio::test]
    async fn test_ttl_outside_cache_is_rejected() {
        let err = storage()
            .execute(StorageCommand::Save {
                namespace: Namespace::Data,
                key: "k".to_string(),
                value: json!(1),
                ttl_seconds: Some(5),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "storage");
    }

    #[test]
    fn test_command_wire_shape() {
        let command = StorageCommand::Exists {
            namespace: Namespace::Chat,
            key: "c1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({"op": "exists", "namespace": "chat", "key": "c1"})
        );
    }
}
