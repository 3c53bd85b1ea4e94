use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::ErrorClass;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// Compile-time keys owned by the core.
    pub(crate) fn fixed(namespace: KeyNamespace, key: &'static str) -> Self {
        Self {
            namespace,
            key: key.to_string(),
        }
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Outbox,
    Emergency,
    Zones,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Emergency => "emergency",
            KeyNamespace::Zones => "zones",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={MAX_PREFIX_LENGTH} bytes"),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes, max {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl KvError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => {
                ErrorClass::InvariantViolation
            }
            KvError::Backend(_) => ErrorClass::LocalResource,
        }
    }
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Local durable storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
}

/// Process-local store. Durable only for as long as the snapshot is kept,
/// which is what the web shell and tests need.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a previous [`snapshot`](Self::snapshot).
    pub fn from_snapshot(values: HashMap<String, Vec<u8>>) -> Self {
        Self {
            values: Mutex::new(values),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.raw())
            .cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.raw(), value);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value_size, KeyValueStore, KvError, KvKey};
    use async_trait::async_trait;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex, PoisonError};

    /// SQLite-backed store for native shells.
    #[derive(Clone)]
    pub struct SqliteKvStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl std::fmt::Debug for SqliteKvStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteKvStore").finish_non_exhaustive()
        }
    }

    fn backend(e: impl std::fmt::Display) -> KvError {
        KvError::Backend(e.to_string())
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(backend)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(backend)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = FULL;
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(backend)?;

            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, KvError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
                f(&guard)
            })
            .await
            .map_err(backend)?
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![raw],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
                .map_err(backend)
            })
            .await
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            check_value_size(&value)?;
            let raw = key.raw();
            #[allow(clippy::cast_possible_wrap)]
            let now = crate::get_current_time_ms() as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO kv_entries (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    ",
                    params![raw, value, now],
                )
                .map(|_| ())
                .map_err(backend)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(KvKey::new(KeyNamespace::Outbox, "queue").is_ok());
        assert!(KvKey::new(KeyNamespace::Outbox, "").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "   ").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "../etc").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "a\0b").is_err());
        assert!(KvKey::new(KeyNamespace::Outbox, "x".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn raw_key_includes_namespace() {
        let key = KvKey::new(KeyNamespace::Emergency, "record").unwrap();
        assert_eq!(key.raw(), "emergency:record");

        let custom = KvKey::new(KeyNamespace::custom("app-cache").unwrap(), "x").unwrap();
        assert_eq!(custom.raw(), "app-cache:x");
        assert!(KeyNamespace::custom("bad prefix").is_err());
    }

    #[tokio::test]
    async fn memory_store_survives_snapshot_restore() {
        let key = KvKey::new(KeyNamespace::Outbox, "queue").unwrap();
        let store = MemoryKvStore::new();
        assert_eq!(store.get(&key).await.unwrap(), None);

        store.set(&key, vec![1, 2, 3]).await.unwrap();
        let restored = MemoryKvStore::from_snapshot(store.snapshot());
        assert_eq!(restored.get(&key).await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");
        let key = KvKey::new(KeyNamespace::Outbox, "queue").unwrap();

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.set(&key, b"first".to_vec()).await.unwrap();
            store.set(&key, b"second".to_vec()).await.unwrap();
        }

        let reopened = SqliteKvStore::open(&path).unwrap();
        assert_eq!(reopened.get(&key).await.unwrap(), Some(b"second".to_vec()));

        let missing = KvKey::new(KeyNamespace::Zones, "cache").unwrap();
        assert_eq!(reopened.get(&missing).await.unwrap(), None);
    }
}
