use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use thiserror::Error;
use tokio::sync::RwLock;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Keys a [`Store`] can hold. Byte encodings must sort like the keys do.
pub trait StoreKey: Clone + Ord + Send + Sync + fmt::Debug + 'static {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError>;
}

impl StoreKey for u64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
            StorageError::DeserializationError(format!("expected 8 key bytes, got {}", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl StoreKey for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::DeserializationError(e.to_string()))
    }
}

/// Asynchronous key-value store the chain keeps its blocks and pending
/// transactions in. Every call may suspend.
#[async_trait]
pub trait Store<K, V>: Send + Sync
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, key: K, value: V) -> Result<(), StorageError>;

    async fn get(&self, key: &K) -> Result<Option<V>, StorageError>;

    async fn remove(&self, key: &K) -> Result<(), StorageError>;

    /// All keys in ascending order
    async fn ids(&self) -> Result<Vec<K>, StorageError>;

    async fn size(&self) -> Result<usize, StorageError>;

    /// All values in key order
    async fn list(&self) -> Result<Vec<V>, StorageError>;

    /// Values sorted with `compare`, then cut to `start..end`
    ///
    /// # Arguments
    ///
    /// * `compare` - The ordering applied before cutting
    /// * `start` - The first position to keep
    /// * `end` - The position after the last one to keep
    ///
    /// # Returns
    ///
    /// At most `end - start` values, fewer when the store runs out
    async fn slice(
        &self,
        compare: for<'x, 'y> fn(&'x V, &'y V) -> Ordering,
        start: usize,
        end: usize,
    ) -> Result<Vec<V>, StorageError> {
        let mut values = self.list().await?;
        values.sort_by(compare);
        Ok(values
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect())
    }
}

/// In-memory store, ordered by key
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    entries: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        MemoryStore {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, key: K, value: V) -> Result<(), StorageError> {
        self.entries.write().await.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: &K) -> Result<Option<V>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &K) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<K>, StorageError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn size(&self) -> Result<usize, StorageError> {
        Ok(self.entries.read().await.len())
    }

    async fn list(&self) -> Result<Vec<V>, StorageError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}

/// Opens (or creates) the sled database at `path`
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<Db, StorageError> {
    Ok(sled::open(path)?)
}

/// A sled tree holding bincode encoded values
pub struct SledStore<K, V> {
    tree: Tree,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> fmt::Debug for SledStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .finish()
    }
}

impl<K, V> SledStore<K, V> {
    /// Opens the tree called `name` in `db`
    pub fn new(db: &Db, name: &str) -> Result<Self, StorageError> {
        Ok(SledStore {
            tree: db.open_tree(name)?,
            _marker: PhantomData,
        })
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.tree.flush()?;
        Ok(())
    }
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

#[async_trait]
impl<K, V> Store<K, V> for SledStore<K, V>
where
    K: StoreKey,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn put(&self, key: K, value: V) -> Result<(), StorageError> {
        let value = bincode::serialize(&value)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.tree.insert(key.to_bytes(), value)?;
        Ok(())
    }

    async fn get(&self, key: &K) -> Result<Option<V>, StorageError> {
        match self.tree.get(key.to_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &K) -> Result<(), StorageError> {
        self.tree.remove(key.to_bytes())?;
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<K>, StorageError> {
        self.tree
            .iter()
            .keys()
            .map(|key| K::from_bytes(&key?))
            .collect()
    }

    async fn size(&self) -> Result<usize, StorageError> {
        Ok(self.tree.len())
    }

    async fn list(&self) -> Result<Vec<V>, StorageError> {
        self.tree
            .iter()
            .values()
            .map(|value| decode(&value?))
            .collect()
    }
}
