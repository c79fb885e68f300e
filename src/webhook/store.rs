//! Key-value backends for subscription records.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::StoreConfig;
use crate::error::Result;

/// Storage abstraction for persisted string values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    /// Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`, in no particular order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Build the backend named by the configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::File(dir) => Ok(Arc::new(FileStore::open(dir).await?)),
        #[cfg(feature = "redis")]
        StoreConfig::Redis(url) => Ok(Arc::new(RedisStore::connect(url)?)),
        #[cfg(not(feature = "redis"))]
        StoreConfig::Redis(_) => Err(crate::error::BridgeError::Configuration(
            "redis store requires the `redis` feature".into(),
        )),
    }
}

/// Process-local store. Contents vanish on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One `.json` file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain `:` and other characters unsafe in file names.
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match urlencoding::decode(stem).ok().map(Cow::into_owned) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => tracing::warn!(file = %stem, "Skipping unreadable store file name"),
            }
        }
        Ok(keys)
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use async_trait::async_trait;
    use deadpool_redis::{Config, Pool, Runtime};
    use redis::AsyncCommands;

    use super::KeyValueStore;
    use crate::error::{BridgeError, Result};

    /// Redis-backed store using a connection pool.
    #[derive(Clone)]
    pub struct RedisStore {
        pool: Pool,
    }

    impl RedisStore {
        pub fn connect(url: &str) -> Result<Self> {
            let pool = Config::from_url(url)
                .create_pool(Some(Runtime::Tokio1))
                .map_err(|e| BridgeError::Store(format!("create redis pool: {e}")))?;
            Ok(Self { pool })
        }

        async fn conn(&self) -> Result<deadpool_redis::Connection> {
            self.pool
                .get()
                .await
                .map_err(|e| BridgeError::Store(format!("redis connection: {e}")))
        }
    }

    fn store_error(error: redis::RedisError) -> BridgeError {
        BridgeError::Store(error.to_string())
    }

    #[async_trait]
    impl KeyValueStore for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn().await?;
            let value: Option<String> = conn.get(key).await.map_err(store_error)?;
            Ok(value)
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            let mut conn = self.conn().await?;
            let _: () = conn.set(key, value).await.map_err(store_error)?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let mut conn = self.conn().await?;
            let _: () = conn.del(key).await.map_err(store_error)?;
            Ok(())
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            let mut conn = self.conn().await?;
            let keys: Vec<String> = conn
                .keys(format!("{prefix}*"))
                .await
                .map_err(store_error)?;
            Ok(keys)
        }
    }
}
