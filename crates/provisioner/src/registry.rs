//! Client Registry
//!
//! Durable storage of client records, keyed by lower-case id. Two backends
//! are provided: Redis for multi-instance deployments and a single JSON
//! document for standalone hosts.

use async_trait::async_trait;
use nsboot_common::{Client, Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait ClientStore: Send + Sync {
    /// All clients, sorted by id.
    async fn list(&self) -> Result<Vec<Client>>;

    async fn get(&self, id: &str) -> Result<Option<Client>>;

    /// Insert or replace by id.
    async fn upsert(&self, client: &Client) -> Result<()>;

    /// Returns whether a record was removed. Removing an unknown id is not an
    /// error.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// Open the store selected by `url`: `redis://` (or `rediss://`) URLs select
/// Redis, anything else is a JSON file path.
pub async fn open_store(url: &str) -> Result<Arc<dyn ClientStore>> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(Arc::new(RedisStore::new(url).await?))
    } else {
        Ok(Arc::new(JsonFileStore::new(url)))
    }
}

fn storage_error(err: impl std::fmt::Display) -> Error {
    Error::Storage(err.to_string())
}

const INDEX_KEY: &str = "clients:all";

fn client_key(id: &str) -> String {
    format!("client:{}", id.to_ascii_lowercase())
}

/// Redis backend: `client:{id}` holds the JSON record and `clients:all` the
/// set of ids.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(storage_error)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

#[async_trait]
impl ClientStore for RedisStore {
    async fn list(&self) -> Result<Vec<Client>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.smembers(INDEX_KEY).await.map_err(storage_error)?;
        ids.sort();

        let mut clients = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(client) = self.get(id).await? {
                clients.push(client);
            } else {
                debug!(id, "index entry without record");
            }
        }
        Ok(clients)
    }

    async fn get(&self, id: &str) -> Result<Option<Client>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(client_key(id)).await.map_err(storage_error)?;
        json.map(|data| serde_json::from_str(&data).map_err(storage_error))
            .transpose()
    }

    async fn upsert(&self, client: &Client) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(client)?;

        redis::pipe()
            .atomic()
            .set(client_key(&client.id), json)
            .ignore()
            .sadd(INDEX_KEY, &client.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(storage_error)?;

        info!(id = %client.id, "stored client record");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (deleted, _): (bool, i64) = redis::pipe()
            .atomic()
            .del(client_key(id))
            .srem(INDEX_KEY, id.to_ascii_lowercase())
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;

        if deleted {
            info!(id, "removed client record");
        }
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    clients: Vec<Client>,
}

/// JSON document backend: `{ "clients": [...] }`, rewritten atomically on
/// every change.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RegistryFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(RegistryFile::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Storage(format!("Corrupt registry {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn save(&self, file: &RegistryFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(storage_error)?;
            }
        }
        tokio::fs::write(&tmp, json).await.map_err(storage_error)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

#[async_trait]
impl ClientStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<Client>> {
        let _guard = self.lock.lock().await;
        let mut clients = self.load().await?.clients;
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(clients)
    }

    async fn get(&self, id: &str) -> Result<Option<Client>> {
        let _guard = self.lock.lock().await;
        let id = id.to_ascii_lowercase();
        Ok(self
            .load()
            .await?
            .clients
            .into_iter()
            .find(|c| c.id == id))
    }

    async fn upsert(&self, client: &Client) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        match file.clients.iter_mut().find(|c| c.id == client.id) {
            Some(existing) => *existing = client.clone(),
            None => file.clients.push(client.clone()),
        }
        file.clients.sort_by(|a, b| a.id.cmp(&b.id));
        self.save(&file).await?;
        info!(id = %client.id, "stored client record");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let id = id.to_ascii_lowercase();
        let mut file = self.load().await?;
        let before = file.clients.len();
        file.clients.retain(|c| c.id != id);
        if file.clients.len() == before {
            return Ok(false);
        }
        self.save(&file).await?;
        info!(id, "removed client record");
        Ok(true)
    }

    async fn health_check(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.load().await.map(|_| ())
    }
}
