use crate::config::ProviderConfig;
use crate::constants::DB_PRAGMAS;
use crate::types::{AqueductError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;

/// Persistence collaborator. All calls are best-effort: the pipeline spawns
/// them fire-and-forget and never blocks the retry loop on storage I/O.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn load_blacklist(&self) -> Result<HashMap<String, DateTime<Utc>>>;
    async fn save_blacklist(&self, blacklist: HashMap<String, DateTime<Utc>>) -> Result<()>;
    async fn load_configs(&self) -> Result<Vec<ProviderConfig>>;
    async fn save_configs(&self, configs: Vec<ProviderConfig>) -> Result<()>;
}

/// Sqlite-backed store. Blacklist records are `{ key: expiryEpochMillis }`.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = match path.as_ref().to_str() {
            Some(s) => s,
            None => {
                return Err(AqueductError::Internal(
                    "Invalid store path: non-UTF8 characters".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
                .into())
            }
        };
        let url = format!("sqlite:{}?mode=rwc", path_str);
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(AqueductError::Database)?;

        for pragma in DB_PRAGMAS {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(AqueductError::Database)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS key_blacklist (
                key TEXT PRIMARY KEY,
                expires_at_ms INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(AqueductError::Database)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS provider_configs (
                id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(AqueductError::Database)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn load_blacklist(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let rows = sqlx::query("SELECT key, expires_at_ms FROM key_blacklist")
            .fetch_all(&self.pool)
            .await
            .map_err(AqueductError::Database)?;

        let mut map = HashMap::new();
        for row in rows {
            let key: String = row.get(0);
            let millis: i64 = row.get(1);
            match Utc.timestamp_millis_opt(millis).single() {
                Some(expiry) => {
                    map.insert(key, expiry);
                }
                None => {
                    tracing::warn!("Discarding blacklist entry with invalid expiry: {}", millis);
                }
            }
        }
        Ok(map)
    }

    async fn save_blacklist(&self, blacklist: HashMap<String, DateTime<Utc>>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(AqueductError::Database)?;
        sqlx::query("DELETE FROM key_blacklist")
            .execute(&mut *tx)
            .await
            .map_err(AqueductError::Database)?;
        for (key, expiry) in blacklist {
            sqlx::query("INSERT OR REPLACE INTO key_blacklist (key, expires_at_ms) VALUES (?1, ?2)")
                .bind(key)
                .bind(expiry.timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(AqueductError::Database)?;
        }
        tx.commit().await.map_err(AqueductError::Database)?;
        Ok(())
    }

    async fn load_configs(&self) -> Result<Vec<ProviderConfig>> {
        let rows = sqlx::query("SELECT config_json FROM provider_configs")
            .fetch_all(&self.pool)
            .await
            .map_err(AqueductError::Database)?;

        let mut configs = Vec::new();
        for row in rows {
            let json: String = row.get(0);
            match serde_json::from_str::<ProviderConfig>(&json) {
                Ok(config) => configs.push(config),
                Err(e) => tracing::warn!("Skipping undeserializable provider config: {}", e),
            }
        }
        Ok(configs)
    }

    async fn save_configs(&self, configs: Vec<ProviderConfig>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(AqueductError::Database)?;
        for config in configs {
            let json = serde_json::to_string(&config).map_err(AqueductError::Serialization)?;
            sqlx::query("INSERT OR REPLACE INTO provider_configs (id, config_json) VALUES (?1, ?2)")
                .bind(config.id.to_string())
                .bind(json)
                .execute(&mut *tx)
                .await
                .map_err(AqueductError::Database)?;
        }
        tx.commit().await.map_err(AqueductError::Database)?;
        Ok(())
    }
}

/// In-memory store for tests and embedders without a durable backend.
#[derive(Default)]
pub struct MemoryStore {
    blacklist: std::sync::Mutex<HashMap<String, DateTime<Utc>>>,
    configs: std::sync::Mutex<Vec<ProviderConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn load_blacklist(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        Ok(self
            .blacklist
            .lock()
            .map_err(|_| {
                AqueductError::Internal(
                    "blacklist lock poisoned".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
            })?
            .clone())
    }

    async fn save_blacklist(&self, map: HashMap<String, DateTime<Utc>>) -> Result<()> {
        if let Ok(mut guard) = self.blacklist.lock() {
            *guard = map;
        }
        Ok(())
    }

    async fn load_configs(&self) -> Result<Vec<ProviderConfig>> {
        Ok(self
            .configs
            .lock()
            .map_err(|_| {
                AqueductError::Internal(
                    "config lock poisoned".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
            })?
            .clone())
    }

    async fn save_configs(&self, configs: Vec<ProviderConfig>) -> Result<()> {
        if let Ok(mut guard) = self.configs.lock() {
            *guard = configs;
        }
        Ok(())
    }
}
