use crate::{effective_ttl, prefixed_key, KvError, KvStore, Result, Serializer};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

const CONNECT_ATTEMPTS: u32 = 3;
const SCAN_COUNT: usize = 100;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub serializer: Serializer,
    pub default_ttl: Option<Duration>,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            serializer: Serializer::Json,
            default_ttl: None,
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Networked store over a managed redis connection. The connection is
/// established and health-checked on first use.
pub struct RedisKvStore {
    config: RedisConfig,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisKvStore {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let client = redis::Client::open(self.config.url())
            .map_err(|err| KvError::BackendUnavailable(err.to_string()))?;

        let mut last_err = String::new();
        for attempt in 0..CONNECT_ATTEMPTS {
            match ConnectionManager::new(client.clone()).await {
                Ok(mut conn) => {
                    // Health check before handing the connection out.
                    match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
                        Ok(_) => {
                            *guard = Some(conn.clone());
                            return Ok(conn);
                        }
                        Err(err) => last_err = err.to_string(),
                    }
                }
                Err(err) => last_err = err.to_string(),
            }
            tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
        }
        Err(KvError::BackendUnavailable(last_err))
    }

    fn effective_prefix<'a>(&'a self, prefix: Option<&'a str>) -> &'a str {
        prefix.unwrap_or(&self.config.key_prefix)
    }

    async fn scan_keys(&self, conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(conn)
                .await
                .map_err(|err| KvError::BackendUnavailable(err.to_string()))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                return Ok(keys);
            }
        }
    }
}

#[async_trait::async_trait]
impl KvStore for RedisKvStore {
    async fn put(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        prefix: Option<&str>,
    ) -> Result<()> {
        let bytes = self.config.serializer.encode(&value)?;
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let mut conn = self.connection().await?;

        match effective_ttl(ttl, self.config.default_ttl) {
            Some(ttl) => conn
                .set_ex(key, bytes, ttl.as_secs())
                .await
                .map_err(|err| KvError::BackendUnavailable(err.to_string())),
            None => conn
                .set(key, bytes)
                .await
                .map_err(|err| KvError::BackendUnavailable(err.to_string())),
        }
    }

    async fn get(&self, key: &str, prefix: Option<&str>) -> Result<Option<Value>> {
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let mut conn = self.connection().await?;
        let bytes: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|err| KvError::BackendUnavailable(err.to_string()))?;
        match bytes {
            Some(bytes) => self.config.serializer.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str, prefix: Option<&str>) -> Result<bool> {
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|err| KvError::BackendUnavailable(err.to_string()))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str, prefix: Option<&str>) -> Result<bool> {
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let mut conn = self.connection().await?;
        conn.exists(key)
            .await
            .map_err(|err| KvError::BackendUnavailable(err.to_string()))
    }

    async fn range_get(
        &self,
        start_key: &str,
        end_key: Option<&str>,
        limit: Option<usize>,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, Value)>> {
        let effective = self.effective_prefix(prefix).to_string();
        let pattern = if effective.is_empty() {
            "*".to_string()
        } else {
            format!("{}*", prefixed_key("", &effective))
        };

        let mut conn = self.connection().await?;
        let keys = self.scan_keys(&mut conn, &pattern).await?;

        // SCAN yields keys in backend order; collect matches and sort
        // client-side so callers always observe ascending keys.
        let mut out = Vec::new();
        for key in keys {
            let stripped = match key.strip_prefix(&effective) {
                Some(rest) => rest.trim_start_matches(':').to_string(),
                None => key.clone(),
            };
            if stripped.as_str() < start_key {
                continue;
            }
            if matches!(end_key, Some(end) if stripped.as_str() >= end) {
                continue;
            }
            let bytes: Option<Vec<u8>> = conn
                .get(&key)
                .await
                .map_err(|err| KvError::BackendUnavailable(err.to_string()))?;
            if let Some(bytes) = bytes {
                out.push((stripped, self.config.serializer.decode(&bytes)?));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        self.conn.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_password_and_db() {
        let config = RedisConfig {
            password: Some("hunter2".to_string()),
            db: 3,
            ..RedisConfig::default()
        };
        assert_eq!(config.url(), "redis://:hunter2@localhost:6379/3");
        assert_eq!(RedisConfig::default().url(), "redis://localhost:6379/0");
    }
}
