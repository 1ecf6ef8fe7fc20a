use crate::{effective_ttl, prefixed_key, KvStore, Result, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Process-local store backed by an ordered map. Data is lost on restart.
///
/// Expired entries are dropped on read and by a background sweep that starts
/// with the first write.
pub struct MemoryKvStore {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
    serializer: Serializer,
    default_ttl: Option<Duration>,
    key_prefix: String,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_keys: usize,
    pub expiring_keys: usize,
}

impl MemoryKvStore {
    pub fn new(serializer: Serializer, default_ttl: Option<Duration>, key_prefix: &str) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            serializer,
            default_ttl,
            key_prefix: key_prefix.to_string(),
            sweeper: Mutex::new(None),
        }
    }

    fn effective_prefix<'a>(&'a self, prefix: Option<&'a str>) -> &'a str {
        prefix.unwrap_or(&self.key_prefix)
    }

    async fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let entries = Arc::clone(&self.entries);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut entries = entries.lock().await;
                entries.retain(|_, entry| !entry.is_expired(now));
            }
        }));
    }

    pub async fn stats(&self) -> MemoryStats {
        let entries = self.entries.lock().await;
        MemoryStats {
            total_keys: entries.len(),
            expiring_keys: entries.values().filter(|e| e.expires_at.is_some()).count(),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn put(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        prefix: Option<&str>,
    ) -> Result<()> {
        self.ensure_sweeper().await;

        let bytes = self.serializer.encode(&value)?;
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let expires_at =
            effective_ttl(ttl, self.default_ttl).map(|ttl| Instant::now() + ttl);

        let mut entries = self.entries.lock().await;
        entries.insert(key, Entry { bytes, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str, prefix: Option<&str>) -> Result<Option<Value>> {
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let mut entries = self.entries.lock().await;

        match entries.get(&key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(&key);
                Ok(None)
            }
            Some(entry) => self.serializer.decode(&entry.bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str, prefix: Option<&str>) -> Result<bool> {
        let key = prefixed_key(key, self.effective_prefix(prefix));
        let mut entries = self.entries.lock().await;
        match entries.remove(&key) {
            Some(entry) => Ok(!entry.is_expired(Instant::now())),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str, prefix: Option<&str>) -> Result<bool> {
        Ok(self.get(key, prefix).await?.is_some())
    }

    async fn range_get(
        &self,
        start_key: &str,
        end_key: Option<&str>,
        limit: Option<usize>,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, Value)>> {
        let effective = self.effective_prefix(prefix).to_string();
        let start = prefixed_key(start_key, &effective);
        let end = end_key.map(|end| prefixed_key(end, &effective));

        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let upper = match &end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };

        let mut out = Vec::new();
        let mut expired = Vec::new();
        for (key, entry) in entries.range::<String, _>((Bound::Included(start), upper)) {
            if entry.is_expired(now) {
                expired.push(key.clone());
                continue;
            }
            if !effective.is_empty() && !key.starts_with(&effective) {
                continue;
            }
            let stripped = match key.strip_prefix(&effective) {
                Some(rest) => rest.trim_start_matches(':').to_string(),
                None => key.clone(),
            };
            out.push((stripped, self.serializer.decode(&entry.bytes)?));
            if matches!(limit, Some(limit) if out.len() >= limit) {
                break;
            }
        }
        for key in expired {
            entries.remove(&key);
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        self.entries.lock().await.clear();
        Ok(())
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(Serializer::Json, None, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryKvStore::default();
        store
            .put("cursor", json!("abc"), None, None)
            .await
            .unwrap();
        assert_eq!(store.get("cursor", None).await.unwrap(), Some(json!("abc")));
        assert!(store.exists("cursor", None).await.unwrap());
        assert!(store.delete("cursor", None).await.unwrap());
        assert!(!store.delete("cursor", None).await.unwrap());
        assert_eq!(store.get("cursor", None).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryKvStore::default();
        store
            .put("gone", json!(1), Some(Duration::from_secs(10)), None)
            .await
            .unwrap();
        store.put("kept", json!(2), None, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("gone", None).await.unwrap(), None);
        assert_eq!(store.get("kept", None).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_expired_keys() {
        let store = MemoryKvStore::default();
        store
            .put("a", json!(1), Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        // Yield so the sweep task gets to run after the advance.
        tokio::task::yield_now().await;
        assert_eq!(store.stats().await.total_keys, 0);
    }

    #[tokio::test]
    async fn range_is_ordered_and_bounded() {
        let store = MemoryKvStore::default();
        for key in ["p:errors:3", "p:errors:1", "p:errors:2", "p:other:9"] {
            store.put(key, json!(key), None, None).await.unwrap();
        }

        let pairs = store
            .range_get("p:errors:", Some("p:errors:~"), None, None)
            .await
            .unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p:errors:1", "p:errors:2", "p:errors:3"]);

        let limited = store
            .range_get("p:errors:", None, Some(2), None)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn default_prefix_and_override() {
        let store = MemoryKvStore::new(Serializer::Json, None, "ns");
        store.put("k", json!(1), None, None).await.unwrap();
        store.put("k", json!(2), None, Some("other")).await.unwrap();

        assert_eq!(store.get("k", None).await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("k", Some("other")).await.unwrap(), Some(json!(2)));
        assert_eq!(store.get("k", Some("")).await.unwrap(), None);
    }
}
