//! KV persistence shared by all locators.
//!
//! Key layout (`:`-separated): `<prefix>:processed_urls[:<scope>]`,
//! `<prefix>:file_queue:<scope>`, `<prefix>:state:<scope>`,
//! `<prefix>:results:<scope>:<hash(url)>`, `<prefix>:errors:<scope>:<hash(url)>`.

use chrono::Utc;
use kv::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const PROGRESS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub(crate) const RESULT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
pub(crate) const ERROR_TTL: Duration = Duration::from_secs(24 * 3600);

/// Stable, short hash for per-URL keys.
pub(crate) fn url_hash(url: &str) -> String {
    hex::encode(&Sha256::digest(url.as_bytes())[..8])
}

/// Per-URL failure record, replayable by `RequeueFailedLocator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub url: String,
    pub error: String,
    pub timestamp: String,
    pub retry_count: u32,
}

/// Per-URL completion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleResult {
    pub url: String,
    pub timestamp: String,
    pub success: bool,
    pub bundle_count: usize,
    pub bundle_refs: Vec<String>,
}

#[derive(Clone)]
pub(crate) struct LocatorPersistence {
    store: Arc<dyn KvStore>,
    prefix: String,
    scope: String,
}

impl LocatorPersistence {
    pub fn new(store: Arc<dyn KvStore>, prefix: &str, scope: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            scope: scope.to_string(),
        }
    }

    fn key(&self, kind: &str) -> String {
        if self.scope.is_empty() {
            format!("{}:{}", self.prefix, kind)
        } else {
            format!("{}:{}:{}", self.prefix, kind, self.scope)
        }
    }

    fn url_key(&self, kind: &str, url: &str) -> String {
        format!("{}:{}", self.key(kind), url_hash(url))
    }

    pub async fn load_processed(&self) -> BTreeSet<String> {
        match self.store.get(&self.key("processed_urls"), None).await {
            Ok(Some(Value::Array(urls))) => urls
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Ok(_) => BTreeSet::new(),
            Err(err) => {
                tracing::warn!(prefix = %self.prefix, error = %err, "failed to load processed urls");
                BTreeSet::new()
            }
        }
    }

    pub async fn save_processed(&self, processed: &BTreeSet<String>) {
        let value = Value::Array(processed.iter().map(|u| json!(u)).collect());
        if let Err(err) = self
            .store
            .put(&self.key("processed_urls"), value, Some(PROGRESS_TTL), None)
            .await
        {
            tracing::warn!(prefix = %self.prefix, error = %err, "failed to save processed urls");
        }
    }

    pub async fn load_queue(&self) -> Option<Vec<String>> {
        match self.store.get(&self.key("file_queue"), None).await {
            Ok(Some(Value::Array(urls))) => Some(
                urls.into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub async fn save_queue(&self, queue: &[String]) {
        let value = Value::Array(queue.iter().map(|u| json!(u)).collect());
        if let Err(err) = self
            .store
            .put(&self.key("file_queue"), value, Some(PROGRESS_TTL), None)
            .await
        {
            tracing::warn!(prefix = %self.prefix, error = %err, "failed to save queue");
        }
    }

    pub async fn load_state(&self) -> Option<Value> {
        self.store.get(&self.key("state"), None).await.ok().flatten()
    }

    pub async fn save_state(&self, mut state: Value) {
        if let Some(map) = state.as_object_mut() {
            map.insert("last_updated".to_string(), json!(Utc::now().to_rfc3339()));
        }
        if let Err(err) = self
            .store
            .put(&self.key("state"), state, Some(PROGRESS_TTL), None)
            .await
        {
            tracing::warn!(prefix = %self.prefix, error = %err, "failed to save state");
        }
    }

    pub async fn save_result(&self, url: &str, bundle_refs: &[fetcher::BundleRef]) {
        let result = BundleResult {
            url: url.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            success: !bundle_refs.is_empty(),
            bundle_count: bundle_refs.len(),
            bundle_refs: bundle_refs.iter().map(|b| b.bid.to_string()).collect(),
        };
        if let Err(err) = self
            .store
            .put(
                &self.url_key("results", url),
                serde_json::to_value(&result).expect("result serializes"),
                Some(RESULT_TTL),
                None,
            )
            .await
        {
            tracing::warn!(url, error = %err, "failed to save result record");
        }
    }

    /// Record a failure. A pre-existing record bumps `retry_count`, so each
    /// replay attempt is counted.
    pub async fn save_error(&self, url: &str, error: &str) {
        let key = self.url_key("errors", url);
        let retry_count = match self.store.get(&key, None).await {
            Ok(Some(existing)) => {
                serde_json::from_value::<ErrorRecord>(existing)
                    .map(|record| record.retry_count + 1)
                    .unwrap_or(0)
            }
            _ => 0,
        };
        let record = ErrorRecord {
            url: url.to_string(),
            error: error.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            retry_count,
        };
        if let Err(err) = self
            .store
            .put(
                &key,
                serde_json::to_value(&record).expect("error record serializes"),
                Some(ERROR_TTL),
                None,
            )
            .await
        {
            tracing::warn!(url, error = %err, "failed to save error record");
        }
    }

    pub async fn clear_error(&self, url: &str) {
        let _ = self.store.delete(&self.url_key("errors", url), None).await;
    }

    /// All persisted error records under this prefix and scope, in key order.
    pub async fn load_errors(&self) -> Vec<ErrorRecord> {
        let start = format!("{}:", self.key("errors"));
        let mut end = start.clone();
        end.push('~');
        match self.store.range_get(&start, Some(&end), None, None).await {
            Ok(pairs) => pairs
                .into_iter()
                .filter_map(|(_, value)| serde_json::from_value(value).ok())
                .collect(),
            Err(err) => {
                tracing::warn!(prefix = %self.prefix, error = %err, "failed to load error records");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv::MemoryKvStore;

    fn persistence(scope: &str) -> LocatorPersistence {
        LocatorPersistence::new(Arc::new(MemoryKvStore::default()), "prov", scope)
    }

    #[test]
    fn key_layout() {
        let scoped = persistence("https://api/base");
        assert_eq!(scoped.key("state"), "prov:state:https://api/base");
        let unscoped = persistence("");
        assert_eq!(unscoped.key("processed_urls"), "prov:processed_urls");
        assert!(scoped
            .url_key("errors", "https://api/base?p=1")
            .starts_with("prov:errors:https://api/base:"));
    }

    #[tokio::test]
    async fn processed_urls_round_trip() {
        let persistence = persistence("scope");
        let mut set = BTreeSet::new();
        set.insert("https://h/a".to_string());
        set.insert("https://h/b".to_string());
        persistence.save_processed(&set).await;
        assert_eq!(persistence.load_processed().await, set);
    }

    #[tokio::test]
    async fn error_records_accumulate_retries() {
        let persistence = persistence("s");
        persistence.save_error("https://h/x", "boom").await;
        persistence.save_error("https://h/x", "boom again").await;
        persistence.save_error("https://h/y", "other").await;

        let records = persistence.load_errors().await;
        assert_eq!(records.len(), 2);
        let x = records.iter().find(|r| r.url == "https://h/x").unwrap();
        assert_eq!(x.retry_count, 1);
        assert_eq!(x.error, "boom again");

        persistence.clear_error("https://h/x").await;
        assert_eq!(persistence.load_errors().await.len(), 1);
    }
}
