use crate::persist::LocatorPersistence;
use fetcher::{BundleLocator, BundleRef, FetchRunContext, RequestMeta};
use kv::KvStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;

const BATCH_SIZE: usize = 10;

/// Replays another locator's persisted error records.
///
/// URLs whose `retry_count` is below the ceiling are yielded once per run;
/// a successful replay clears the record, a failed one re-records it (which
/// bumps the count).
pub struct RequeueFailedLocator {
    persistence: LocatorPersistence,
    max_retries: u32,
    headers: BTreeMap<String, String>,
    yielded: Mutex<BTreeSet<String>>,
}

impl RequeueFailedLocator {
    /// `prefix`/`scope` name the locator whose failures are replayed.
    pub fn new(store: Arc<dyn KvStore>, prefix: &str, scope: &str, max_retries: u32) -> Self {
        Self {
            persistence: LocatorPersistence::new(store, prefix, scope),
            max_retries,
            headers: BTreeMap::new(),
            yielded: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait::async_trait]
impl BundleLocator for RequeueFailedLocator {
    async fn get_next_urls(&self, _ctx: &FetchRunContext) -> anyhow::Result<Vec<RequestMeta>> {
        let mut yielded = self.yielded.lock().await;

        let mut requests = Vec::new();
        for record in self.persistence.load_errors().await {
            if requests.len() >= BATCH_SIZE {
                break;
            }
            if record.retry_count >= self.max_retries {
                continue;
            }
            if yielded.insert(record.url.clone()) {
                tracing::debug!(url = %record.url, retry_count = record.retry_count, "requeueing failed url");
                requests.push(RequestMeta::new(record.url).with_headers(self.headers.clone()));
            }
        }
        Ok(requests)
    }

    async fn handle_url_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        _ctx: &FetchRunContext,
    ) {
        // Only react to URLs this locator replayed.
        if !self.yielded.lock().await.contains(&request.url) {
            return;
        }
        if !bundle_refs.is_empty() {
            self.persistence.clear_error(&request.url).await;
        }
    }

    async fn handle_url_error(&self, request: &RequestMeta, error: &str) {
        if !self.yielded.lock().await.contains(&request.url) {
            return;
        }
        self.persistence.save_error(&request.url, error).await;
    }
}
