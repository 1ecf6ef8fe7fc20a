use crate::persist::LocatorPersistence;
use fetcher::{BundleLocator, BundleRef, FetchRunContext, RequestMeta};
use kv::KvStore;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

const BATCH_SIZE: usize = 10;

/// Yields a fixed list of API URLs once, with per-URL results and errors
/// persisted.
pub struct SingleApiBundleLocator {
    headers: BTreeMap<String, String>,
    persistence: LocatorPersistence,
    state: Mutex<SingleState>,
}

struct SingleState {
    urls: Vec<String>,
    processed: BTreeSet<String>,
    queue: VecDeque<String>,
    loaded: bool,
}

impl SingleApiBundleLocator {
    pub fn new(store: Arc<dyn KvStore>, urls: Vec<String>, persistence_prefix: &str) -> Self {
        Self {
            headers: BTreeMap::new(),
            persistence: LocatorPersistence::new(store, persistence_prefix, ""),
            state: Mutex::new(SingleState {
                urls,
                processed: BTreeSet::new(),
                queue: VecDeque::new(),
                loaded: false,
            }),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait::async_trait]
impl BundleLocator for SingleApiBundleLocator {
    async fn get_next_urls(&self, _ctx: &FetchRunContext) -> anyhow::Result<Vec<RequestMeta>> {
        let mut state = self.state.lock().await;

        if !state.loaded {
            state.processed = self.persistence.load_processed().await;
            state.queue = state
                .urls
                .iter()
                .filter(|url| !state.processed.contains(*url))
                .cloned()
                .collect();
            state.loaded = true;
        }

        let mut requests = Vec::new();
        while let Some(url) = state.queue.pop_front() {
            if state.processed.insert(url.clone()) {
                requests.push(RequestMeta::new(url).with_headers(self.headers.clone()));
            }
            if requests.len() >= BATCH_SIZE {
                break;
            }
        }

        self.persistence.save_processed(&state.processed).await;
        Ok(requests)
    }

    async fn handle_url_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        _ctx: &FetchRunContext,
    ) {
        let mut state = self.state.lock().await;
        state.processed.insert(request.url.clone());
        self.persistence.save_result(&request.url, bundle_refs).await;
        self.persistence.save_processed(&state.processed).await;
    }

    async fn handle_url_error(&self, request: &RequestMeta, error: &str) {
        let mut state = self.state.lock().await;
        state.processed.insert(request.url.clone());
        self.persistence.save_error(&request.url, error).await;
        self.persistence.save_processed(&state.processed).await;
    }
}
