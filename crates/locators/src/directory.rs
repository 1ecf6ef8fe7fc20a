use crate::persist::LocatorPersistence;
use fetcher::{BundleLocator, BundleRef, FetchRunContext, RequestMeta};
use kv::KvStore;
use protocols::SftpClient;
use serde_json::json;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

const BATCH_SIZE: usize = 10;

pub type FileFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Produces one request per file in a remote SFTP directory.
///
/// The listing happens once; the resulting queue and the processed set are
/// persisted so an interrupted run resumes where it stopped.
pub struct DirectoryBundleLocator {
    sftp: Arc<dyn SftpClient>,
    remote_dir: String,
    filename_pattern: glob::Pattern,
    file_filter: Option<FileFilter>,
    sort_by_mtime: bool,
    sort_descending: bool,
    max_files: Option<usize>,
    persistence: LocatorPersistence,
    state: Mutex<DirState>,
}

#[derive(Default)]
struct DirState {
    processed: BTreeSet<String>,
    queue: VecDeque<String>,
    initialized: bool,
    loaded: bool,
}

impl DirectoryBundleLocator {
    pub fn new(
        sftp: Arc<dyn SftpClient>,
        store: Arc<dyn KvStore>,
        remote_dir: &str,
        filename_pattern: &str,
        persistence_prefix: &str,
    ) -> Result<Self, glob::PatternError> {
        Ok(Self {
            sftp,
            remote_dir: remote_dir.trim_end_matches('/').to_string(),
            filename_pattern: glob::Pattern::new(filename_pattern)?,
            file_filter: None,
            sort_by_mtime: true,
            sort_descending: true,
            max_files: None,
            persistence: LocatorPersistence::new(store, persistence_prefix, remote_dir),
            state: Mutex::new(DirState::default()),
        })
    }

    pub fn with_file_filter(mut self, filter: FileFilter) -> Self {
        self.file_filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, by_mtime: bool, descending: bool) -> Self {
        self.sort_by_mtime = by_mtime;
        self.sort_descending = descending;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }

    async fn initialize(&self, state: &mut DirState) -> anyhow::Result<()> {
        let entries = self.sftp.list_dir(&self.remote_dir).await?;

        let mut files: Vec<(String, Option<u64>)> = entries
            .into_iter()
            .filter(|entry| !entry.attrs.is_dir)
            .filter(|entry| self.filename_pattern.matches(&entry.name))
            .filter(|entry| {
                self.file_filter
                    .as_ref()
                    .map_or(true, |filter| filter(&entry.name))
            })
            .map(|entry| {
                (
                    format!("{}/{}", self.remote_dir, entry.name),
                    entry.attrs.mtime,
                )
            })
            .collect();

        if self.sort_by_mtime {
            files.sort_by_key(|(_, mtime)| mtime.unwrap_or(0));
            if self.sort_descending {
                files.reverse();
            }
        }

        state.queue = files.into_iter().map(|(path, _)| path).collect();
        state.initialized = true;
        tracing::info!(
            directory = %self.remote_dir,
            file_count = state.queue.len(),
            "initialized directory locator"
        );
        Ok(())
    }

    async fn save(&self, state: &DirState) {
        self.persistence.save_processed(&state.processed).await;
        let queue: Vec<String> = state.queue.iter().cloned().collect();
        self.persistence.save_queue(&queue).await;
        self.persistence
            .save_state(json!({ "initialized": state.initialized }))
            .await;
    }
}

#[async_trait::async_trait]
impl BundleLocator for DirectoryBundleLocator {
    async fn get_next_urls(&self, _ctx: &FetchRunContext) -> anyhow::Result<Vec<RequestMeta>> {
        let mut state = self.state.lock().await;

        if !state.loaded {
            state.processed = self.persistence.load_processed().await;
            if let Some(queue) = self.persistence.load_queue().await {
                state.queue = queue.into();
                state.initialized = self
                    .persistence
                    .load_state()
                    .await
                    .and_then(|s| s.get("initialized").and_then(|v| v.as_bool()))
                    .unwrap_or(true);
            }
            state.loaded = true;
        }
        if !state.initialized {
            self.initialize(&mut state).await?;
        }

        let mut urls = Vec::new();
        while let Some(path) = state.queue.front().cloned() {
            if urls.len() >= BATCH_SIZE {
                break;
            }
            if matches!(self.max_files, Some(max) if state.processed.len() >= max) {
                break;
            }
            state.queue.pop_front();
            if state.processed.insert(path.clone()) {
                urls.push(RequestMeta::new(format!("sftp://{path}")));
            }
        }

        self.save(&state).await;
        Ok(urls)
    }

    async fn handle_url_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        _ctx: &FetchRunContext,
    ) {
        let path = crate::remote_path(&request.url);
        let mut state = self.state.lock().await;
        state.processed.insert(path.to_string());
        self.persistence.save_result(&request.url, bundle_refs).await;
        self.save(&state).await;
    }

    async fn handle_url_error(&self, request: &RequestMeta, error: &str) {
        let path = crate::remote_path(&request.url);
        let mut state = self.state.lock().await;
        state.processed.insert(path.to_string());
        self.persistence.save_error(&request.url, error).await;
        self.save(&state).await;
    }
}

/// Produces requests for a fixed list of remote paths, minus whatever a
/// previous run already processed.
pub struct FileListBundleLocator {
    persistence: LocatorPersistence,
    state: Mutex<ListState>,
}

struct ListState {
    paths: Vec<String>,
    processed: BTreeSet<String>,
    queue: VecDeque<String>,
    loaded: bool,
}

impl FileListBundleLocator {
    pub fn new(store: Arc<dyn KvStore>, paths: Vec<String>, persistence_prefix: &str) -> Self {
        Self {
            persistence: LocatorPersistence::new(store, persistence_prefix, ""),
            state: Mutex::new(ListState {
                paths,
                processed: BTreeSet::new(),
                queue: VecDeque::new(),
                loaded: false,
            }),
        }
    }
}

#[async_trait::async_trait]
impl BundleLocator for FileListBundleLocator {
    async fn get_next_urls(&self, _ctx: &FetchRunContext) -> anyhow::Result<Vec<RequestMeta>> {
        let mut state = self.state.lock().await;

        if !state.loaded {
            state.processed = self.persistence.load_processed().await;
            state.queue = state
                .paths
                .iter()
                .filter(|path| !state.processed.contains(*path))
                .cloned()
                .collect();
            state.loaded = true;
        }

        let mut urls = Vec::new();
        while let Some(path) = state.queue.pop_front() {
            if state.processed.insert(path.clone()) {
                urls.push(RequestMeta::new(format!("sftp://{path}")));
            }
            if urls.len() >= BATCH_SIZE {
                break;
            }
        }

        self.persistence.save_processed(&state.processed).await;
        Ok(urls)
    }

    async fn handle_url_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        _ctx: &FetchRunContext,
    ) {
        let path = crate::remote_path(&request.url);
        let mut state = self.state.lock().await;
        state.processed.insert(path.to_string());
        self.persistence.save_result(&request.url, bundle_refs).await;
        self.persistence.save_processed(&state.processed).await;
    }

    async fn handle_url_error(&self, request: &RequestMeta, error: &str) {
        let path = crate::remote_path(&request.url);
        let mut state = self.state.lock().await;
        state.processed.insert(path.to_string());
        self.persistence.save_error(&request.url, error).await;
        self.persistence.save_processed(&state.processed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv::MemoryKvStore;
    use test_support::FakeSftp;

    fn fake_tree() -> Arc<FakeSftp> {
        Arc::new(
            FakeSftp::new()
                .with_file("/data/20230725_x.txt", b"old", 1_000)
                .with_file("/data/20230729_y.txt", b"new", 3_000)
                .with_file("/data/b.log", b"log", 2_000),
        )
    }

    fn ctx() -> FetchRunContext {
        FetchRunContext::new("test")
    }

    #[tokio::test]
    async fn lists_filters_and_sorts() {
        let locator = DirectoryBundleLocator::new(
            fake_tree(),
            Arc::new(MemoryKvStore::default()),
            "/data",
            "*.txt",
            "dir_provider",
        )
        .unwrap();

        let urls = locator.get_next_urls(&ctx()).await.unwrap();
        let urls: Vec<_> = urls.iter().map(|r| r.url.as_str()).collect();
        // mtime-descending, .log filtered out.
        assert_eq!(
            urls,
            vec![
                "sftp:///data/20230729_y.txt",
                "sftp:///data/20230725_x.txt"
            ]
        );

        // Exhausted afterwards.
        assert!(locator.get_next_urls(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn date_prefix_filter_selects_recent_files() {
        let filter: FileFilter = Arc::new(|name| {
            name.get(..8)
                .map_or(false, |prefix| prefix >= "20230728")
        });
        let locator = DirectoryBundleLocator::new(
            fake_tree(),
            Arc::new(MemoryKvStore::default()),
            "/data",
            "*.txt",
            "dir_provider",
        )
        .unwrap()
        .with_file_filter(filter);

        let urls = locator.get_next_urls(&ctx()).await.unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].url, "sftp:///data/20230729_y.txt");
    }

    #[tokio::test]
    async fn processed_files_survive_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());

        let first = DirectoryBundleLocator::new(
            fake_tree(),
            store.clone(),
            "/data",
            "*.txt",
            "dir_provider",
        )
        .unwrap();
        let urls = first.get_next_urls(&ctx()).await.unwrap();
        assert_eq!(urls.len(), 2);

        // A fresh instance over the same store has nothing left to yield.
        let second = DirectoryBundleLocator::new(
            fake_tree(),
            store,
            "/data",
            "*.txt",
            "dir_provider",
        )
        .unwrap();
        assert!(second.get_next_urls(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_list_skips_processed() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());
        let paths = vec!["/a/1.csv".to_string(), "/a/2.csv".to_string()];

        let locator = FileListBundleLocator::new(store.clone(), paths.clone(), "list_provider");
        let urls = locator.get_next_urls(&ctx()).await.unwrap();
        assert_eq!(urls.len(), 2);
        locator
            .handle_url_processed(&urls[0], &[], &ctx())
            .await;

        let resumed = FileListBundleLocator::new(store, paths, "list_provider");
        assert!(resumed.get_next_urls(&ctx()).await.unwrap().is_empty());
    }
}
