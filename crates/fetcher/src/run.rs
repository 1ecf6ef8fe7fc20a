use crate::{
    DynLocator, DynSink, FetchPlan, FetchResult, FetchRunContext, FetcherRecipe, RequestMeta,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a worker waits on the queue before considering a locator poll.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker-pool orchestrator coupling locators to the loader.
///
/// Termination: when a dequeue deadline passes with an empty queue, one
/// worker (serialized by the locator mutex) polls every locator; if the
/// union of their batches is empty the completion latch is set and workers
/// drain out. A run therefore ends within `workers * poll_timeout` of the
/// last non-empty poll.
pub struct Fetcher {
    recipe: FetcherRecipe,
    storage: DynSink,
    poll_timeout: Duration,
}

impl Fetcher {
    pub fn new(recipe: FetcherRecipe, storage: DynSink) -> Self {
        Self {
            recipe,
            storage,
            poll_timeout: POLL_TIMEOUT,
        }
    }

    /// Shorten the dequeue deadline. Tests use this to avoid multi-second
    /// termination waits.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub async fn run(&self, plan: FetchPlan) -> FetchResult {
        let concurrency = plan.concurrency.max(1);
        let ctx = plan.context.clone();

        tracing::info!(
            run_id = %ctx.run_id,
            concurrency,
            initial_requests = plan.initial_requests.len(),
            bundle_locators = self.recipe.bundle_locators.len(),
            "starting fetcher run"
        );

        // Bounded queue, sized so a full poll round cannot wedge the lone
        // worker that is enqueueing under the locator mutex.
        let capacity = (concurrency * 64).max(1024);
        let (tx, rx) = async_channel::bounded::<RequestMeta>(capacity);

        let shared = Arc::new(Shared {
            locators: self.recipe.bundle_locators.clone(),
            locator_lock: tokio::sync::Mutex::new(()),
            done: CancellationToken::new(),
            processed: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
        });

        for request in plan.initial_requests {
            let _ = tx.send(request).await;
        }

        // Initial poll of every locator, serialized like all later polls.
        {
            let _guard = shared.locator_lock.lock().await;
            for locator in &shared.locators {
                match locator.get_next_urls(&ctx).await {
                    Ok(batch) => {
                        tracing::debug!(url_count = batch.len(), "initial locator batch");
                        for request in batch {
                            let _ = tx.send(request).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %format!("{err:#}"), "initial locator poll failed")
                    }
                }
            }
        }

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let worker = Worker {
                id: worker_id,
                loader: self.recipe.bundle_loader.clone(),
                storage: self.storage.clone(),
                ctx: ctx.clone(),
                shared: shared.clone(),
                tx: tx.clone(),
                rx: rx.clone(),
                poll_timeout: self.poll_timeout,
            };
            workers.push(tokio::spawn(async move { worker.run().await }));
        }
        drop((tx, rx));

        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "worker task panicked");
            }
        }

        let errors = std::mem::take(&mut *shared.errors.lock().unwrap());
        let processed_count = shared.processed.load(Ordering::Relaxed);
        tracing::info!(run_id = %ctx.run_id, processed_count, errors = errors.len(), "fetcher run complete");

        FetchResult {
            processed_count,
            errors,
            context: ctx,
        }
    }
}

struct Shared {
    locators: Vec<DynLocator>,
    locator_lock: tokio::sync::Mutex<()>,
    done: CancellationToken,
    processed: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

struct Worker {
    id: usize,
    loader: crate::DynLoader,
    storage: DynSink,
    ctx: FetchRunContext,
    shared: Arc<Shared>,
    tx: async_channel::Sender<RequestMeta>,
    rx: async_channel::Receiver<RequestMeta>,
    poll_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker_id = self.id, "worker started");
        loop {
            if self.shared.done.is_cancelled() && self.rx.is_empty() {
                break;
            }
            match tokio::time::timeout(self.poll_timeout, self.rx.recv()).await {
                Ok(Ok(request)) => self.process(request).await,
                // Channel closed: the run is being torn down.
                Ok(Err(_)) => break,
                Err(_elapsed) => {
                    if !self.rx.is_empty() {
                        continue;
                    }
                    if self.shared.done.is_cancelled() {
                        break;
                    }
                    self.poll_locators().await;
                }
            }
        }
        tracing::debug!(worker_id = self.id, "worker completed");
    }

    /// Poll every locator for more work, holding the shared mutex so locator
    /// state is only advanced from one task at a time. Sets the completion
    /// latch when no locator has anything left.
    async fn poll_locators(&self) {
        let _guard = self.shared.locator_lock.lock().await;
        if !self.rx.is_empty() || self.shared.done.is_cancelled() {
            return;
        }

        let mut found_urls = false;
        for locator in &self.shared.locators {
            match locator.get_next_urls(&self.ctx).await {
                Ok(batch) => {
                    for request in batch {
                        found_urls = true;
                        let _ = self.tx.send(request).await;
                    }
                }
                Err(err) => {
                    // One failing locator skips only its own batch.
                    tracing::warn!(
                        worker_id = self.id,
                        error = %format!("{err:#}"),
                        "locator poll failed"
                    );
                }
            }
        }

        if !found_urls {
            tracing::debug!(worker_id = self.id, "no new urls, latching completion");
            self.shared.done.cancel();
        }
    }

    async fn process(&self, request: RequestMeta) {
        tracing::debug!(worker_id = self.id, url = %request.url, "processing request");

        match self
            .loader
            .load(&request, self.storage.as_ref(), &self.ctx)
            .await
        {
            Ok(bundle_refs) => {
                for locator in &self.shared.locators {
                    locator
                        .handle_url_processed(&request, &bundle_refs, &self.ctx)
                        .await;
                }
            }
            Err(err) => {
                let message = format!("error processing request {}: {err:#}", request.url);
                tracing::error!(url = %request.url, error = %format!("{err:#}"), "request failed");
                self.shared.errors.lock().unwrap().push(message);
                let error = format!("{err:#}");
                for locator in &self.shared.locators {
                    locator.handle_url_error(&request, &error).await;
                }
            }
        }

        self.shared.processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BundleContext, BundleLoader, BundleLocator, BundleRef, ResourceMeta, StorageError,
        StorageSink,
    };
    use std::collections::HashSet;

    struct NullSink;

    #[async_trait::async_trait]
    impl StorageSink for NullSink {
        async fn open_bundle(
            &self,
            bundle: BundleRef,
        ) -> Result<Box<dyn BundleContext>, StorageError> {
            Ok(Box::new(NullContext(bundle)))
        }
    }

    struct NullContext(BundleRef);

    #[async_trait::async_trait]
    impl BundleContext for NullContext {
        async fn write_resource(
            &mut self,
            _resource: ResourceMeta,
            _stream: crate::ByteStream,
        ) -> Result<(), StorageError> {
            Ok(())
        }
        async fn close(self: Box<Self>) -> Result<BundleRef, StorageError> {
            Ok(self.0)
        }
    }

    /// Records loaded URLs; fails URLs containing "boom".
    struct RecordingLoader {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl BundleLoader for RecordingLoader {
        async fn load(
            &self,
            request: &RequestMeta,
            _sink: &dyn StorageSink,
            _ctx: &FetchRunContext,
        ) -> anyhow::Result<Vec<BundleRef>> {
            if request.url.contains("boom") {
                anyhow::bail!("synthetic failure");
            }
            self.seen.lock().unwrap().push(request.url.clone());
            Ok(vec![BundleRef::new(&request.url)])
        }
    }

    /// Yields scripted batches, one per poll, then runs dry.
    struct ScriptedLocator {
        batches: Mutex<Vec<Vec<RequestMeta>>>,
        processed: Mutex<Vec<String>>,
        errored: Mutex<Vec<String>>,
    }

    impl ScriptedLocator {
        fn new(batches: Vec<Vec<&str>>) -> Self {
            Self {
                batches: Mutex::new(
                    batches
                        .into_iter()
                        .map(|batch| batch.into_iter().map(RequestMeta::new).collect())
                        .collect(),
                ),
                processed: Mutex::new(Vec::new()),
                errored: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BundleLocator for ScriptedLocator {
        async fn get_next_urls(
            &self,
            _ctx: &FetchRunContext,
        ) -> anyhow::Result<Vec<RequestMeta>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }

        async fn handle_url_processed(
            &self,
            request: &RequestMeta,
            _bundle_refs: &[BundleRef],
            _ctx: &FetchRunContext,
        ) {
            self.processed.lock().unwrap().push(request.url.clone());
        }

        async fn handle_url_error(&self, request: &RequestMeta, _error: &str) {
            self.errored.lock().unwrap().push(request.url.clone());
        }
    }

    fn fetcher_for(loader: Arc<RecordingLoader>, locator: Arc<ScriptedLocator>) -> Fetcher {
        let recipe = FetcherRecipe::builder()
            .use_bundle_loader(loader)
            .add_bundle_locator(locator)
            .build();
        Fetcher::new(recipe, Arc::new(NullSink)).with_poll_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn run_drains_locators_and_terminates() {
        let loader = Arc::new(RecordingLoader {
            seen: Mutex::new(Vec::new()),
        });
        let locator = Arc::new(ScriptedLocator::new(vec![
            vec!["https://h/a", "https://h/b"],
            vec!["https://h/c"],
        ]));

        let plan = FetchPlan::new(FetchRunContext::new("test-run"), 4);
        let result = fetcher_for(loader.clone(), locator.clone()).run(plan).await;

        assert_eq!(result.processed_count, 3);
        assert!(result.errors.is_empty());

        let seen: HashSet<_> = loader.seen.lock().unwrap().iter().cloned().collect();
        assert_eq!(seen.len(), 3);
        assert_eq!(locator.processed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failures_are_recorded_without_killing_workers() {
        let loader = Arc::new(RecordingLoader {
            seen: Mutex::new(Vec::new()),
        });
        let locator = Arc::new(ScriptedLocator::new(vec![vec![
            "https://h/ok-1",
            "https://h/boom",
            "https://h/ok-2",
        ]]));

        let plan = FetchPlan::new(FetchRunContext::new("test-run"), 2);
        let result = fetcher_for(loader.clone(), locator.clone()).run(plan).await;

        assert_eq!(result.processed_count, 3);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("https://h/boom"));
        assert_eq!(locator.processed.lock().unwrap().len(), 2);
        assert_eq!(
            locator.errored.lock().unwrap().as_slice(),
            &["https://h/boom".to_string()]
        );
    }

    #[tokio::test]
    async fn initial_requests_are_processed() {
        let loader = Arc::new(RecordingLoader {
            seen: Mutex::new(Vec::new()),
        });
        let locator = Arc::new(ScriptedLocator::new(vec![]));

        let mut plan = FetchPlan::new(FetchRunContext::new("test-run"), 1);
        plan.initial_requests.push(RequestMeta::new("https://h/seed"));
        let result = fetcher_for(loader.clone(), locator).run(plan).await;

        assert_eq!(result.processed_count, 1);
        assert_eq!(
            loader.seen.lock().unwrap().as_slice(),
            &["https://h/seed".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_run_terminates_quickly() {
        let loader = Arc::new(RecordingLoader {
            seen: Mutex::new(Vec::new()),
        });
        let locator = Arc::new(ScriptedLocator::new(vec![]));

        let started = std::time::Instant::now();
        let plan = FetchPlan::new(FetchRunContext::new("test-run"), 4);
        let result = fetcher_for(loader, locator).run(plan).await;

        assert_eq!(result.processed_count, 0);
        // Bounded by workers * poll_timeout, with headroom for slow CI.
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
