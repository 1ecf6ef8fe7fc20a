//! Core model and orchestration loop of the acquisition engine.
//!
//! A [`FetcherRecipe`] couples one [`BundleLoader`] with any number of
//! [`BundleLocator`]s. [`Fetcher::run`] drives the recipe: locators propose
//! requests, a worker pool loads them through a [`StorageSink`], and
//! locators are notified of every completion so they can advance and persist
//! their cursors.

mod model;
mod run;
mod sink;

pub use model::{
    Bid, BundleRef, FetchPlan, FetchResult, FetchRunContext, FetcherRecipe, RecipeBuilder,
    RequestMeta,
};
pub use run::Fetcher;
pub use sink::{
    bytes_stream, BundleContext, ByteStream, ResourceMeta, StorageError, StorageSink,
};

use std::sync::Arc;

/// Protocol-specific byte fetcher. Given one request, it writes zero or more
/// bundles through the sink and returns their references.
///
/// Implementations are shared across workers and must tolerate concurrent
/// calls. Expected per-request failures (bad status, unreachable path) are
/// handled internally by returning an empty vec; returned errors are
/// recorded by the orchestrator and reported to locators as URL errors.
#[async_trait::async_trait]
pub trait BundleLoader: Send + Sync {
    async fn load(
        &self,
        request: &RequestMeta,
        sink: &dyn StorageSink,
        ctx: &FetchRunContext,
    ) -> anyhow::Result<Vec<BundleRef>>;
}

/// Stateful, resumable producer of requests.
#[async_trait::async_trait]
pub trait BundleLocator: Send + Sync {
    /// The next batch of requests. May be empty when temporarily idle or
    /// permanently exhausted; must not block on external I/O indefinitely.
    async fn get_next_urls(&self, ctx: &FetchRunContext) -> anyhow::Result<Vec<RequestMeta>>;

    /// Called once per request after the loader returns. `bundle_refs` is
    /// empty when the load produced nothing.
    async fn handle_url_processed(
        &self,
        _request: &RequestMeta,
        _bundle_refs: &[BundleRef],
        _ctx: &FetchRunContext,
    ) {
    }

    /// Called instead of `handle_url_processed` when the load failed with an
    /// error; implementations record the error and mark the URL handled.
    async fn handle_url_error(&self, _request: &RequestMeta, _error: &str) {}
}

pub type DynLoader = Arc<dyn BundleLoader>;
pub type DynLocator = Arc<dyn BundleLocator>;
pub type DynSink = Arc<dyn StorageSink>;
