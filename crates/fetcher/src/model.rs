use crate::{DynLoader, DynLocator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One unit of work. Requests are deduplicated by `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub referer: Option<String>,
}

impl RequestMeta {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            depth: 0,
            referer: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Bundle identifier: unique within the process and lexicographically
/// non-decreasing in creation time, so storage keys bucket by time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Bid(uuid::Uuid);

impl Bid {
    pub fn generate() -> Self {
        // A shared context keeps ids monotonic even within one millisecond.
        static CONTEXT: std::sync::OnceLock<std::sync::Mutex<uuid::timestamp::context::ContextV7>> =
            std::sync::OnceLock::new();
        let context =
            CONTEXT.get_or_init(|| std::sync::Mutex::new(uuid::timestamp::context::ContextV7::new()));
        Bid(uuid::Uuid::new_v7(uuid::Timestamp::now(context)))
    }
}

impl std::fmt::Display for Bid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// The atomic persistence unit produced by one loader invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRef {
    pub bid: Bid,
    pub primary_url: String,
    pub resources_count: u32,
    pub storage_key: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl BundleRef {
    pub fn new(primary_url: impl Into<String>) -> Self {
        Self {
            bid: Bid::generate(),
            primary_url: primary_url.into(),
            resources_count: 0,
            storage_key: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}

/// Run-scoped context threaded through every loader and locator call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRunContext {
    pub run_id: String,
    #[serde(default)]
    pub shared: BTreeMap<String, serde_json::Value>,
}

impl FetchRunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            shared: BTreeMap::new(),
        }
    }
}

/// Inputs of one [`crate::Fetcher::run`] invocation.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub initial_requests: Vec<RequestMeta>,
    pub context: FetchRunContext,
    pub concurrency: usize,
}

impl FetchPlan {
    pub fn new(context: FetchRunContext, concurrency: usize) -> Self {
        Self {
            initial_requests: Vec::new(),
            context,
            concurrency: concurrency.max(1),
        }
    }
}

/// Outcome of a run. `processed_count` counts every dequeued-and-handled
/// request, successful or not.
#[derive(Debug)]
pub struct FetchResult {
    pub processed_count: usize,
    pub errors: Vec<String>,
    pub context: FetchRunContext,
}

/// The loader and locators that make up one acquisition pipeline.
#[derive(Clone)]
pub struct FetcherRecipe {
    pub bundle_loader: DynLoader,
    pub bundle_locators: Vec<DynLocator>,
}

impl FetcherRecipe {
    pub fn builder() -> RecipeBuilder {
        RecipeBuilder::default()
    }
}

#[derive(Default)]
pub struct RecipeBuilder {
    loader: Option<DynLoader>,
    locators: Vec<DynLocator>,
}

impl RecipeBuilder {
    pub fn use_bundle_loader(mut self, loader: DynLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn add_bundle_locator(mut self, locator: DynLocator) -> Self {
        self.locators.push(locator);
        self
    }

    /// Panics if no loader was configured; a recipe without a loader cannot
    /// make progress.
    pub fn build(self) -> FetcherRecipe {
        FetcherRecipe {
            bundle_loader: self.loader.expect("recipe requires a bundle loader"),
            bundle_locators: self.locators,
        }
    }
}
