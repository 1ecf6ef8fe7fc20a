use crate::persist::LocatorPersistence;
use chrono::{NaiveDate, Utc};
use fetcher::{BundleLocator, BundleRef, FetchRunContext, RequestMeta};
use kv::KvStore;
use protocols::RateLimiter;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

const BATCH_SIZE: usize = 5;
const CURSOR_START: &str = "*";

/// Response fields carrying pagination state, as probed into bundle meta by
/// the HTTP loader.
#[derive(Debug, Clone)]
pub struct PaginationStrategy {
    pub cursor_field: String,
    pub total_field: String,
    pub count_field: String,
    /// The API's hard cap on records per query; queries expected to exceed
    /// it need narrowing.
    pub max_records: u64,
}

impl PaginationStrategy {
    pub fn probe_fields(&self) -> Vec<&str> {
        vec![&self.cursor_field, &self.total_field, &self.count_field]
    }
}

/// Builds the `q` query parameter from a date and optional narrowing.
pub type QueryBuilder = Arc<dyn Fn(&str, Option<&str>) -> String + Send + Sync>;
/// Yields the next narrowing; returning the argument unchanged means "no
/// further narrowings for this date".
pub type NarrowingStrategy = Arc<dyn Fn(Option<&str>) -> String + Send + Sync>;
pub type DateFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateDirection {
    Forward,
    Backward,
}

#[derive(Clone)]
pub struct PaginatedApiConfig {
    pub base_url: String,
    pub date_start: NaiveDate,
    pub date_end: Option<NaiveDate>,
    pub max_records_per_page: u32,
    pub rate_limit_rps: f64,
    pub headers: BTreeMap<String, String>,
    pub query_params: Vec<(String, String)>,
    pub pagination: PaginationStrategy,
    pub persistence_prefix: String,
}

/// Cursor-paginated, date-partitioned API walker.
///
/// For each date it pages through results with the API cursor; when a page
/// comes back empty or short it narrows the query (prefix subdivision) to
/// stay under the API's result cap, and when narrowings are exhausted it
/// moves to the next date and resets the cursor to `"*"`.
pub struct PaginatedApiBundleLocator {
    config: PaginatedApiConfig,
    direction: DateDirection,
    date_filter: Option<DateFilter>,
    query_builder: Option<QueryBuilder>,
    narrowing: Option<NarrowingStrategy>,
    limiter: RateLimiter,
    persistence: LocatorPersistence,
    state: Mutex<PageState>,
}

#[derive(Default)]
struct PageState {
    processed: BTreeSet<String>,
    queue: VecDeque<String>,
    current_date: Option<NaiveDate>,
    cursor: String,
    narrowing: Option<String>,
    initialized: bool,
    loaded: bool,
    exhausted: bool,
}

impl PaginatedApiBundleLocator {
    /// Walk dates forward from `date_start`.
    pub fn new(store: Arc<dyn KvStore>, config: PaginatedApiConfig) -> Self {
        Self::with_direction(store, config, DateDirection::Forward)
    }

    /// Walk dates backward from `date_end`, filling historical gaps.
    pub fn gap_fill(store: Arc<dyn KvStore>, config: PaginatedApiConfig) -> Self {
        Self::with_direction(store, config, DateDirection::Backward)
    }

    fn with_direction(
        store: Arc<dyn KvStore>,
        config: PaginatedApiConfig,
        direction: DateDirection,
    ) -> Self {
        let persistence =
            LocatorPersistence::new(store, &config.persistence_prefix, &config.base_url);
        let limiter = RateLimiter::per_second(config.rate_limit_rps);
        Self {
            config,
            direction,
            date_filter: None,
            query_builder: None,
            narrowing: None,
            limiter,
            persistence,
            state: Mutex::new(PageState::default()),
        }
    }

    pub fn with_date_filter(mut self, filter: DateFilter) -> Self {
        self.date_filter = Some(filter);
        self
    }

    pub fn with_query_builder(mut self, builder: QueryBuilder) -> Self {
        self.query_builder = Some(builder);
        self
    }

    pub fn with_narrowing_strategy(mut self, narrowing: NarrowingStrategy) -> Self {
        self.narrowing = Some(narrowing);
        self
    }

    fn date_end(&self) -> NaiveDate {
        self.config.date_end.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn build_url(&self, state: &PageState) -> Option<String> {
        let date = state.current_date?;
        let date_str = date.format("%Y-%m-%d").to_string();

        let query = match &self.query_builder {
            Some(builder) => builder(&date_str, state.narrowing.as_deref()),
            None => format!("date:[{date_str}T00:00:00%20TO%20{date_str}T23:59:59]"),
        };

        let mut params = vec![
            ("nombre".to_string(), self.config.max_records_per_page.to_string()),
            ("curseur".to_string(), state.cursor.clone()),
            ("q".to_string(), query),
        ];
        params.extend(self.config.query_params.iter().cloned());

        let query_string = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        Some(format!("{}?{}", self.config.base_url, query_string))
    }

    /// Move to the next narrowing for the current date, or to the next date
    /// when the strategy signals exhaustion by returning its input.
    fn advance_narrowing_or_date(&self, state: &mut PageState) {
        if let Some(narrowing) = &self.narrowing {
            let next = narrowing(state.narrowing.as_deref());
            if state.narrowing.as_deref() != Some(next.as_str()) {
                tracing::debug!(narrowing = %next, "advancing narrowing");
                state.narrowing = Some(next);
                state.cursor = CURSOR_START.to_string();
                return;
            }
        }
        self.advance_date(state);
    }

    fn advance_date(&self, state: &mut PageState) {
        state.cursor = CURSOR_START.to_string();
        state.narrowing = None;

        let Some(current) = state.current_date else {
            state.exhausted = true;
            return;
        };
        let next = match self.direction {
            DateDirection::Forward => current + chrono::Duration::days(1),
            DateDirection::Backward => current - chrono::Duration::days(1),
        };
        let out_of_range = match self.direction {
            DateDirection::Forward => next > self.date_end(),
            DateDirection::Backward => next < self.config.date_start,
        };
        if out_of_range {
            tracing::info!(base_url = %self.config.base_url, "date range exhausted");
            state.exhausted = true;
        } else {
            state.current_date = Some(next);
        }
    }

    /// Ensure the queue holds the next page URL, hopping over filtered dates
    /// and already-processed pages.
    fn refill(&self, state: &mut PageState) {
        while state.queue.is_empty() && !state.exhausted {
            if let (Some(filter), Some(date)) = (&self.date_filter, state.current_date) {
                if !filter(&date.format("%Y-%m-%d").to_string()) {
                    self.advance_date(state);
                    continue;
                }
            }
            match self.build_url(state) {
                Some(url) if !state.processed.contains(&url) => {
                    state.queue.push_back(url);
                }
                Some(_) => {
                    // Page already fetched in an earlier run; move on.
                    self.advance_narrowing_or_date(state);
                }
                None => state.exhausted = true,
            }
        }
    }

    async fn save(&self, state: &PageState) {
        self.persistence.save_processed(&state.processed).await;
        self.persistence
            .save_state(json!({
                "current_date": state.current_date.map(|d| d.format("%Y-%m-%d").to_string()),
                "current_cursor": state.cursor,
                "current_narrowing": state.narrowing,
                "initialized": state.initialized,
                "exhausted": state.exhausted,
                "last_request_time": Utc::now().timestamp_millis() as f64 / 1000.0,
            }))
            .await;
    }

    async fn load(&self, state: &mut PageState) {
        state.processed = self.persistence.load_processed().await;
        if let Some(saved) = self.persistence.load_state().await {
            state.current_date = saved
                .get("current_date")
                .and_then(|v| v.as_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            if let Some(cursor) = saved.get("current_cursor").and_then(|v| v.as_str()) {
                state.cursor = cursor.to_string();
            }
            state.narrowing = saved
                .get("current_narrowing")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            state.initialized = saved
                .get("initialized")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            state.exhausted = saved
                .get("exhausted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
        }
        state.loaded = true;
    }
}

#[async_trait::async_trait]
impl BundleLocator for PaginatedApiBundleLocator {
    async fn get_next_urls(&self, _ctx: &FetchRunContext) -> anyhow::Result<Vec<RequestMeta>> {
        self.limiter.acquire().await;
        let mut state = self.state.lock().await;

        if !state.loaded {
            self.load(&mut state).await;
        }
        if !state.initialized {
            let start = match self.direction {
                DateDirection::Forward => self.config.date_start,
                DateDirection::Backward => self.date_end(),
            };
            state.current_date.get_or_insert(start);
            if state.cursor.is_empty() {
                state.cursor = CURSOR_START.to_string();
            }
            state.initialized = true;
            tracing::info!(
                base_url = %self.config.base_url,
                date_start = %self.config.date_start,
                date_end = %self.date_end(),
                "initialized paginated locator"
            );
        }

        self.refill(&mut state);

        let mut urls = Vec::new();
        while let Some(url) = state.queue.pop_front() {
            if state.processed.insert(url.clone()) {
                urls.push(RequestMeta::new(url).with_headers(self.config.headers.clone()));
            }
            if urls.len() >= BATCH_SIZE {
                break;
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
        let mut state = self.state.lock().await;
        state.processed.insert(request.url.clone());
        self.persistence.save_result(&request.url, bundle_refs).await;

        if !state.exhausted {
            let meta = bundle_refs.first().map(|bundle| &bundle.meta);
            let next_cursor = meta
                .and_then(|m| m.get(&self.config.pagination.cursor_field))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let count = meta
                .and_then(|m| m.get(&self.config.pagination.count_field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);

            let full_page = count >= u64::from(self.config.max_records_per_page);
            match next_cursor {
                Some(next) if full_page && next != state.cursor => {
                    // More pages behind this cursor.
                    state.cursor = next;
                }
                _ => self.advance_narrowing_or_date(&mut state),
            }
            self.refill(&mut state);
        }

        self.save(&state).await;
    }

    async fn handle_url_error(&self, request: &RequestMeta, error: &str) {
        let mut state = self.state.lock().await;
        state.processed.insert(request.url.clone());
        self.persistence.save_error(&request.url, error).await;
        self.save(&state).await;
    }
}
