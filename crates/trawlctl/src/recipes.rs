//! Named acquisition recipes, assembled from environment settings.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use credentials::CredentialProvider;
use fetcher::FetcherRecipe;
use kv::KvStore;
use loaders::{ErrorHandler, HttpLoader, JsonProbe, SftpLoader};
use locators::{
    DirectoryBundleLocator, NarrowingStrategy, PaginatedApiBundleLocator, PaginatedApiConfig,
    PaginationStrategy, QueryBuilder, RequeueFailedLocator, SingleApiBundleLocator,
};
use protocols::{
    AuthMechanism, HttpConfig, HttpManager, OAuthConfig, OncePerIntervalGate, ScheduledDailyGate,
    SftpConfig, SftpManager,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct RecipeDeps {
    pub config_name: String,
    pub store: Arc<dyn KvStore>,
    pub credentials: Arc<dyn CredentialProvider>,
}

pub const CONFIG_NAMES: &[&str] = &["api", "sftp"];

pub fn build(name: &str, deps: &RecipeDeps) -> anyhow::Result<FetcherRecipe> {
    match name {
        "api" => api_recipe(deps),
        "sftp" => sftp_recipe(deps),
        other => anyhow::bail!(
            "unknown configuration '{other}', expected one of: {}",
            CONFIG_NAMES.join(", ")
        ),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_date(name: &str) -> anyhow::Result<Option<NaiveDate>> {
    env_opt(name)
        .map(|v| {
            NaiveDate::parse_from_str(&v, "%Y-%m-%d").with_context(|| format!("parsing {name}"))
        })
        .transpose()
}

/// Cursor-paginated API walker with optional OAuth, prefix narrowing, a
/// gap-filling backward pass, and replay of previously failed pages.
fn api_recipe(deps: &RecipeDeps) -> anyhow::Result<FetcherRecipe> {
    let base_url =
        env_opt("TRAWLER_API_BASE_URL").context("TRAWLER_API_BASE_URL is required")?;

    let auth = match env_opt("TRAWLER_API_TOKEN_URL") {
        Some(token_url) => AuthMechanism::oauth_client_credentials(OAuthConfig::new(
            &token_url,
            deps.credentials.clone(),
            &deps.config_name,
        )),
        None => AuthMechanism::None,
    };

    let rate_limit_rps = env_opt("TRAWLER_API_RATE_LIMIT")
        .map(|v| v.parse::<f64>().context("parsing TRAWLER_API_RATE_LIMIT"))
        .transpose()?
        .unwrap_or(2.0);

    let mut default_headers = BTreeMap::new();
    default_headers.insert("User-Agent".to_string(), "trawler/0.1".to_string());
    default_headers.insert("Accept".to_string(), "application/json".to_string());
    let http = Arc::new(HttpManager::new(
        HttpConfig {
            timeout: Duration::from_secs(120),
            default_headers,
            rate_limit_rps,
            max_retries: 5,
            max_redirects: 5,
        },
        auth,
    )?);

    let pagination = PaginationStrategy {
        cursor_field: env_opt("TRAWLER_API_CURSOR_FIELD")
            .unwrap_or_else(|| "curseurSuivant".to_string()),
        total_field: env_opt("TRAWLER_API_TOTAL_FIELD").unwrap_or_else(|| "total".to_string()),
        count_field: env_opt("TRAWLER_API_COUNT_FIELD").unwrap_or_else(|| "nombre".to_string()),
        max_records: 20_000,
    };

    let error_handler: ErrorHandler = Arc::new(|url, status| match status {
        200 => true,
        404 => {
            tracing::warn!(url, "no records for query");
            false
        }
        status => {
            tracing::error!(url, status, "unexpected response status");
            false
        }
    });

    let loader = HttpLoader::new(http)
        .with_error_handler(error_handler)
        .with_json_probe(JsonProbe::fields(&pagination.probe_fields()));

    let date_end = env_date("TRAWLER_API_DATE_END")?.unwrap_or_else(|| Utc::now().date_naive());
    let date_start =
        env_date("TRAWLER_API_DATE_START")?.unwrap_or(date_end - chrono::Duration::days(5));

    let date_field =
        env_opt("TRAWLER_API_DATE_FIELD").unwrap_or_else(|| "last_modified".to_string());
    let query_builder: QueryBuilder = Arc::new(move |date, narrowing| {
        let window = format!("{date_field}:[{date}T00:00:00%20TO%20{date}T23:59:59]");
        match narrowing {
            Some(narrowing) => format!("{narrowing}*%20AND%20{window}"),
            None => window,
        }
    });

    let paginated_config = PaginatedApiConfig {
        base_url,
        date_start,
        date_end: Some(date_end),
        max_records_per_page: env_opt("TRAWLER_API_PAGE_SIZE")
            .map(|v| v.parse().context("parsing TRAWLER_API_PAGE_SIZE"))
            .transpose()?
            .unwrap_or(1000),
        rate_limit_rps,
        headers: BTreeMap::new(),
        query_params: Vec::new(),
        pagination,
        persistence_prefix: format!("{}_api_provider", deps.config_name),
    };

    let mut main_locator =
        PaginatedApiBundleLocator::new(deps.store.clone(), paginated_config.clone())
            .with_query_builder(query_builder.clone());
    if let Some(field) = env_opt("TRAWLER_API_NARROW_FIELD") {
        main_locator = main_locator.with_narrowing_strategy(two_digit_prefix_narrowing(field));
    }

    let mut builder = FetcherRecipe::builder()
        .use_bundle_loader(Arc::new(loader))
        .add_bundle_locator(Arc::new(main_locator));

    if env_opt("TRAWLER_API_GAP_FILL").is_some() {
        let gap_config = PaginatedApiConfig {
            persistence_prefix: format!("{}_gap_provider", deps.config_name),
            ..paginated_config.clone()
        };
        let gap_locator = PaginatedApiBundleLocator::gap_fill(deps.store.clone(), gap_config)
            .with_query_builder(query_builder);
        builder = builder.add_bundle_locator(Arc::new(gap_locator));
    }

    if let Some(max_retries) = env_opt("TRAWLER_API_REQUEUE_RETRIES") {
        let max_retries = max_retries
            .parse()
            .context("parsing TRAWLER_API_REQUEUE_RETRIES")?;
        builder = builder.add_bundle_locator(Arc::new(RequeueFailedLocator::new(
            deps.store.clone(),
            &format!("{}_api_provider", deps.config_name),
            &paginated_config.base_url,
            max_retries,
        )));
    }

    if let Some(urls) = env_opt("TRAWLER_API_EXTRA_URLS") {
        let urls: Vec<String> = urls.split(',').map(str::to_string).collect();
        builder = builder.add_bundle_locator(Arc::new(SingleApiBundleLocator::new(
            deps.store.clone(),
            urls,
            &format!("{}_single_provider", deps.config_name),
        )));
    }

    Ok(builder.build())
}

/// SFTP directory sweep with schedule gates.
fn sftp_recipe(deps: &RecipeDeps) -> anyhow::Result<FetcherRecipe> {
    let remote_dir =
        env_opt("TRAWLER_SFTP_REMOTE_DIR").context("TRAWLER_SFTP_REMOTE_DIR is required")?;
    let pattern = env_opt("TRAWLER_SFTP_PATTERN").unwrap_or_else(|| "*".to_string());

    let mut manager = SftpManager::new(
        deps.credentials.clone(),
        SftpConfig {
            config_name: deps.config_name.clone(),
            connect_timeout: Duration::from_secs(20),
            rate_limit_rps: env_opt("TRAWLER_SFTP_RATE_LIMIT")
                .map(|v| v.parse::<f64>().context("parsing TRAWLER_SFTP_RATE_LIMIT"))
                .transpose()?
                .unwrap_or(5.0),
            accept_unknown_host_keys: matches!(
                env_opt("TRAWLER_SFTP_ACCEPT_UNKNOWN_HOST_KEYS").as_deref(),
                Some("1") | Some("true")
            ),
        },
    );

    if let Some(time_of_day) = env_opt("TRAWLER_SFTP_DAILY_AT") {
        manager = manager.with_daily_gate(ScheduledDailyGate::new(&time_of_day, "UTC", true)?);
    }
    if let Some(interval) = env_opt("TRAWLER_SFTP_MIN_INTERVAL_SECS") {
        let interval = interval
            .parse()
            .context("parsing TRAWLER_SFTP_MIN_INTERVAL_SECS")?;
        manager = manager.with_interval_gate(OncePerIntervalGate::new(
            Duration::from_secs(interval),
            Duration::from_secs(30),
        ));
    }
    let sftp = Arc::new(manager);

    let loader = SftpLoader::new(sftp.clone()).with_pattern(&pattern)?;
    let locator = DirectoryBundleLocator::new(
        sftp,
        deps.store.clone(),
        &remote_dir,
        &pattern,
        &format!("{}_sftp_provider", deps.config_name),
    )?;

    Ok(FetcherRecipe::builder()
        .use_bundle_loader(Arc::new(loader))
        .add_bundle_locator(Arc::new(locator))
        .build())
}

/// Two-digit numeric prefixes `<field>:00` through `<field>:99`; returns its
/// input unchanged at the end of the range.
fn two_digit_prefix_narrowing(field: String) -> NarrowingStrategy {
    Arc::new(move |current| match current {
        None => format!("{field}:00"),
        Some(current) => {
            let value = current
                .rsplit(':')
                .next()
                .and_then(|v| v.parse::<u32>().ok());
            match value {
                Some(value) if value < 99 => format!("{field}:{:02}", value + 1),
                _ => current.to_string(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_walks_the_prefix_space() {
        let narrowing = two_digit_prefix_narrowing("id".to_string());
        assert_eq!(narrowing(None), "id:00");
        assert_eq!(narrowing(Some("id:00")), "id:01");
        assert_eq!(narrowing(Some("id:42")), "id:43");
        // End of range: the sentinel is the unchanged value.
        assert_eq!(narrowing(Some("id:99")), "id:99");
    }
}
