//! End-to-end runs wiring real loaders, locators, and sinks together.

use fetcher::{FetchPlan, FetchRunContext, Fetcher, FetcherRecipe};
use kv::MemoryKvStore;
use loaders::{HttpLoader, JsonProbe, SftpLoader};
use locators::{
    DirectoryBundleLocator, PaginatedApiBundleLocator, PaginatedApiConfig, PaginationStrategy,
    SingleApiBundleLocator,
};
use protocols::{AuthMechanism, HttpConfig, HttpManager};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use test_support::{FakeSftp, FixtureResponse, FixtureServer, RecordingSink};

fn http_manager() -> Arc<HttpManager> {
    Arc::new(
        HttpManager::new(
            HttpConfig {
                rate_limit_rps: 0.0,
                ..HttpConfig::default()
            },
            AuthMechanism::None,
        )
        .unwrap(),
    )
}

fn fetcher(recipe: FetcherRecipe, sink: &RecordingSink) -> Fetcher {
    Fetcher::new(recipe, Arc::new(sink.clone())).with_poll_timeout(Duration::from_millis(50))
}

fn plan(concurrency: usize) -> FetchPlan {
    FetchPlan::new(FetchRunContext::new("e2e"), concurrency)
}

#[tokio::test]
async fn http_single_url_end_to_end() {
    let server = FixtureServer::always(FixtureResponse::ok("text/plain", "hello")).await;
    let sink = RecordingSink::new();

    let locator = SingleApiBundleLocator::new(
        Arc::new(MemoryKvStore::default()),
        vec![server.url("/a")],
        "e2e_single",
    );
    let recipe = FetcherRecipe::builder()
        .use_bundle_loader(Arc::new(HttpLoader::new(http_manager())))
        .add_bundle_locator(Arc::new(locator))
        .build();

    let result = fetcher(recipe, &sink).run(plan(2)).await;

    assert_eq!(result.processed_count, 1);
    assert!(result.errors.is_empty());

    let bundles = sink.closed_bundles();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].resources_count, 1);

    let resources = sink.resources();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].1.len(), 5);
}

#[tokio::test]
async fn sftp_directory_filter_end_to_end() {
    let tree = Arc::new(
        FakeSftp::new()
            .with_file("/d/a.txt", b"alpha", 1)
            .with_file("/d/b.log", b"beta", 2)
            .with_file("/d/c.txt", b"gamma", 3),
    );
    let sink = RecordingSink::new();

    let store = Arc::new(MemoryKvStore::default());
    let locator =
        DirectoryBundleLocator::new(tree.clone(), store, "/d", "*.txt", "e2e_dir").unwrap();
    let recipe = FetcherRecipe::builder()
        .use_bundle_loader(Arc::new(SftpLoader::new(tree)))
        .add_bundle_locator(Arc::new(locator))
        .build();

    let result = fetcher(recipe, &sink).run(plan(2)).await;

    assert_eq!(result.processed_count, 2);
    let urls: Vec<_> = sink
        .resources()
        .iter()
        .map(|(meta, _)| meta.url.clone())
        .collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.iter().all(|url| url.ends_with(".txt")));
    assert!(!urls.iter().any(|url| url.contains("b.log")));
}

#[tokio::test]
async fn paginated_api_narrows_and_advances_dates() {
    // Page one returns a full page and a continuation cursor; every later
    // page is empty, which walks the locator through its two-day range.
    let server = FixtureServer::spawn(|target| {
        if target.contains("curseur=*") && target.contains("2024-01-15") {
            FixtureResponse::ok_json(r#"{"curseurSuivant":"abc","nombre":1000,"total":1500}"#)
        } else {
            FixtureResponse::ok_json(r#"{"nombre":0,"total":0}"#)
        }
    })
    .await;
    let sink = RecordingSink::new();

    let pagination = PaginationStrategy {
        cursor_field: "curseurSuivant".to_string(),
        total_field: "total".to_string(),
        count_field: "nombre".to_string(),
        max_records: 20_000,
    };
    let locator = PaginatedApiBundleLocator::new(
        Arc::new(MemoryKvStore::default()),
        PaginatedApiConfig {
            base_url: server.url("/records"),
            date_start: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            date_end: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 16).unwrap()),
            max_records_per_page: 1000,
            rate_limit_rps: 0.0,
            headers: BTreeMap::new(),
            query_params: Vec::new(),
            pagination: pagination.clone(),
            persistence_prefix: "e2e_paginated".to_string(),
        },
    );
    let loader =
        HttpLoader::new(http_manager()).with_json_probe(JsonProbe::fields(&pagination.probe_fields()));

    let recipe = FetcherRecipe::builder()
        .use_bundle_loader(Arc::new(loader))
        .add_bundle_locator(Arc::new(locator))
        .build();

    let result = fetcher(recipe, &sink).run(plan(1)).await;

    // Day one page 1, day one page 2 (cursor=abc), day two page 1.
    assert_eq!(result.processed_count, 3);
    let requests = server.requests();
    assert!(requests.iter().any(|r| r.contains("curseur=abc")));
    assert!(requests
        .iter()
        .any(|r| r.contains("2024-01-16") && r.contains("curseur=*")));
}

#[tokio::test]
async fn gzip_payloads_are_expanded_end_to_end() {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"<html/>").unwrap();
    let gzipped = encoder.finish().unwrap();

    let server = FixtureServer::always(FixtureResponse::ok("application/gzip", gzipped)).await;
    let recording = RecordingSink::new();
    let sink = storage::StorageBuilder::new()
        .custom_storage(Arc::new(recording.clone()))
        .decorators(true, false)
        .build()
        .await;

    let locator = SingleApiBundleLocator::new(
        Arc::new(MemoryKvStore::default()),
        vec![server.url("/x.html.gz")],
        "e2e_gzip",
    );
    let recipe = FetcherRecipe::builder()
        .use_bundle_loader(Arc::new(HttpLoader::new(http_manager())))
        .add_bundle_locator(Arc::new(locator))
        .build();

    let result = Fetcher::new(recipe, sink)
        .with_poll_timeout(Duration::from_millis(50))
        .run(plan(1))
        .await;

    assert_eq!(result.processed_count, 1);
    let resources = recording.resources();
    assert_eq!(resources.len(), 1);
    assert!(resources[0].0.url.ends_with("/x.html"));
    assert_eq!(resources[0].1, b"<html/>");
}
