use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use dealsync_adapters::{DealSource, HttpDealSink, LoadError, RunContext};
use dealsync_core::Deal;
use dealsync_sync::{SyncConfig, SyncPipeline};
use dealsync_transport::{HttpClientConfig, HttpFetcher};
use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::prelude::*;
use serde_json::json;

const EXPORT: &str = "title,currency,value,status\nA,USD,50,open\nC,EUR,7,won\n";

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

fn config_for(server: &MockServer, reports_dir: Option<&std::path::Path>) -> SyncConfig {
    let mut vars = HashMap::from([
        ("DEALSYNC_API_BASE_URL".to_string(), server.base_url()),
        ("DEALSYNC_API_TOKEN".to_string(), "t0ken".to_string()),
        ("DEALSYNC_OBJECT_ENDPOINT".to_string(), server.base_url()),
        ("DEALSYNC_BUCKET".to_string(), "exports".to_string()),
        ("DEALSYNC_OBJECT_KEY".to_string(), "deals.csv.gz".to_string()),
        ("DEALSYNC_REQUESTS_PER_WINDOW".to_string(), "2".to_string()),
        ("DEALSYNC_WINDOW_MILLIS".to_string(), "50".to_string()),
    ]);
    if let Some(dir) = reports_dir {
        vars.insert(
            "DEALSYNC_REPORTS_DIR".to_string(),
            dir.display().to_string(),
        );
    }
    SyncConfig::from_lookup(|key| vars.get(key).cloned())
}

async fn mock_snapshots(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/exports/deals.csv.gz");
            then.status(200)
                .header("content-type", "application/gzip")
                .body(gzip(EXPORT));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v1/deals")
                .query_param("api_token", "t0ken")
                .query_param("start", "0");
            then.status(200).json_body(json!({
                "success": true,
                "data": [{ "title": "A", "value": 50.0 }, { "title": "B", "value": 10.0 }],
                "additional_data": { "pagination": { "more_items_in_collection": false } }
            }));
        })
        .await;
}

#[tokio::test]
async fn run_once_reconciles_dispatches_and_reports() {
    let server = MockServer::start_async().await;
    mock_snapshots(&server).await;

    let post_a = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v1/deals")
                .query_param("api_token", "t0ken")
                .json_body(json!({ "title": "A", "currency": "USD", "value": 100.0, "status": "open" }));
            then.status(201);
        })
        .await;
    let post_b = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v1/deals")
                .json_body(json!({ "title": "B", "value": 10.0 }));
            then.status(500);
        })
        .await;
    let post_c = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v1/deals")
                .json_body(json!({ "title": "C", "currency": "EUR", "value": 14.0, "status": "won" }));
            then.status(201);
        })
        .await;

    let reports = tempfile::tempdir().expect("tempdir");
    let pipeline = SyncPipeline::new(config_for(&server, Some(reports.path()))).expect("pipeline");
    let run = pipeline.run_once().await.expect("run");

    post_a.assert_async().await;
    post_b.assert_async().await;
    post_c.assert_async().await;

    assert_eq!(run.stats.bulk_records, 2);
    assert_eq!(run.stats.live_records, 2);
    assert_eq!(run.stats.matched, 1);
    assert_eq!(run.stats.value_overrides, 1);
    assert_eq!(run.stats.reconciled, 3);

    assert_eq!(run.summary.total, 3);
    assert_eq!(run.summary.succeeded, 2);
    assert_eq!(run.summary.failed, 1);
    assert_eq!(run.summary.failures[0].title, "B");
    assert_eq!(run.summary.failures[0].reason, "http status 500");

    let report_dir = reports.path().join(run.run_id.to_string());
    let summary: serde_json::Value = serde_json::from_slice(
        &std::fs::read(report_dir.join("summary.json")).expect("summary.json"),
    )
    .expect("parse summary.json");
    assert_eq!(summary["summary"]["failed"], 1);
    assert_eq!(summary["stats"]["bulk_only"], 1);
    let brief = std::fs::read_to_string(report_dir.join("run_brief.md")).expect("run_brief.md");
    assert!(brief.contains("- B: http status 500"));
}

#[tokio::test]
async fn plan_reconciles_without_sending() {
    let server = MockServer::start_async().await;
    mock_snapshots(&server).await;

    let pipeline = SyncPipeline::new(config_for(&server, None)).expect("pipeline");
    let plan = pipeline.plan().await.expect("plan");

    let titles: Vec<_> = plan.deals.iter().map(|d| d.title.as_str()).collect();
    assert_eq!(titles, ["A", "B", "C"]);
    assert_eq!(plan.deals[0].value, 100.0);
    assert_eq!(plan.deals[0].currency.as_deref(), Some("USD"));
    assert_eq!(plan.stats.live_only, 1);
}

#[tokio::test]
async fn failed_bulk_load_aborts_before_dispatch() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/exports/deals.csv.gz");
            then.status(404);
        })
        .await;
    let posts = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/deals");
            then.status(201);
        })
        .await;

    let pipeline = SyncPipeline::new(config_for(&server, None)).expect("pipeline");
    let err = pipeline.run_once().await.expect_err("bulk load should fail");

    let message = format!("{err:#}");
    assert!(message.contains("loading bulk snapshot"), "{message}");
    assert!(message.contains("http status 404"), "{message}");
    posts.assert_calls_async(0).await;
}

struct FixedSource(Vec<Deal>);

#[async_trait]
impl DealSource for FixedSource {
    fn source_name(&self) -> &'static str {
        "bulk"
    }

    async fn load(&self, _ctx: &RunContext) -> Result<Vec<Deal>, LoadError> {
        Ok(self.0.clone())
    }
}

struct RejectingLiveSource;

#[async_trait]
impl DealSource for RejectingLiveSource {
    fn source_name(&self) -> &'static str {
        "live"
    }

    async fn load(&self, _ctx: &RunContext) -> Result<Vec<Deal>, LoadError> {
        Err(LoadError::Rejected {
            start: 0,
            message: "unauthorized access".into(),
        })
    }
}

#[tokio::test]
async fn rejected_live_load_aborts_with_swapped_collaborators() {
    let server = MockServer::start_async().await;
    let posts = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/deals");
            then.status(201);
        })
        .await;

    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"));
    let sink = HttpDealSink::new(http, &server.base_url(), None).expect("sink");
    let pipeline = SyncPipeline::new(config_for(&server, None))
        .expect("pipeline")
        .with_collaborators(
            Box::new(FixedSource(vec![Deal::new("A", 100.0)])),
            Box::new(RejectingLiveSource),
            Arc::new(sink),
        );

    let err = pipeline.run_once().await.expect_err("live load should fail");

    let message = format!("{err:#}");
    assert!(message.contains("loading live snapshot"), "{message}");
    assert!(message.contains("unauthorized access"), "{message}");
    posts.assert_calls_async(0).await;
}

#[tokio::test]
async fn swapped_collaborators_drive_the_whole_run() {
    let server = MockServer::start_async().await;
    let posts = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v1/deals")
                .json_body(json!({ "title": "A", "value": 100.0 }));
            then.status(201);
        })
        .await;

    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"));
    let sink = HttpDealSink::new(http, &server.base_url(), None).expect("sink");
    let pipeline = SyncPipeline::new(config_for(&server, None))
        .expect("pipeline")
        .with_collaborators(
            Box::new(FixedSource(vec![Deal::new("A", 100.0)])),
            Box::new(FixedSource(vec![Deal::new("A", 40.0)])),
            Arc::new(sink),
        );

    let run = pipeline.run_once().await.expect("run");

    posts.assert_async().await;
    assert_eq!(run.stats.value_overrides, 1);
    assert!(run.summary.is_clean());
}
