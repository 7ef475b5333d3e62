//! Reconciliation, rate-limited dispatch and run orchestration for dealsync.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dealsync_adapters::{
    BulkLoader, BulkLocation, DealSource, HttpDealSink, LiveLoader, ObjectStoreLocation, RunContext,
    SinkError, UpdateSink, DEFAULT_PAGE_LIMIT,
};
use dealsync_core::{Deal, ReconciledSet};
use dealsync_transport::{HttpClientConfig, HttpFetcher, RateLimitConfig, WindowLimiter};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealsync-sync";

/// Largest accepted `max_in_flight`; larger configured values are capped to it.
pub const MAX_IN_FLIGHT_CEILING: usize = 4096;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub bulk_location: BulkLocation,
    pub page_limit: u32,
    pub dispatch: DispatchConfig,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through `lookup`; blank values count as unset and
    /// numbers that do not parse into their field's type fall back to their defaults.
    /// `max_in_flight` is capped at [`MAX_IN_FLIGHT_CEILING`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bulk_location = if let Some(path) = get("DEALSYNC_BULK_FILE") {
            BulkLocation::File(PathBuf::from(path))
        } else if let Some(url) = get("DEALSYNC_BULK_URL") {
            BulkLocation::Url(url)
        } else {
            BulkLocation::ObjectStore(ObjectStoreLocation {
                bucket: get("DEALSYNC_BUCKET").unwrap_or_else(|| "pdw-export.zulu".to_string()),
                key: get("DEALSYNC_OBJECT_KEY")
                    .unwrap_or_else(|| "test_tasks/deals.csv.gz".to_string()),
                region: get("DEALSYNC_REGION").unwrap_or_else(|| "eu-central-1".to_string()),
                endpoint: get("DEALSYNC_OBJECT_ENDPOINT"),
            })
        };

        let defaults = DispatchConfig::default();
        Self {
            api_base_url: get("DEALSYNC_API_BASE_URL")
                .unwrap_or_else(|| "https://testcomp3.pipedrive.com".to_string()),
            api_token: get("DEALSYNC_API_TOKEN"),
            bulk_location,
            page_limit: parse_or(get("DEALSYNC_PAGE_LIMIT"), DEFAULT_PAGE_LIMIT),
            dispatch: DispatchConfig {
                rate: RateLimitConfig {
                    requests_per_window: parse_or(
                        get("DEALSYNC_REQUESTS_PER_WINDOW"),
                        defaults.rate.requests_per_window,
                    ),
                    window_duration: get("DEALSYNC_WINDOW_MILLIS")
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.rate.window_duration),
                },
                max_in_flight: parse_or(get("DEALSYNC_MAX_IN_FLIGHT"), defaults.max_in_flight)
                    .min(MAX_IN_FLIGHT_CEILING),
            },
            user_agent: get("DEALSYNC_USER_AGENT").unwrap_or_else(|| "dealsync/0.1".to_string()),
            http_timeout_secs: parse_or(get("DEALSYNC_HTTP_TIMEOUT_SECS"), 20),
            reports_dir: get("DEALSYNC_REPORTS_DIR").map(PathBuf::from),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Counters describing what a reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub bulk_records: usize,
    pub live_records: usize,
    /// Records dropped because a later record in the same source had the same title.
    pub bulk_duplicates: usize,
    pub live_duplicates: usize,
    pub matched: usize,
    pub value_overrides: usize,
    pub bulk_only: usize,
    pub live_only: usize,
    pub reconciled: usize,
}

/// Merge both snapshots into one set keyed by title. The bulk export is
/// authoritative for `value`; everything else comes from the live record.
pub fn reconcile(bulk: Vec<Deal>, live: Vec<Deal>) -> ReconciledSet {
    reconcile_with_stats(bulk, live).0
}

pub fn reconcile_with_stats(bulk: Vec<Deal>, live: Vec<Deal>) -> (ReconciledSet, ReconcileStats) {
    let mut stats = ReconcileStats {
        bulk_records: bulk.len(),
        live_records: live.len(),
        ..ReconcileStats::default()
    };

    let bulk_by_title = index_by_title(bulk, &mut stats.bulk_duplicates);
    let mut merged = index_by_title(live, &mut stats.live_duplicates);
    let live_unique = merged.len();

    for (title, bulk_deal) in bulk_by_title {
        match merged.get_mut(&title) {
            Some(live_deal) => {
                stats.matched += 1;
                if live_deal.value != bulk_deal.value {
                    live_deal.value = bulk_deal.value;
                    stats.value_overrides += 1;
                }
                // live wins for optional fields it actually carries
                if live_deal.currency.is_none() {
                    live_deal.currency = bulk_deal.currency;
                }
                if live_deal.status.is_none() {
                    live_deal.status = bulk_deal.status;
                }
            }
            None => {
                stats.bulk_only += 1;
                merged.insert(title, bulk_deal);
            }
        }
    }

    stats.live_only = live_unique - stats.matched;
    stats.reconciled = merged.len();
    (merged, stats)
}

fn index_by_title(deals: Vec<Deal>, duplicates: &mut usize) -> ReconciledSet {
    let mut by_title = BTreeMap::new();
    for deal in deals {
        if by_title.insert(deal.title.clone(), deal).is_some() {
            *duplicates += 1;
        }
    }
    by_title
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub rate: RateLimitConfig,
    /// Upper bound on outstanding requests, across windows.
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rate: RateLimitConfig::default(),
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("sink task failed: {0}")]
    Task(String),
    #[error("cancelled before dispatch")]
    Cancelled,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub title: String,
    /// Absent when no response was received.
    pub http_status: Option<u16>,
    pub error: Option<DispatchError>,
}

impl DispatchOutcome {
    pub fn responded(title: impl Into<String>, http_status: u16) -> Self {
        Self {
            title: title.into(),
            http_status: Some(http_status),
            error: None,
        }
    }

    pub fn failed(title: impl Into<String>, error: DispatchError) -> Self {
        Self {
            title: title.into(),
            http_status: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.http_status, Some(200..=299))
    }

    pub fn failure_reason(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        Some(match (&self.error, self.http_status) {
            (Some(err), _) => err.to_string(),
            (None, Some(status)) => format!("http status {status}"),
            (None, None) => "no response".to_string(),
        })
    }
}

/// Send every record in `records` through `sink` under the configured rate limit.
///
/// Returns once every issued request has completed, with one outcome per record.
pub async fn dispatch(
    ctx: &RunContext,
    records: ReconciledSet,
    sink: Arc<dyn UpdateSink>,
    config: &DispatchConfig,
) -> Vec<DispatchOutcome> {
    dispatch_until(ctx, records, sink, config, std::future::pending()).await
}

/// Like [`dispatch`], but stops issuing new requests once `shutdown` resolves.
///
/// Requests already in flight still run to completion; records never issued are
/// reported as [`DispatchError::Cancelled`].
pub async fn dispatch_until<F>(
    ctx: &RunContext,
    records: ReconciledSet,
    sink: Arc<dyn UpdateSink>,
    config: &DispatchConfig,
    shutdown: F,
) -> Vec<DispatchOutcome>
where
    F: Future<Output = ()>,
{
    let limiter = WindowLimiter::new(config.rate);
    let in_flight = Arc::new(Semaphore::new(config.max_in_flight.clamp(1, Semaphore::MAX_PERMITS)));
    let (tx, mut rx) = mpsc::unbounded_channel::<DispatchOutcome>();
    let mut tasks = JoinSet::new();
    let total = records.len();
    let mut pending = records.into_values();
    tokio::pin!(shutdown);

    while let Some(deal) = pending.next() {
        let admitted = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            permit = admit(&limiter, &in_flight) => Some(permit),
        };

        let Some(permit) = admitted else {
            warn!(skipped = 1 + pending.len(), "dispatch cancelled; remaining deals were not sent");
            for skipped in std::iter::once(deal).chain(pending.by_ref()) {
                let _ = tx.send(DispatchOutcome::failed(skipped.title, DispatchError::Cancelled));
            }
            break;
        };

        let sink = Arc::clone(&sink);
        let tx = tx.clone();
        let ctx = *ctx;
        let span = info_span!("dispatch_request", title = %deal.title);
        tasks.spawn(
            async move {
                let _permit = permit;
                let title = deal.title.clone();
                // a panicking sink still yields an outcome for its record
                let call = tokio::spawn(async move { sink.send(&ctx, deal).await }.in_current_span());
                let outcome = match call.await {
                    Ok(Ok(status)) => DispatchOutcome::responded(title, status),
                    Ok(Err(err)) => DispatchOutcome::failed(title, err.into()),
                    Err(err) => DispatchOutcome::failed(title, DispatchError::Task(err.to_string())),
                };
                match outcome.failure_reason() {
                    None => debug!(status = ?outcome.http_status, "deal dispatched"),
                    Some(reason) => warn!(%reason, "deal dispatch failed"),
                }
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
    }

    while tasks.join_next().await.is_some() {}
    drop(tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    outcomes
}

async fn admit(limiter: &WindowLimiter, in_flight: &Arc<Semaphore>) -> OwnedSemaphorePermit {
    let permit = Arc::clone(in_flight)
        .acquire_owned()
        .await
        .expect("semaphore not closed");
    limiter.acquire().await;
    permit
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<FailureEntry>,
}

impl Summary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub fn summarize(outcomes: &[DispatchOutcome]) -> Summary {
    let mut failures: Vec<FailureEntry> = outcomes
        .iter()
        .filter_map(|outcome| {
            outcome.failure_reason().map(|reason| FailureEntry {
                title: outcome.title.clone(),
                reason,
            })
        })
        .collect();
    failures.sort_by(|a, b| a.title.cmp(&b.title));

    Summary {
        total: outcomes.len(),
        succeeded: outcomes.len() - failures.len(),
        failed: failures.len(),
        failures,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub run_id: Uuid,
    pub stats: ReconcileStats,
    pub deals: Vec<Deal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: ReconcileStats,
    pub summary: Summary,
    pub report_dir: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    bulk: Box<dyn DealSource>,
    live: Box<dyn DealSource>,
    sink: Arc<dyn UpdateSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.dispatch.max_in_flight.max(1),
        })?);

        let bulk = BulkLoader::new(Arc::clone(&http), config.bulk_location.clone());
        let live = LiveLoader::new(
            Arc::clone(&http),
            config.api_base_url.clone(),
            config.api_token.clone(),
        )
        .with_page_limit(config.page_limit);
        let sink = HttpDealSink::new(http, &config.api_base_url, config.api_token.as_deref())
            .context("building deal sink")?;

        Ok(Self {
            config,
            bulk: Box::new(bulk),
            live: Box::new(live),
            sink: Arc::new(sink),
        })
    }

    pub fn with_collaborators(
        mut self,
        bulk: Box<dyn DealSource>,
        live: Box<dyn DealSource>,
        sink: Arc<dyn UpdateSink>,
    ) -> Self {
        self.bulk = bulk;
        self.live = live;
        self.sink = sink;
        self
    }

    /// Load and reconcile without sending anything.
    pub async fn plan(&self) -> Result<PlanReport> {
        let ctx = RunContext::new();
        let span = info_span!("sync_plan", run_id = %ctx.run_id);
        async {
            let (reconciled, stats) = self.load_and_reconcile(&ctx).await?;
            Ok::<_, anyhow::Error>(PlanReport {
                run_id: ctx.run_id,
                stats,
                deals: reconciled.into_values().collect(),
            })
        }
        .instrument(span)
        .await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_once_until(std::future::pending()).await
    }

    pub async fn run_once_until<F>(&self, shutdown: F) -> Result<SyncRunSummary>
    where
        F: Future<Output = ()>,
    {
        let ctx = RunContext::new();
        let started_at = Utc::now();
        let span = info_span!("sync_run", run_id = %ctx.run_id);

        async {
            let (reconciled, stats) = self.load_and_reconcile(&ctx).await?;

            info!(
                deals = reconciled.len(),
                requests_per_window = self.config.dispatch.rate.requests_per_window,
                window_ms = self.config.dispatch.rate.window_duration.as_millis() as u64,
                "dispatching reconciled deals"
            );
            let outcomes = dispatch_until(
                &ctx,
                reconciled,
                Arc::clone(&self.sink),
                &self.config.dispatch,
                shutdown,
            )
            .await;
            let summary = summarize(&outcomes);
            info!(
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "dispatch finished"
            );

            let mut run = SyncRunSummary {
                run_id: ctx.run_id,
                started_at,
                finished_at: Utc::now(),
                stats,
                summary,
                report_dir: None,
            };

            if let Some(reports_root) = &self.config.reports_dir {
                let dir = reports_root.join(run.run_id.to_string());
                run.report_dir = Some(dir.display().to_string());
                write_reports(&dir, &run).await?;
            }

            Ok::<_, anyhow::Error>(run)
        }
        .instrument(span)
        .await
    }

    async fn load_and_reconcile(&self, ctx: &RunContext) -> Result<(ReconciledSet, ReconcileStats)> {
        let bulk = self
            .bulk
            .load(ctx)
            .await
            .with_context(|| format!("loading {} snapshot", self.bulk.source_name()))?;
        let live = self
            .live
            .load(ctx)
            .await
            .with_context(|| format!("loading {} snapshot", self.live.source_name()))?;

        let (reconciled, stats) = reconcile_with_stats(bulk, live);
        if stats.bulk_duplicates > 0 || stats.live_duplicates > 0 {
            warn!(
                bulk_duplicates = stats.bulk_duplicates,
                live_duplicates = stats.live_duplicates,
                "duplicate titles collapsed; last record per title kept"
            );
        }
        info!(
            reconciled = stats.reconciled,
            matched = stats.matched,
            value_overrides = stats.value_overrides,
            bulk_only = stats.bulk_only,
            live_only = stats.live_only,
            "snapshots reconciled"
        );
        Ok((reconciled, stats))
    }
}

async fn write_reports(dir: &Path, run: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(run).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    fs::write(dir.join("run_brief.md"), run_brief_markdown(run))
        .await
        .context("writing run_brief.md")?;
    Ok(())
}

pub fn run_brief_markdown(run: &SyncRunSummary) -> String {
    let stats = &run.stats;
    let summary = &run.summary;
    let mut brief = format!(
        "# Deal Sync Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Bulk records: {}\n- Live records: {}\n- Reconciled deals: {} (matched {}, value overrides {}, bulk-only {}, live-only {})\n- Dispatched: {} ({} succeeded, {} failed)\n",
        run.run_id,
        run.started_at,
        run.finished_at,
        stats.bulk_records,
        stats.live_records,
        stats.reconciled,
        stats.matched,
        stats.value_overrides,
        stats.bulk_only,
        stats.live_only,
        summary.total,
        summary.succeeded,
        summary.failed,
    );

    if !summary.failures.is_empty() {
        brief.push_str("\n## Failures\n");
        for failure in &summary.failures {
            brief.push_str(&format!("- {}: {}\n", failure.title, failure.reason));
        }
    }
    brief
}
