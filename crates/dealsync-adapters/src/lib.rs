//! Snapshot loaders (bulk object-store export, live API) and the upsert sink.

use std::borrow::Cow;
use std::io::Read;
use std::num::ParseFloatError;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dealsync_core::Deal;
use dealsync_transport::{url_with_query, FetchError, HttpFetcher};
use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealsync-adapters";

/// Business rule applied to every bulk export value before reconciliation.
pub const BULK_VALUE_MULTIPLIER: f64 = 2.0;

pub const DEFAULT_PAGE_LIMIT: u32 = 500;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decompressing bulk snapshot: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decoding bulk snapshot csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("bulk snapshot is missing column `{0}`")]
    MissingColumn(String),
    #[error("bulk snapshot line {line}: invalid value `{value}`: {source}")]
    InvalidValue {
        line: u64,
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("{source_name} snapshot record {position} has an empty title")]
    EmptyTitle {
        source_name: &'static str,
        position: u64,
    },
    #[error("decoding live snapshot page at start={start}: {source}")]
    Json {
        start: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("live snapshot rejected at start={start}: {message}")]
    Rejected { start: u64, message: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Transport(#[from] FetchError),
}

/// A producer of one side of the reconciliation.
#[async_trait]
pub trait DealSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn load(&self, ctx: &RunContext) -> Result<Vec<Deal>, LoadError>;
}

/// One logical "upsert a deal" call per record. Returns the HTTP status of the reply.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn send(&self, ctx: &RunContext, deal: Deal) -> Result<u16, SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreLocation {
    pub bucket: String,
    pub key: String,
    pub region: String,
    /// Path-style endpoint override (S3-compatible stores, local mocks).
    pub endpoint: Option<String>,
}

impl ObjectStoreLocation {
    pub fn object_url(&self) -> String {
        let key = self.key.trim_start_matches('/');
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkLocation {
    ObjectStore(ObjectStoreLocation),
    /// Fully formed object URL, e.g. a pre-signed link.
    Url(String),
    File(PathBuf),
}

pub struct BulkLoader {
    http: Arc<HttpFetcher>,
    location: BulkLocation,
    value_multiplier: f64,
}

impl BulkLoader {
    pub fn new(http: Arc<HttpFetcher>, location: BulkLocation) -> Self {
        Self {
            http,
            location,
            value_multiplier: BULK_VALUE_MULTIPLIER,
        }
    }

    pub fn with_value_multiplier(mut self, value_multiplier: f64) -> Self {
        self.value_multiplier = value_multiplier;
        self
    }

    async fn read_raw(&self, ctx: &RunContext) -> Result<Vec<u8>, LoadError> {
        match &self.location {
            BulkLocation::ObjectStore(location) => {
                Ok(self.http.fetch_bytes(ctx.run_id, &location.object_url()).await?.body)
            }
            BulkLocation::Url(url) => Ok(self.http.fetch_bytes(ctx.run_id, url).await?.body),
            BulkLocation::File(path) => tokio::fs::read(path).await.map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl DealSource for BulkLoader {
    fn source_name(&self) -> &'static str {
        "bulk"
    }

    async fn load(&self, ctx: &RunContext) -> Result<Vec<Deal>, LoadError> {
        let raw = self.read_raw(ctx).await?;
        let deals = parse_bulk_snapshot(&raw, self.value_multiplier)?;
        info!(bytes = raw.len(), deals = deals.len(), "bulk snapshot loaded");
        Ok(deals)
    }
}

/// Decode a header-first `title,currency,value,status` export, gzip-compressed or not.
///
/// Columns are located by header name. Every value is multiplied by `value_multiplier`.
pub fn parse_bulk_snapshot(raw: &[u8], value_multiplier: f64) -> Result<Vec<Deal>, LoadError> {
    let text: Cow<'_, [u8]> = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(raw)
            .read_to_end(&mut out)
            .map_err(LoadError::Decompress)?;
        Cow::Owned(out)
    } else {
        Cow::Borrowed(raw)
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_ref());

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| LoadError::MissingColumn(name.to_string()))
    };
    let title_idx = column("title")?;
    let currency_idx = column("currency")?;
    let value_idx = column("value")?;
    let status_idx = column("status")?;

    let mut deals = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        let title = record.get(title_idx).unwrap_or_default();
        if title.is_empty() {
            return Err(LoadError::EmptyTitle {
                source_name: "bulk",
                position: line,
            });
        }

        let raw_value = record.get(value_idx).unwrap_or_default();
        let value: f64 = raw_value.parse().map_err(|source| LoadError::InvalidValue {
            line,
            value: raw_value.to_string(),
            source,
        })?;

        deals.push(Deal {
            title: title.to_string(),
            currency: non_empty(record.get(currency_idx)),
            value: value * value_multiplier,
            status: non_empty(record.get(status_idx)),
        });
    }

    Ok(deals)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct RawLivePage {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<Vec<RawLiveDeal>>,
    #[serde(default)]
    additional_data: Option<RawAdditionalData>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawLiveDeal {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAdditionalData {
    #[serde(default)]
    pagination: Option<RawPagination>,
}

#[derive(Debug, Deserialize)]
struct RawPagination {
    #[serde(default)]
    more_items_in_collection: bool,
    #[serde(default)]
    next_start: Option<u64>,
}

/// One decoded page of the live snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LivePage {
    pub deals: Vec<Deal>,
    /// Offset of the following page, when the API reports more items.
    pub next_start: Option<u64>,
}

pub fn decode_live_page(body: &[u8], start: u64) -> Result<LivePage, LoadError> {
    let page: RawLivePage =
        serde_json::from_slice(body).map_err(|source| LoadError::Json { start, source })?;

    if !page.success {
        return Err(LoadError::Rejected {
            start,
            message: page.error.unwrap_or_else(|| "success=false".to_string()),
        });
    }

    let raw_deals = page.data.unwrap_or_default();
    let mut deals = Vec::with_capacity(raw_deals.len());
    for (offset, raw) in raw_deals.into_iter().enumerate() {
        // trimmed like the bulk CSV fields so titles join across sources
        let title = raw.title.as_deref().map(str::trim).unwrap_or_default();
        if title.is_empty() {
            return Err(LoadError::EmptyTitle {
                source_name: "live",
                position: start + offset as u64,
            });
        }
        deals.push(Deal {
            title: title.to_string(),
            currency: non_empty(raw.currency.as_deref().map(str::trim)),
            value: raw.value.unwrap_or(0.0),
            status: non_empty(raw.status.as_deref().map(str::trim)),
        });
    }

    let next_start = page
        .additional_data
        .and_then(|a| a.pagination)
        .filter(|p| p.more_items_in_collection)
        .map(|p| p.next_start.unwrap_or(start + deals.len() as u64));

    Ok(LivePage { deals, next_start })
}

pub struct LiveLoader {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_token: Option<String>,
    page_limit: u32,
}

impl LiveLoader {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_token,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    fn page_url(&self, start: u64) -> Result<String, FetchError> {
        let start = start.to_string();
        let limit = self.page_limit.to_string();
        let mut query = vec![("start", start.as_str()), ("limit", limit.as_str())];
        if let Some(token) = &self.api_token {
            query.push(("api_token", token.as_str()));
        }
        url_with_query(&deals_endpoint(&self.base_url), &query)
    }
}

#[async_trait]
impl DealSource for LiveLoader {
    fn source_name(&self) -> &'static str {
        "live"
    }

    async fn load(&self, ctx: &RunContext) -> Result<Vec<Deal>, LoadError> {
        let mut start = 0u64;
        let mut pages = 0usize;
        let mut deals = Vec::new();

        loop {
            let response = self.http.fetch_bytes(ctx.run_id, &self.page_url(start)?).await?;
            let page = decode_live_page(&response.body, start)?;
            let fetched = page.deals.len();
            pages += 1;
            deals.extend(page.deals);
            debug!(start, fetched, "live page decoded");

            match page.next_start {
                Some(next) if next > start && fetched > 0 => start = next,
                _ => break,
            }
        }

        info!(pages, deals = deals.len(), "live snapshot loaded");
        Ok(deals)
    }
}

/// Upserts deals by POSTing them to `{base}/api/v1/deals`.
pub struct HttpDealSink {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl HttpDealSink {
    /// Fails when `base_url` is not an absolute URL.
    pub fn new(http: Arc<HttpFetcher>, base_url: &str, api_token: Option<&str>) -> Result<Self, FetchError> {
        let query: Vec<(&str, &str)> = api_token.map(|token| ("api_token", token)).into_iter().collect();
        let endpoint = url_with_query(&deals_endpoint(base_url), &query)?;
        Ok(Self { http, endpoint })
    }
}

fn deals_endpoint(base_url: &str) -> String {
    format!("{}/api/v1/deals", base_url.trim_end_matches('/'))
}

#[async_trait]
impl UpdateSink for HttpDealSink {
    async fn send(&self, ctx: &RunContext, deal: Deal) -> Result<u16, SinkError> {
        let status = self.http.post_json(ctx.run_id, &self.endpoint, &deal).await?;
        Ok(status.as_u16())
    }
}
