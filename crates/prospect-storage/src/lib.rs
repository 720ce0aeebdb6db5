//! Checkpoint tiers, rate limiting and HTTP fetch utilities for prospect.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prospect_core::{Identifier, Record, Schema, SubjectKind, Tier, ValidityOracle};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prospect-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tier file {} does not exist", .path.display())]
    MissingTier { path: PathBuf },
    #[error("no column ending in `{suffix}` in {}", .path.display())]
    MissingIdentifierColumn { path: PathBuf, suffix: String },
    #[error("malformed csv in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Header plus raw rows of a tabular file. Rows are padded to the header width.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StoredTable {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub content_hash: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn read_table(path: &Path) -> Result<Table, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::MissingTier {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(StoreError::io(path, err)),
    };
    parse_table(path, &bytes)
}

pub fn parse_table(path: &Path, bytes: &[u8]) -> Result<Table, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| StoreError::csv(path, e))?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| StoreError::csv(path, e))?;
        let mut row = record.iter().map(ToString::to_string).collect::<Vec<_>>();
        if row.len() < headers.len() {
            row.resize(headers.len(), String::new());
        }
        rows.push(row);
    }
    Ok(Table { headers, rows })
}

fn encode_rows<'a, I>(path: &Path, headers: &[String], rows: I) -> Result<(Vec<u8>, usize), StoreError>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(headers)
        .map_err(|e| StoreError::csv(path, e))?;
    let mut count = 0usize;
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| StoreError::csv(path, e))?;
        count += 1;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))?;
    Ok((bytes, count))
}

/// Replace `path` with a full table using a sibling temp file and rename.
pub async fn write_rows_atomic<'a, I>(
    path: &Path,
    headers: &[String],
    rows: I,
) -> Result<StoredTable, StoreError>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let (bytes, count) = encode_rows(path, headers, rows)?;
    write_atomic(path, &bytes).await?;
    Ok(StoredTable {
        path: path.to_path_buf(),
        rows: count,
        byte_size: bytes.len(),
        content_hash: sha256_hex(&bytes),
    })
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

/// Append one row, writing `headers` first when the file is absent or empty.
pub async fn append_row(path: &Path, headers: &[String], values: &[String]) -> Result<(), StoreError> {
    let needs_header = match fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => return Err(StoreError::io(path, err)),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if needs_header {
        writer
            .write_record(headers)
            .map_err(|e| StoreError::csv(path, e))?;
    }
    writer
        .write_record(values)
        .map_err(|e| StoreError::csv(path, e))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.flush().await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPaths {
    pub input: PathBuf,
    pub interim: PathBuf,
    pub processed: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessedTier {
    pub schema: Option<Schema>,
    pub records: HashMap<Identifier, Record>,
}

#[derive(Debug, Clone)]
pub struct InputTier {
    pub schema: Schema,
    pub records: Vec<Record>,
}

/// Read/write access to the input, interim and processed tiers of one subject.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    kind: SubjectKind,
    paths: TierPaths,
    oracle: ValidityOracle,
}

impl CheckpointStore {
    pub fn new(kind: SubjectKind, paths: TierPaths) -> Self {
        Self {
            kind,
            paths,
            oracle: ValidityOracle::new(kind),
        }
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    pub fn paths(&self) -> &TierPaths {
        &self.paths
    }

    /// Never fails: an absent tier is logged at info, an unreadable one at warn.
    pub async fn load_processed(&self) -> ProcessedTier {
        match self.load_keyed(Tier::Processed, &self.paths.processed).await {
            Ok((schema, records)) => {
                info!(
                    subject = %self.kind,
                    path = %self.paths.processed.display(),
                    records = records.len(),
                    "loaded processed tier"
                );
                ProcessedTier {
                    schema: Some(schema),
                    records,
                }
            }
            Err(StoreError::MissingTier { path }) => {
                info!(subject = %self.kind, path = %path.display(), "processed tier not found");
                ProcessedTier::default()
            }
            Err(err) => {
                warn!(subject = %self.kind, error = %err, "processed tier unreadable; treating as empty");
                ProcessedTier::default()
            }
        }
    }

    pub async fn load_interim(&self) -> HashMap<Identifier, Record> {
        match self.load_keyed(Tier::Interim, &self.paths.interim).await {
            Ok((_, records)) => {
                info!(
                    subject = %self.kind,
                    path = %self.paths.interim.display(),
                    records = records.len(),
                    "loaded interim tier"
                );
                records
            }
            Err(StoreError::MissingTier { path }) => {
                debug!(subject = %self.kind, path = %path.display(), "no interim tier yet");
                HashMap::new()
            }
            Err(err) => {
                warn!(subject = %self.kind, error = %err, "interim tier unreadable; treating as empty");
                HashMap::new()
            }
        }
    }

    /// The input tier is mandatory; every failure propagates.
    pub async fn load_input(&self) -> Result<InputTier, StoreError> {
        self.load_ordered(Tier::Input, &self.paths.input).await
    }

    /// Interim rows in file order, for finalize steps that read it as their source.
    pub async fn load_interim_rows(&self) -> Result<InputTier, StoreError> {
        self.load_ordered(Tier::Interim, &self.paths.interim).await
    }

    pub async fn save_interim(
        &self,
        schema: &Schema,
        records: &[Record],
    ) -> Result<StoredTable, StoreError> {
        write_rows_atomic(
            &self.paths.interim,
            schema.columns(),
            records.iter().map(Record::values),
        )
        .await
    }

    pub async fn append_processed(&self, record: &Record, schema: &Schema) -> Result<(), StoreError> {
        append_row(&self.paths.processed, schema.columns(), record.values()).await
    }

    fn resolve_schema(
        &self,
        tier: Tier,
        path: &Path,
        headers: Vec<String>,
    ) -> Result<Schema, StoreError> {
        Schema::resolve(self.kind, tier, headers).ok_or_else(|| StoreError::MissingIdentifierColumn {
            path: path.to_path_buf(),
            suffix: self.kind.identifier_suffix().to_string(),
        })
    }

    async fn load_ordered(&self, tier: Tier, path: &Path) -> Result<InputTier, StoreError> {
        let table = read_table(path).await?;
        let schema = self.resolve_schema(tier, path, table.headers)?;
        let records = table
            .rows
            .into_iter()
            .map(|row| schema.record(row))
            .collect();
        Ok(InputTier { schema, records })
    }

    async fn load_keyed(
        &self,
        tier: Tier,
        path: &Path,
    ) -> Result<(Schema, HashMap<Identifier, Record>), StoreError> {
        let table = read_table(path).await?;
        let schema = self.resolve_schema(tier, path, table.headers)?;
        let mut records: HashMap<Identifier, Record> = HashMap::new();
        for row in table.rows {
            let record = schema.record(row);
            let Some(identifier) = record.identifier() else {
                continue;
            };
            // Later rows win, except an invalid row never shadows a valid one.
            let keep_existing = records.get(&identifier).is_some_and(|existing| {
                self.oracle.is_valid_text(existing.payload_text())
                    && !self.oracle.is_valid_text(record.payload_text())
            });
            if !keep_existing {
                records.insert(identifier, record);
            }
        }
        Ok((schema, records))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub calls_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_window: 300,
            window: Duration::from_secs(60),
        }
    }
}

/// Rolling-window admission gate shared by every concurrent fetch.
///
/// Waiters queue on a fair mutex and the head of the queue sleeps while holding it,
/// so admission is FIFO and nobody is starved while the window advances.
#[derive(Debug)]
pub struct RateLimiter {
    calls_per_window: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let calls_per_window = config.calls_per_window.max(1) as usize;
        Self {
            calls_per_window,
            window: config.window,
            admitted: Mutex::new(VecDeque::with_capacity(calls_per_window)),
        }
    }

    pub fn calls_per_window(&self) -> usize {
        self.calls_per_window
    }

    pub async fn acquire(&self) {
        let mut admitted = self.admitted.lock().await;
        loop {
            let now = Instant::now();
            while admitted
                .front()
                .is_some_and(|at| now.duration_since(*at) >= self.window)
            {
                admitted.pop_front();
            }

            if admitted.len() < self.calls_per_window {
                admitted.push_back(now);
                return;
            }

            if let Some(oldest) = admitted.front().copied() {
                let wake_at = oldest + self.window;
                debug!(wait = ?wake_at.duration_since(now), "rate limit reached; waiting for window");
                tokio::time::sleep_until(wake_at).await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_connections: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            max_connections: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {path}")]
    HttpStatus {
        status: u16,
        path: String,
        body: String,
    },
    #[error("connection pool closed")]
    PoolClosed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

const ERROR_BODY_LIMIT: usize = 512;

/// Shared HTTP client: caps concurrent connections, then takes rate admission,
/// then sends exactly one request. Retries are the caller's business.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    connections: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let max_connections = config.max_connections.max(1);
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(max_connections);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            connections: Arc::new(Semaphore::new(max_connections)),
            limiter,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn get(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .connections
            .acquire()
            .await
            .map_err(|_| FetchError::PoolClosed)?;
        self.limiter.acquire().await;

        // The query string carries the API key, so only host and path are recorded.
        let path = url.path().to_string();
        let span = info_span!("http_fetch", host = url.host_str().unwrap_or_default(), path = %path);

        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if status == StatusCode::OK {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse { status, body });
            }

            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                path,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
