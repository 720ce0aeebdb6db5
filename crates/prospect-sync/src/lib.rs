//! Staged enrichment orchestration: people fetch, people finalize, company list,
//! company fetch, company finalize.

mod contacts;
mod reconcile;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prospect_adapters::{
    company_list, company_processed_schema, people_processed_schema, project_company,
    project_person, AdapterError, Fetcher, LookupConfig, ScrapinFetcher, COMPANY_LIST_COLUMNS,
    DEFAULT_BASE_URL,
};
use prospect_core::{Identifier, Record, RunCounts, Schema, SubjectKind, ValidityOracle};
use prospect_storage::{
    write_rows_atomic, CheckpointStore, HttpClientConfig, HttpFetcher, InputTier, ProcessedTier,
    RateLimitConfig, RateLimiter, StoreError, TierPaths,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub use contacts::{
    contacts_output_path, enrich_contacts, name_scores, normalize_name, ContactCandidate,
    ContactError, ContactMatcher, ContactReport, DEFAULT_MATCH_THRESHOLD, EMAIL_COLUMN,
    PHONE_COLUMN,
};
pub use reconcile::{PipelineDriver, Reconciler};

pub const CRATE_NAME: &str = "prospect-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub calls_per_window: u32,
    pub window_secs: u64,
    pub http_timeout_secs: u64,
    pub people_connections: usize,
    pub company_connections: usize,
    pub user_agent: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            calls_per_window: 300,
            window_secs: 60,
            http_timeout_secs: 300,
            people_connections: 20,
            company_connections: 30,
            user_agent: "prospect/0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("SCRAPIN_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            base_url: std::env::var("SCRAPIN_BASE_URL").unwrap_or(defaults.base_url),
            calls_per_window: env_parse("PROSPECT_CALLS_PER_WINDOW", defaults.calls_per_window),
            window_secs: env_parse("PROSPECT_WINDOW_SECS", defaults.window_secs),
            http_timeout_secs: env_parse("PROSPECT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            people_connections: env_parse("PROSPECT_PEOPLE_CONNECTIONS", defaults.people_connections),
            company_connections: env_parse(
                "PROSPECT_COMPANY_CONNECTIONS",
                defaults.company_connections,
            ),
            user_agent: std::env::var("PROSPECT_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn lookup(&self) -> Result<LookupConfig, PipelineError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| PipelineError::Config("SCRAPIN_API_KEY is not set".to_string()))?;
        Ok(LookupConfig {
            base_url: self.base_url.clone(),
            api_key,
        })
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            calls_per_window: self.calls_per_window,
            window: Duration::from_secs(self.window_secs.max(1)),
        }
    }

    fn http(&self, max_connections: usize) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_connections,
        }
    }
}

/// Every file one pipeline run touches, derived from the input path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    pub input: PathBuf,
    pub interim_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub people_interim: PathBuf,
    pub people_processed: PathBuf,
    pub company_list: PathBuf,
    pub company_interim: PathBuf,
    pub company_processed: PathBuf,
}

impl StagePaths {
    /// Outputs live beside the input; the base name is the input's directory name.
    pub fn for_input(input: &Path) -> Self {
        let input = std::path::absolute(input).unwrap_or_else(|_| input.to_path_buf());
        let base_dir = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = base_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prospect".to_string());
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let interim_dir = base_dir.join("interim");
        let processed_dir = base_dir.join("processed");
        Self {
            people_interim: interim_dir.join(format!("{stem}_withLinkedInData.csv")),
            people_processed: processed_dir.join(format!("{base}_people_processed.csv")),
            company_list: interim_dir.join(format!("{stem}_company-list.csv")),
            company_interim: interim_dir.join(format!("{stem}_company-list_withLinkedInData.csv")),
            company_processed: processed_dir.join(format!("{base}_companies_processed.csv")),
            reports_dir: base_dir.join("reports"),
            interim_dir,
            processed_dir,
            input,
        }
    }

    pub fn people_tiers(&self) -> TierPaths {
        TierPaths {
            input: self.input.clone(),
            interim: self.people_interim.clone(),
            processed: self.people_processed.clone(),
        }
    }

    pub fn company_tiers(&self) -> TierPaths {
        TierPaths {
            input: self.company_list.clone(),
            interim: self.company_interim.clone(),
            processed: self.company_processed.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeCounts {
    pub appended: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: String,
    pub people: RunCounts,
    pub people_finalized: FinalizeCounts,
    pub companies_listed: usize,
    pub companies: RunCounts,
    pub companies_finalized: FinalizeCounts,
    pub reports_dir: String,
}

/// Runs the five stages over one input file. Fetchers are only needed by the two fetch stages.
pub struct EnrichmentPipeline {
    paths: StagePaths,
    people: Option<Arc<dyn Fetcher>>,
    companies: Option<Arc<dyn Fetcher>>,
}

impl EnrichmentPipeline {
    /// Builds both Scrapin fetchers over one shared rate limiter. Fails before touching any tier
    /// when the API key is missing.
    pub fn from_config(input: &Path, config: &PipelineConfig) -> Result<Self> {
        let lookup = config.lookup()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit()));
        let people_http = HttpFetcher::new(config.http(config.people_connections), Arc::clone(&limiter))?;
        let company_http = HttpFetcher::new(config.http(config.company_connections), limiter)?;
        let people = ScrapinFetcher::new(SubjectKind::Person, &lookup, Arc::new(people_http))
            .map_err(PipelineError::from)?;
        let companies = ScrapinFetcher::new(SubjectKind::Company, &lookup, Arc::new(company_http))
            .map_err(PipelineError::from)?;
        Ok(Self::with_fetchers(input, Arc::new(people), Arc::new(companies)))
    }

    pub fn with_fetchers(input: &Path, people: Arc<dyn Fetcher>, companies: Arc<dyn Fetcher>) -> Self {
        Self {
            paths: StagePaths::for_input(input),
            people: Some(people),
            companies: Some(companies),
        }
    }

    /// Finalize and extraction stages only; the fetch stages fail with a config error.
    pub fn offline(input: &Path) -> Self {
        Self {
            paths: StagePaths::for_input(input),
            people: None,
            companies: None,
        }
    }

    pub fn paths(&self) -> &StagePaths {
        &self.paths
    }

    fn people_store(&self) -> CheckpointStore {
        CheckpointStore::new(SubjectKind::Person, self.paths.people_tiers())
    }

    fn company_store(&self) -> CheckpointStore {
        CheckpointStore::new(SubjectKind::Company, self.paths.company_tiers())
    }

    async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.paths.interim_dir, &self.paths.processed_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    pub async fn fetch_people(&self) -> Result<RunCounts> {
        let fetcher = self
            .people
            .clone()
            .ok_or_else(|| PipelineError::Config("people fetch needs SCRAPIN_API_KEY".to_string()))?;
        self.ensure_dirs().await?;
        let driver = PipelineDriver::new(self.people_store(), fetcher);
        driver
            .run_input()
            .instrument(info_span!("stage", stage = "people-fetch"))
            .await
            .with_context(|| format!("people fetch over {}", self.paths.input.display()))
    }

    pub async fn finalize_people(&self) -> Result<FinalizeCounts> {
        self.ensure_dirs().await?;
        let store = self.people_store();
        let interim = store
            .load_interim_rows()
            .await
            .with_context(|| format!("reading {}", self.paths.people_interim.display()))?;
        let processed = store.load_processed().await;
        let target = match &processed.schema {
            Some(schema) => schema.clone(),
            None => people_processed_schema(&interim.schema)
                .context("people interim tier has no identifier column")?,
        };

        let source = interim.schema.clone();
        let counts = append_new(&store, &processed, interim, &target, |record| {
            project_person(record, &source, &target)
        })
        .instrument(info_span!("stage", stage = "people-field-extraction"))
        .await?;
        info!(appended = counts.appended, skipped = counts.skipped, "people finalized");
        Ok(counts)
    }

    pub async fn extract_company_list(&self) -> Result<usize> {
        self.ensure_dirs().await?;
        let interim = self
            .people_store()
            .load_interim_rows()
            .await
            .with_context(|| format!("reading {}", self.paths.people_interim.display()))?;
        let payloads = interim
            .records
            .iter()
            .filter_map(Record::payload)
            .collect::<Vec<_>>();
        let companies = company_list(payloads.iter());
        let headers = COMPANY_LIST_COLUMNS.map(String::from);
        let rows = companies.into_iter().map(|c| c.into_row()).collect::<Vec<_>>();
        let stored = write_rows_atomic(&self.paths.company_list, &headers, rows.iter().map(Vec::as_slice))
            .await
            .with_context(|| format!("writing {}", self.paths.company_list.display()))?;
        info!(
            companies = stored.rows,
            path = %stored.path.display(),
            "company list extracted"
        );
        Ok(stored.rows)
    }

    pub async fn fetch_companies(&self) -> Result<RunCounts> {
        let fetcher = self
            .companies
            .clone()
            .ok_or_else(|| PipelineError::Config("company fetch needs SCRAPIN_API_KEY".to_string()))?;
        self.ensure_dirs().await?;
        let driver = PipelineDriver::new(self.company_store(), fetcher);
        driver
            .run_input()
            .instrument(info_span!("stage", stage = "company-fetch"))
            .await
            .with_context(|| format!("company fetch over {}", self.paths.company_list.display()))
    }

    pub async fn finalize_companies(&self) -> Result<FinalizeCounts> {
        self.ensure_dirs().await?;
        let store = self.company_store();
        let interim = store
            .load_interim_rows()
            .await
            .with_context(|| format!("reading {}", self.paths.company_interim.display()))?;
        let processed = store.load_processed().await;
        let target = company_processed_schema();

        let source = interim.schema.clone();
        let counts = append_new(&store, &processed, interim, &target, |record| {
            project_company(record, &source)
        })
        .instrument(info_span!("stage", stage = "company-field-extraction"))
        .await?;
        info!(appended = counts.appended, skipped = counts.skipped, "companies finalized");
        Ok(counts)
    }

    pub async fn run_once(&self) -> Result<PipelineRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, input = %self.paths.input.display(), "pipeline run started");

        let people = self.fetch_people().await?;
        let people_finalized = self.finalize_people().await?;
        let companies_listed = self.extract_company_list().await?;
        let companies = self.fetch_companies().await?;
        let companies_finalized = self.finalize_companies().await?;

        let reports_dir = self.paths.reports_dir.join(run_id.to_string());
        let summary = PipelineRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input: self.paths.input.display().to_string(),
            people,
            people_finalized,
            companies_listed,
            companies,
            companies_finalized,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary).await?;
        info!(%run_id, reports = %reports_dir.display(), "pipeline run finished");
        Ok(summary)
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &PipelineRunSummary) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("summary.json"), json)
            .await
            .context("writing summary.json")?;

        let markdown = format!(
            "# Prospect Enrichment Run\n\n- Run ID: `{}`\n- Input: `{}`\n- Started: {}\n- Finished: {}\n\n\
             ## People\n{}\n- finalized: {} appended, {} skipped\n\n\
             ## Companies\n- listed: {}\n{}\n- finalized: {} appended, {} skipped\n\n\
             ## Outputs\n- people: `{}`\n- companies: `{}`\n",
            summary.run_id,
            summary.input,
            summary.started_at,
            summary.finished_at,
            counts_markdown(&summary.people),
            summary.people_finalized.appended,
            summary.people_finalized.skipped,
            summary.companies_listed,
            counts_markdown(&summary.companies),
            summary.companies_finalized.appended,
            summary.companies_finalized.skipped,
            self.paths.people_processed.display(),
            self.paths.company_processed.display(),
        );
        fs::write(reports_dir.join("summary.md"), markdown)
            .await
            .context("writing summary.md")?;
        Ok(())
    }
}

fn counts_markdown(counts: &RunCounts) -> String {
    format!(
        "- resolved: {} (processed {}, interim {}, input {}, fetched {})\n- unresolved: {}",
        counts.resolved,
        counts.from_processed,
        counts.from_interim,
        counts.from_self,
        counts.from_fetch,
        counts.unresolved
    )
}

/// Appends projected interim records whose identifier has no valid processed row yet.
/// Duplicate interim rows collapse to one per identifier, and an invalid duplicate never
/// shadows a valid one. Invalid payloads are only appended for identifiers the processed
/// tier has never seen.
async fn append_new<F>(
    store: &CheckpointStore,
    processed: &ProcessedTier,
    interim: InputTier,
    target: &Schema,
    project: F,
) -> Result<FinalizeCounts>
where
    F: Fn(&Record) -> Record,
{
    let oracle = ValidityOracle::new(store.kind());
    let mut counts = FinalizeCounts::default();
    let mut order = Vec::new();
    let mut chosen: HashMap<Identifier, Record> = HashMap::new();
    for record in interim.records {
        let Some(identifier) = record.identifier() else {
            counts.skipped += 1;
            continue;
        };
        match chosen.get_mut(&identifier) {
            Some(kept) => {
                counts.skipped += 1;
                if !oracle.is_valid_text(kept.payload_text())
                    && oracle.is_valid_text(record.payload_text())
                {
                    *kept = record;
                }
            }
            None => {
                order.push(identifier.clone());
                chosen.insert(identifier, record);
            }
        }
    }

    for identifier in order {
        let Some(record) = chosen.remove(&identifier) else {
            continue;
        };
        let existing = processed.records.get(&identifier);
        if existing.is_some_and(|row| oracle.is_valid_text(row.payload_text())) {
            counts.skipped += 1;
            continue;
        }
        if existing.is_some() && !oracle.is_valid_text(record.payload_text()) {
            counts.skipped += 1;
            continue;
        }
        store
            .append_processed(&project(&record), target)
            .await
            .with_context(|| format!("appending {identifier} to processed tier"))?;
        counts.appended += 1;
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_paths_follow_directory_convention() {
        let paths = StagePaths::for_input(Path::new("/data/acme/people.csv"));
        assert_eq!(paths.people_interim, PathBuf::from("/data/acme/interim/people_withLinkedInData.csv"));
        assert_eq!(
            paths.people_processed,
            PathBuf::from("/data/acme/processed/acme_people_processed.csv")
        );
        assert_eq!(paths.company_list, PathBuf::from("/data/acme/interim/people_company-list.csv"));
        assert_eq!(
            paths.company_interim,
            PathBuf::from("/data/acme/interim/people_company-list_withLinkedInData.csv")
        );
        assert_eq!(
            paths.company_processed,
            PathBuf::from("/data/acme/processed/acme_companies_processed.csv")
        );
        assert_eq!(paths.reports_dir, PathBuf::from("/data/acme/reports"));
        assert_eq!(paths.company_tiers().input, paths.company_list);
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let config = PipelineConfig::default();
        assert!(matches!(config.lookup(), Err(PipelineError::Config(_))));
        assert!(EnrichmentPipeline::from_config(Path::new("people.csv"), &config).is_err());

        let config = PipelineConfig {
            api_key: Some("sk_test".into()),
            ..PipelineConfig::default()
        };
        assert_eq!(config.lookup().expect("lookup").base_url, DEFAULT_BASE_URL);
        assert_eq!(config.rate_limit().calls_per_window, 300);
        assert!(EnrichmentPipeline::from_config(Path::new("people.csv"), &config).is_ok());
    }

    #[tokio::test]
    async fn offline_pipeline_refuses_to_fetch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = EnrichmentPipeline::offline(&dir.path().join("people.csv"));
        let err = pipeline.fetch_people().await.expect_err("no fetcher");
        assert!(err.downcast_ref::<PipelineError>().is_some());
        assert!(!pipeline.paths().people_interim.exists());
    }
}
