//! Remote lookup adapters and payload field extraction.

mod extract;

use std::sync::Arc;

use async_trait::async_trait;
use prospect_core::{FetchOutcome, Identifier, Payload, SubjectKind, ValidityOracle};
use prospect_storage::HttpFetcher;
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub use extract::{
    company_list, company_processed_schema, companies_from_person, is_company_page,
    people_processed_schema, person_history_names, project_company, project_person,
    unwrap_company, CompanyRef, COMPANIES_COLUMN, COMPANY_LIST_COLUMNS, COMPANY_PROCESSED_COLUMNS,
    EDUCATION_COLUMN,
};

pub const CRATE_NAME: &str = "prospect-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.scrapin.io";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid lookup base url `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("lookup api key is empty")]
    MissingApiKey,
}

/// Result of one lookup: the normalized payload, present only on `Success`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub payload: Option<Payload>,
    pub outcome: FetchOutcome,
}

impl Fetched {
    pub fn success(payload: Payload) -> Self {
        Self {
            payload: Some(payload),
            outcome: FetchOutcome::Success,
        }
    }

    pub fn failed(outcome: FetchOutcome) -> Self {
        Self {
            payload: None,
            outcome,
        }
    }
}

/// One remote lookup for one identifier. Implementations never retry.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn subject(&self) -> SubjectKind;

    async fn fetch(&self, identifier: &Identifier) -> Fetched;
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Fetcher for the Scrapin enrichment API.
#[derive(Debug)]
pub struct ScrapinFetcher {
    kind: SubjectKind,
    endpoint: Url,
    api_key: String,
    http: Arc<HttpFetcher>,
}

impl ScrapinFetcher {
    pub fn new(
        kind: SubjectKind,
        config: &LookupConfig,
        http: Arc<HttpFetcher>,
    ) -> Result<Self, AdapterError> {
        if config.api_key.trim().is_empty() {
            return Err(AdapterError::MissingApiKey);
        }
        let invalid = |reason: String| AdapterError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason,
        };
        let base = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))
            .map_err(|e| invalid(e.to_string()))?;
        let endpoint = base
            .join(endpoint_path(kind))
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            kind,
            endpoint,
            api_key: config.api_key.trim().to_string(),
            http,
        })
    }

    pub fn request_url(&self, identifier: &Identifier) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("linkedInUrl", identifier.as_str());
        url
    }
}

fn endpoint_path(kind: SubjectKind) -> &'static str {
    match kind {
        SubjectKind::Person => "enrichment/profile",
        SubjectKind::Company => "enrichment/company",
    }
}

#[async_trait]
impl Fetcher for ScrapinFetcher {
    fn subject(&self) -> SubjectKind {
        self.kind
    }

    async fn fetch(&self, identifier: &Identifier) -> Fetched {
        match self.http.get(self.request_url(identifier)).await {
            Ok(resp) => {
                let fetched = normalize_response(self.kind, &resp.body);
                debug!(
                    subject = %self.kind,
                    %identifier,
                    status = resp.status.as_u16(),
                    outcome = ?fetched.outcome,
                    "lookup completed"
                );
                fetched
            }
            Err(err) => {
                warn!(
                    subject = %self.kind,
                    %identifier,
                    timeout = err.is_timeout(),
                    error = %err,
                    "lookup failed"
                );
                Fetched::failed(FetchOutcome::TransientError)
            }
        }
    }
}

/// Classify a 200 body and unwrap the subject envelope into a flat payload.
pub fn normalize_response(kind: SubjectKind, body: &[u8]) -> Fetched {
    let Ok(JsonValue::Object(mut root)) = serde_json::from_slice::<JsonValue>(body) else {
        return Fetched::failed(FetchOutcome::MalformedResponse);
    };

    let payload = match (kind, root.remove(kind.envelope_key())) {
        (_, Some(JsonValue::Object(inner))) => inner,
        (_, Some(JsonValue::Null)) | (SubjectKind::Person, None) => {
            return Fetched::failed(FetchOutcome::EmptyResult)
        }
        (_, Some(_)) => return Fetched::failed(FetchOutcome::MalformedResponse),
        (SubjectKind::Company, None) => root,
    };

    if ValidityOracle::new(kind).is_valid_map(&payload) {
        Fetched::success(payload)
    } else {
        Fetched::failed(FetchOutcome::EmptyResult)
    }
}
