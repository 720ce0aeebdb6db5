use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prospect_adapters::{Fetched, Fetcher, COMPANY_PROCESSED_COLUMNS};
use prospect_core::{FetchOutcome, Identifier, Payload, SubjectKind, EMPTY_PAYLOAD};
use prospect_storage::{
    append_row, read_table, sha256_hex, CheckpointStore, RateLimitConfig, RateLimiter, StoreError,
};
use prospect_sync::{EnrichmentPipeline, PipelineDriver, StagePaths};
use serde_json::{json, Value as JsonValue};
use tempfile::{tempdir, TempDir};
use tokio::time::Instant;

struct ScriptedFetcher {
    kind: SubjectKind,
    replies: HashMap<String, Fetched>,
    limiter: Option<Arc<RateLimiter>>,
    calls: Mutex<Vec<String>>,
    admitted: Mutex<Vec<Instant>>,
}

impl ScriptedFetcher {
    fn new(kind: SubjectKind) -> Self {
        Self {
            kind,
            replies: HashMap::new(),
            limiter: None,
            calls: Mutex::new(Vec::new()),
            admitted: Mutex::new(Vec::new()),
        }
    }

    fn reply(mut self, identifier: &str, fetched: Fetched) -> Self {
        self.replies.insert(identifier.to_string(), fetched);
        self
    }

    fn limited(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().expect("calls").clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn subject(&self) -> SubjectKind {
        self.kind
    }

    async fn fetch(&self, identifier: &Identifier) -> Fetched {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
            self.admitted.lock().expect("admitted").push(Instant::now());
        }
        self.calls.lock().expect("calls").push(identifier.to_string());
        self.replies
            .get(identifier.as_str())
            .cloned()
            .unwrap_or_else(|| Fetched::failed(FetchOutcome::TransientError))
    }
}

fn object(value: JsonValue) -> Payload {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn person(first: &str) -> Fetched {
    Fetched::success(object(json!({"firstName": first})))
}

fn url(name: &str) -> String {
    format!("https://www.linkedin.com/in/{name}")
}

/// `<tmp>/acme/people.csv` with one row per name.
fn write_input(dir: &TempDir, names: &[&str]) -> PathBuf {
    let base = dir.path().join("acme");
    std::fs::create_dir_all(&base).expect("mkdir");
    let mut text = String::from("LinkedinURL,First Name\n");
    for name in names {
        text.push_str(&format!("{},{}\n", if name.is_empty() { String::new() } else { url(name) }, name));
    }
    let input = base.join("people.csv");
    std::fs::write(&input, text).expect("write input");
    input
}

async fn seed_processed(paths: &StagePaths, name: &str, payload: &str) {
    let headers = ["LinkedinURL", "First Name", "Education Institutions", "Companies", "linkedin_json"]
        .map(String::from);
    let values = [url(name), name.to_string(), "[]".into(), "[]".into(), payload.to_string()];
    append_row(&paths.people_processed, &headers, &values)
        .await
        .expect("seed processed");
}

fn driver(paths: &StagePaths, fetcher: Arc<ScriptedFetcher>) -> PipelineDriver {
    PipelineDriver::new(
        CheckpointStore::new(SubjectKind::Person, paths.people_tiers()),
        fetcher,
    )
}

fn payload_cells(rows: &[Vec<String>]) -> Vec<String> {
    rows.iter().map(|row| row[2].clone()).collect()
}

#[tokio::test]
async fn end_to_end_processed_fetch_and_transient() {
    let dir = tempdir().expect("tempdir");
    let input = write_input(&dir, &["a", "b", "c"]);
    let paths = StagePaths::for_input(&input);
    seed_processed(&paths, "a", r#"{"firstName":"A"}"#).await;

    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person).reply(&url("b"), person("B")));
    let counts = driver(&paths, fetcher.clone()).run_input().await.expect("run");

    assert_eq!(counts.resolved, 2);
    assert_eq!(counts.unresolved, 1);
    assert_eq!(counts.from_processed, 1);
    assert_eq!(counts.from_fetch, 1);
    assert_eq!(fetcher.calls(), vec![url("b"), url("c")]);

    let interim = read_table(&paths.people_interim).await.expect("interim");
    assert_eq!(interim.headers, vec!["LinkedinURL", "First Name", "linkedin_json"]);
    assert_eq!(interim.rows.len(), 3);
    let payloads = payload_cells(&interim.rows);
    assert_eq!(payloads[0], r#"{"firstName":"A"}"#);
    assert_eq!(payloads[1], r#"{"firstName":"B"}"#);
    assert_eq!(payloads[2], EMPTY_PAYLOAD);
}

#[tokio::test]
async fn valid_processed_identifiers_are_never_fetched() {
    let dir = tempdir().expect("tempdir");
    let names = ["p1", "p2", "p3", "p4", "p5"];
    let input = write_input(&dir, &names);
    let paths = StagePaths::for_input(&input);
    for name in names {
        seed_processed(&paths, name, &json!({"lastName": name}).to_string()).await;
    }

    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person));
    let counts = driver(&paths, fetcher.clone()).run_input().await.expect("run");
    assert_eq!(counts.from_processed, names.len());
    assert!(fetcher.calls().is_empty());
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let input = write_input(&dir, &["a", "b", "c"]);
    let paths = StagePaths::for_input(&input);
    seed_processed(&paths, "a", r#"{"firstName":"A"}"#).await;

    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person).reply(&url("b"), person("B")));
    let first = driver(&paths, fetcher.clone()).run_input().await.expect("first run");
    let first_bytes = std::fs::read(&paths.people_interim).expect("interim");

    let second = driver(&paths, fetcher.clone()).run_input().await.expect("second run");
    let second_bytes = std::fs::read(&paths.people_interim).expect("interim");

    assert_eq!((first.resolved, first.unresolved), (second.resolved, second.unresolved));
    assert_eq!(second.from_interim, 1);
    assert_eq!(sha256_hex(&first_bytes), sha256_hex(&second_bytes));
    // b came from interim the second time; only c was retried.
    assert_eq!(fetcher.calls(), vec![url("b"), url("c"), url("c")]);
}

#[tokio::test]
async fn resumes_from_partial_interim() {
    let dir = tempdir().expect("tempdir");
    let names = ["r1", "r2", "r3", "r4", "r5", "r6"];
    let input = write_input(&dir, &names);
    let paths = StagePaths::for_input(&input);

    let mut first = ScriptedFetcher::new(SubjectKind::Person);
    let mut second = ScriptedFetcher::new(SubjectKind::Person);
    for name in names {
        first = first.reply(&url(name), person(name));
        second = second.reply(&url(name), person(name));
    }

    // Simulate termination after the first three records completed.
    let store = CheckpointStore::new(SubjectKind::Person, paths.people_tiers());
    let loaded = store.load_input().await.expect("input");
    let partial = loaded.records[..3].to_vec();
    let first = Arc::new(first);
    driver(&paths, first.clone())
        .run(loaded.schema.clone(), partial)
        .await
        .expect("partial run");
    assert_eq!(first.calls().len(), 3);

    let second = Arc::new(second);
    let counts = driver(&paths, second.clone()).run_input().await.expect("resume");
    assert_eq!(counts.total(), names.len());
    assert_eq!(counts.resolved, names.len());
    assert_eq!(counts.from_interim, 3);
    assert_eq!(second.calls(), vec![url("r4"), url("r5"), url("r6")]);

    let interim = read_table(&paths.people_interim).await.expect("interim");
    assert_eq!(interim.rows.len(), names.len());
}

#[tokio::test(start_paused = true)]
async fn fetches_respect_the_rolling_window() {
    let dir = tempdir().expect("tempdir");
    let names = (0..23).map(|i| format!("w{i}")).collect::<Vec<_>>();
    let input = write_input(&dir, &names.iter().map(String::as_str).collect::<Vec<_>>());
    let paths = StagePaths::for_input(&input);

    let window = Duration::from_secs(10);
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        calls_per_window: 5,
        window,
    }));
    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person).limited(limiter));
    let counts = driver(&paths, fetcher.clone()).run_input().await.expect("run");
    assert_eq!(counts.total(), names.len());

    let mut admitted = fetcher.admitted.lock().expect("admitted").clone();
    admitted.sort();
    assert_eq!(admitted.len(), names.len());
    for pair in admitted.windows(6) {
        assert!(pair[5].duration_since(pair[0]) >= window);
    }
}

#[tokio::test]
async fn blank_identifiers_are_marked_without_fetching() {
    let dir = tempdir().expect("tempdir");
    let input = write_input(&dir, &["", "d"]);
    let paths = StagePaths::for_input(&input);

    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person).reply(&url("d"), person("D")));
    let counts = driver(&paths, fetcher.clone()).run_input().await.expect("run");
    assert_eq!((counts.resolved, counts.unresolved), (1, 1));
    assert_eq!(fetcher.calls(), vec![url("d")]);

    let interim = read_table(&paths.people_interim).await.expect("interim");
    assert_eq!(interim.rows[0][2], EMPTY_PAYLOAD);
}

#[tokio::test]
async fn duplicated_input_rows_cost_one_fetch() {
    let dir = tempdir().expect("tempdir");
    let input = write_input(&dir, &["ada", "ada"]);
    let paths = StagePaths::for_input(&input);

    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person).reply(&url("ada"), person("Ada")));
    let counts = driver(&paths, fetcher.clone()).run_input().await.expect("run");
    assert_eq!((counts.resolved, counts.unresolved), (2, 0));
    assert_eq!(fetcher.calls(), vec![url("ada")]);

    let interim = read_table(&paths.people_interim).await.expect("interim");
    assert_eq!(payload_cells(&interim.rows), vec![r#"{"firstName":"Ada"}"#; 2]);
}

#[tokio::test]
async fn finalize_keeps_the_valid_duplicate() {
    let dir = tempdir().expect("tempdir");
    let input = write_input(&dir, &["ada"]);
    let paths = StagePaths::for_input(&input);
    std::fs::create_dir_all(&paths.interim_dir).expect("mkdir");
    std::fs::write(
        &paths.people_interim,
        format!(
            "LinkedinURL,First Name,linkedin_json\n\
             {0},Ada,{{}}\n\
             {0},Ada,\"{{\"\"firstName\"\":\"\"Ada\"\"}}\"\n",
            url("ada")
        ),
    )
    .expect("write interim");

    let counts = EnrichmentPipeline::offline(&input)
        .finalize_people()
        .await
        .expect("finalize");
    assert_eq!((counts.appended, counts.skipped), (1, 1));

    let processed = read_table(&paths.people_processed).await.expect("processed");
    assert_eq!(processed.rows.len(), 1);
    assert_eq!(processed.rows[0][4], r#"{"firstName":"Ada"}"#);
}

#[tokio::test]
async fn missing_input_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let paths = StagePaths::for_input(&dir.path().join("acme").join("absent.csv"));
    let fetcher = Arc::new(ScriptedFetcher::new(SubjectKind::Person));
    let err = driver(&paths, fetcher).run_input().await.expect_err("missing input");
    assert!(matches!(err, StoreError::MissingTier { .. }));
}

#[tokio::test]
async fn full_pipeline_runs_every_stage_and_converges() {
    let dir = tempdir().expect("tempdir");
    let input = write_input(&dir, &["a", "b"]);
    let acme = "https://www.linkedin.com/company/acme/";
    let globex = "https://www.linkedin.com/company/globex/";

    let people = Arc::new(
        ScriptedFetcher::new(SubjectKind::Person).reply(
            &url("a"),
            Fetched::success(object(json!({
                "firstName": "A",
                "positions": {"positionHistory": [
                    {"companyName": "Globex", "linkedInUrl": globex},
                    {"companyName": "Acme", "linkedInUrl": acme}
                ]},
                "schools": {"educationHistory": [{"schoolName": "MIT"}]}
            }))),
        ),
    );
    let companies = Arc::new(
        ScriptedFetcher::new(SubjectKind::Company)
            .reply(
                acme,
                Fetched::success(object(json!({"name": "Acme", "websiteUrl": "https://acme.test"}))),
            )
            .reply(globex, Fetched::failed(FetchOutcome::EmptyResult)),
    );
    let pipeline = EnrichmentPipeline::with_fetchers(&input, people.clone(), companies.clone());

    let summary = pipeline.run_once().await.expect("first run");
    assert_eq!((summary.people.resolved, summary.people.unresolved), (1, 1));
    assert_eq!(summary.people_finalized.appended, 2);
    assert_eq!(summary.companies_listed, 2);
    assert_eq!((summary.companies.resolved, summary.companies.unresolved), (1, 1));
    assert_eq!(summary.companies_finalized.appended, 2);

    let paths = pipeline.paths();
    let processed = read_table(&paths.people_processed).await.expect("people processed");
    assert_eq!(
        processed.headers,
        vec!["LinkedinURL", "First Name", "Education Institutions", "Companies", "linkedin_json"]
    );
    assert_eq!(processed.rows[0][2], r#"["MIT"]"#);
    assert_eq!(processed.rows[0][3], r#"["Acme","Globex"]"#);
    assert_eq!(processed.rows[1][4], EMPTY_PAYLOAD);

    let list = read_table(&paths.company_list).await.expect("company list");
    assert_eq!(
        list.rows,
        vec![
            vec![acme.to_string(), "Acme".to_string()],
            vec![globex.to_string(), "Globex".to_string()],
        ]
    );

    let company_rows = read_table(&paths.company_processed).await.expect("companies processed");
    assert_eq!(company_rows.headers, COMPANY_PROCESSED_COLUMNS.map(String::from).to_vec());
    assert_eq!(company_rows.rows[0][2], "https://acme.test");
    assert_eq!(company_rows.rows[1][13], EMPTY_PAYLOAD);

    let reports = PathBuf::from(&summary.reports_dir);
    assert!(reports.join("summary.json").exists());
    assert!(reports.join("summary.md").exists());

    let again = pipeline.run_once().await.expect("second run");
    assert_eq!(again.people.from_processed, 1);
    assert_eq!(again.people_finalized.appended, 0);
    assert_eq!(again.companies.from_processed, 1);
    assert_eq!(again.companies_finalized.appended, 0);
    assert_eq!(people.calls(), vec![url("a"), url("b"), url("b")]);
    assert_eq!(companies.calls(), vec![acme.to_string(), globex.to_string(), globex.to_string()]);
}
