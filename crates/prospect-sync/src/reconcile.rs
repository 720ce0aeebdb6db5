//! Per-record reconciliation and the concurrent driver that fans it out.

use std::collections::HashMap;
use std::sync::Arc;

use prospect_adapters::Fetcher;
use prospect_core::{
    FetchOutcome, Identifier, Record, RecordState, RunCounts, Schema, SubjectKind, ValidityOracle,
};
use prospect_storage::{CheckpointStore, StoreError};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Decides, per record, where its payload comes from: processed, interim, itself, or a fetch.
pub struct Reconciler {
    oracle: ValidityOracle,
    processed: HashMap<Identifier, Record>,
    interim: HashMap<Identifier, Record>,
    fetcher: Arc<dyn Fetcher>,
    // One lookup per identifier per run; duplicates await the first one's result.
    lookups: Mutex<HashMap<Identifier, Arc<OnceCell<Option<String>>>>>,
}

impl Reconciler {
    pub fn new(
        kind: SubjectKind,
        processed: HashMap<Identifier, Record>,
        interim: HashMap<Identifier, Record>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            oracle: ValidityOracle::new(kind),
            processed,
            interim,
            fetcher,
            lookups: Mutex::new(HashMap::new()),
        }
    }

    fn cached<'a>(
        &self,
        tier: &'a HashMap<Identifier, Record>,
        identifier: &Identifier,
    ) -> Option<&'a str> {
        tier.get(identifier)
            .map(Record::payload_text)
            .filter(|text| self.oracle.is_valid_text(text))
    }

    /// Runs the decision chain and attaches the chosen payload to `record`.
    /// Cached payloads are adopted verbatim; anything but a valid fetch leaves the empty marker.
    pub async fn reconcile(&self, record: &mut Record) -> RecordState {
        let Some(identifier) = record.identifier() else {
            debug!("record without identifier; skipping lookup");
            record.mark_empty();
            return RecordState::Unresolved;
        };

        if let Some(text) = self.cached(&self.processed, &identifier) {
            record.set_payload_text(text);
            debug!(%identifier, "resolved from processed tier");
            return RecordState::ResolvedFromProcessed;
        }
        if let Some(text) = self.cached(&self.interim, &identifier) {
            record.set_payload_text(text);
            debug!(%identifier, "resolved from interim tier");
            return RecordState::ResolvedFromInterim;
        }
        if self.oracle.is_valid_text(record.payload_text()) {
            debug!(%identifier, "input already carries a valid payload");
            return RecordState::ResolvedFromSelf;
        }

        match self.lookup(&identifier).await {
            Some(text) => {
                record.set_payload_text(text);
                debug!(%identifier, "resolved from fetch");
                RecordState::ResolvedFromFetch
            }
            None => {
                record.mark_empty();
                debug!(%identifier, "unresolved");
                RecordState::Unresolved
            }
        }
    }

    /// Fetches `identifier` at most once, returning the payload text only when it is valid.
    async fn lookup(&self, identifier: &Identifier) -> Option<String> {
        let cell = {
            let mut lookups = self.lookups.lock().await;
            Arc::clone(lookups.entry(identifier.clone()).or_default())
        };
        cell.get_or_init(|| async {
            let fetched = self.fetcher.fetch(identifier).await;
            match fetched.payload {
                Some(payload)
                    if fetched.outcome == FetchOutcome::Success
                        && self.oracle.is_valid_map(&payload) =>
                {
                    Some(JsonValue::Object(payload).to_string())
                }
                _ => {
                    debug!(%identifier, outcome = ?fetched.outcome, "lookup yielded no payload");
                    None
                }
            }
        })
        .await
        .clone()
    }
}

/// Full record set of one run. The mutex around it is also the interim write gate.
struct WorkingSet {
    schema: Schema,
    records: Vec<Record>,
}

/// Runs one reconciliation task per record against a single subject's tiers.
pub struct PipelineDriver {
    store: CheckpointStore,
    fetcher: Arc<dyn Fetcher>,
}

impl PipelineDriver {
    pub fn new(store: CheckpointStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Loads the mandatory input tier and runs every record in it.
    pub async fn run_input(&self) -> Result<RunCounts, StoreError> {
        let input = self.store.load_input().await?;
        self.run(input.schema, input.records).await
    }

    /// Individual record failures are absorbed into `unresolved`; only the final interim flush can fail.
    pub async fn run(&self, schema: Schema, records: Vec<Record>) -> Result<RunCounts, StoreError> {
        let kind = self.store.kind();
        let processed = self.store.load_processed().await.records;
        let interim = self.store.load_interim().await;
        let reconciler = Arc::new(Reconciler::new(
            kind,
            processed,
            interim,
            Arc::clone(&self.fetcher),
        ));

        let snapshots = records.clone();
        let working = Arc::new(Mutex::new(WorkingSet { schema, records }));
        let store = Arc::new(self.store.clone());
        info!(subject = %kind, records = snapshots.len(), "reconciling records");

        let mut tasks = JoinSet::new();
        for (index, mut record) in snapshots.into_iter().enumerate() {
            let reconciler = Arc::clone(&reconciler);
            let working = Arc::clone(&working);
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let state = reconciler.reconcile(&mut record).await;
                let mut set = working.lock().await;
                set.records[index] = record;
                if let Err(err) = store.save_interim(&set.schema, &set.records).await {
                    warn!(subject = %kind, error = %err, "interim save failed; continuing");
                }
                state
            });
        }

        let mut counts = RunCounts::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(state) => counts.record(state),
                Err(err) => {
                    error!(subject = %kind, error = %err, "reconciliation task aborted");
                    counts.record(RecordState::Unresolved);
                }
            }
        }

        let set = working.lock().await;
        let stored = store.save_interim(&set.schema, &set.records).await?;
        info!(
            subject = %kind,
            resolved = counts.resolved,
            unresolved = counts.unresolved,
            from_processed = counts.from_processed,
            from_interim = counts.from_interim,
            from_self = counts.from_self,
            from_fetch = counts.from_fetch,
            interim = %stored.path.display(),
            "reconciliation finished"
        );
        Ok(counts)
    }
}
