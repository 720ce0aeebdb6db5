//! Core domain model for the prospect enrichment pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "prospect-core";

/// Structured lookup result attached to a record.
pub type Payload = Map<String, JsonValue>;

/// Explicit "looked up, nothing usable" marker written instead of a blank payload cell.
pub const EMPTY_PAYLOAD: &str = "{}";

/// Kind of lookup subject. Drives column naming, validity rules and response unwrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Person,
    Company,
}

/// One of the three checkpoint storage layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Input,
    Interim,
    Processed,
}

const PERSON_SIGNAL_FIELDS: &[&str] = &[
    "firstName",
    "lastName",
    "positions",
    "schools",
    "linkedInIdentifier",
    "publicIdentifier",
];

impl SubjectKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Company => "company",
        }
    }

    /// Normalized suffix that identifies the identifier column of any tier.
    pub fn identifier_suffix(self) -> &'static str {
        match self {
            Self::Person => "linkedinurl",
            Self::Company => "linkedin_url",
        }
    }

    pub fn payload_column(self, tier: Tier) -> &'static str {
        match (self, tier) {
            (Self::Company, Tier::Processed) => "full_json",
            _ => "linkedin_json",
        }
    }

    /// Fields of which at least one must carry content. `None` means any field counts.
    pub fn signal_fields(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Person => Some(PERSON_SIGNAL_FIELDS),
            Self::Company => None,
        }
    }

    /// Key under which the remote service nests the payload.
    pub fn envelope_key(self) -> &'static str {
        self.label()
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Canonical join key across tiers. Never empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strips a leading byte-order mark, surrounding whitespace and case from a header cell.
pub fn normalize_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// First column whose normalized name ends with `suffix`.
pub fn locate_suffix_column(headers: &[String], suffix: &str) -> Option<usize> {
    let suffix = suffix.to_lowercase();
    headers
        .iter()
        .position(|h| normalize_header(h).ends_with(&suffix))
}

pub fn locate_column(headers: &[String], name: &str) -> Option<usize> {
    let name = normalize_header(name);
    headers.iter().position(|h| normalize_header(h) == name)
}

/// Column layout of one tier file with the identifier and payload columns located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
    identifier_index: usize,
    payload_index: usize,
}

impl Schema {
    /// Locates the identifier and payload columns. A missing payload column is appended.
    pub fn resolve(kind: SubjectKind, tier: Tier, headers: Vec<String>) -> Option<Self> {
        let identifier_index = locate_suffix_column(&headers, kind.identifier_suffix())?;
        let payload_name = kind.payload_column(tier);
        let mut columns = headers;
        let payload_index = match locate_column(&columns, payload_name) {
            Some(idx) => idx,
            None => {
                columns.push(payload_name.to_string());
                columns.len() - 1
            }
        };
        Some(Self {
            columns,
            identifier_index,
            payload_index,
        })
    }

    /// Fixed layouts known at compile time. Panics if an index is out of range.
    pub fn from_parts(columns: Vec<String>, identifier_index: usize, payload_index: usize) -> Self {
        assert!(identifier_index < columns.len() && payload_index < columns.len());
        Self {
            columns,
            identifier_index,
            payload_index,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn identifier_index(&self) -> usize {
        self.identifier_index
    }

    pub fn payload_index(&self) -> usize {
        self.payload_index
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        locate_column(&self.columns, name)
    }

    pub fn record(&self, values: Vec<String>) -> Record {
        Record::new(self, values)
    }
}

/// One row of the working dataset: carried-over input cells plus a payload cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    values: Vec<String>,
    identifier_index: usize,
    payload_index: usize,
}

impl Record {
    /// Pads or truncates `values` to the schema width.
    pub fn new(schema: &Schema, mut values: Vec<String>) -> Self {
        values.resize(schema.len(), String::new());
        Self {
            values,
            identifier_index: schema.identifier_index,
            payload_index: schema.payload_index,
        }
    }

    pub fn identifier(&self) -> Option<Identifier> {
        Identifier::parse(self.identifier_str())
    }

    pub fn identifier_str(&self) -> &str {
        self.values[self.identifier_index].trim()
    }

    pub fn payload_text(&self) -> &str {
        &self.values[self.payload_index]
    }

    pub fn payload(&self) -> Option<JsonValue> {
        parse_payload(self.payload_text())
    }

    pub fn set_payload_text(&mut self, text: impl Into<String>) {
        self.values[self.payload_index] = text.into();
    }

    pub fn mark_empty(&mut self) {
        self.set_payload_text(EMPTY_PAYLOAD);
    }

    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Parses a payload cell. Blank or malformed text yields `None`.
pub fn parse_payload(text: &str) -> Option<JsonValue> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn has_content(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => true,
    }
}

/// Decides whether a cached payload counts as already enriched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityOracle {
    kind: SubjectKind,
}

impl ValidityOracle {
    pub fn new(kind: SubjectKind) -> Self {
        Self { kind }
    }

    pub fn is_valid(&self, payload: Option<&JsonValue>) -> bool {
        match payload {
            Some(JsonValue::Object(map)) => self.is_valid_map(map),
            _ => false,
        }
    }

    pub fn is_valid_map(&self, map: &Payload) -> bool {
        match self.kind.signal_fields() {
            Some(fields) => fields
                .iter()
                .any(|field| map.get(*field).is_some_and(has_content)),
            None => map.values().any(has_content),
        }
    }

    pub fn is_valid_text(&self, text: &str) -> bool {
        self.is_valid(parse_payload(text).as_ref())
    }
}

/// Classification of a single remote lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    EmptyResult,
    TransientError,
    MalformedResponse,
}

/// Per-record reconciliation state. Everything except `Pending` is terminal for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    ResolvedFromProcessed,
    ResolvedFromInterim,
    ResolvedFromSelf,
    ResolvedFromFetch,
    Unresolved,
}

impl RecordState {
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            Self::ResolvedFromProcessed
                | Self::ResolvedFromInterim
                | Self::ResolvedFromSelf
                | Self::ResolvedFromFetch
        )
    }
}

/// Aggregate outcome of one driver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub resolved: usize,
    pub unresolved: usize,
    pub from_processed: usize,
    pub from_interim: usize,
    pub from_self: usize,
    pub from_fetch: usize,
}

impl RunCounts {
    pub fn record(&mut self, state: RecordState) {
        match state {
            RecordState::ResolvedFromProcessed => self.from_processed += 1,
            RecordState::ResolvedFromInterim => self.from_interim += 1,
            RecordState::ResolvedFromSelf => self.from_self += 1,
            RecordState::ResolvedFromFetch => self.from_fetch += 1,
            RecordState::Unresolved | RecordState::Pending => {}
        }
        if state.is_resolved() {
            self.resolved += 1;
        } else {
            self.unresolved += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.resolved + self.unresolved
    }
}
