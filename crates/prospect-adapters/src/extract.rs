//! Field extraction from lookup payloads into processed-tier columns.

use std::collections::BTreeSet;

use prospect_core::{normalize_header, Record, Schema, SubjectKind, Tier, ValidityOracle, EMPTY_PAYLOAD};
use serde_json::Value as JsonValue;

pub const EDUCATION_COLUMN: &str = "Education Institutions";
pub const COMPANIES_COLUMN: &str = "Companies";

pub const COMPANY_LIST_COLUMNS: [&str; 2] = ["company_linkedin_url", "company_name"];

pub const COMPANY_PROCESSED_COLUMNS: [&str; 14] = [
    "company_linkedin_url",
    "company_name",
    "website_url",
    "industry",
    "specialties",
    "employee_count",
    "city",
    "geographic_area",
    "postal_code",
    "founded",
    "tagline",
    "description",
    "logo_url",
    "full_json",
];

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_path(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn text_at(value: &JsonValue, path: &[&str]) -> String {
    match json_path(value, path) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Free text with quotes, backslashes and control characters JSON-escaped, without the quotes.
fn escaped_text_at(value: &JsonValue, path: &[&str]) -> String {
    let text = text_at(value, path);
    if text.is_empty() {
        return text;
    }
    let quoted = JsonValue::String(text).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn names_at(value: &JsonValue, path: &[&str], field: &str) -> Vec<String> {
    json_array(value, path)
        .iter()
        .filter_map(|entry| entry.get(field).and_then(JsonValue::as_str))
        .filter(|name| !name.trim().is_empty())
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Distinct, sorted `(companies, schools)` from a person's position and education history.
pub fn person_history_names(payload: &JsonValue) -> (Vec<String>, Vec<String>) {
    let companies = names_at(payload, &["positions", "positionHistory"], "companyName");
    let schools = names_at(payload, &["schools", "educationHistory"], "schoolName");
    (companies, schools)
}

fn json_list_cell(names: &[String]) -> String {
    JsonValue::from(names.to_vec()).to_string()
}

fn is_column(column: &str, name: &str) -> bool {
    normalize_header(column) == normalize_header(name)
}

/// Processed people layout: interim columns, then the derived columns, then the payload.
pub fn people_processed_schema(interim: &Schema) -> Option<Schema> {
    let payload_index = interim.payload_index();
    let mut columns = interim
        .columns()
        .iter()
        .enumerate()
        .filter(|(idx, column)| {
            *idx != payload_index
                && !is_column(column, EDUCATION_COLUMN)
                && !is_column(column, COMPANIES_COLUMN)
        })
        .map(|(_, column)| column.clone())
        .collect::<Vec<_>>();
    columns.push(EDUCATION_COLUMN.to_string());
    columns.push(COMPANIES_COLUMN.to_string());
    columns.push(SubjectKind::Person.payload_column(Tier::Processed).to_string());
    Schema::resolve(SubjectKind::Person, Tier::Processed, columns)
}

/// Project an interim person record onto `target`, deriving the history columns.
pub fn project_person(record: &Record, source: &Schema, target: &Schema) -> Record {
    let (companies, schools) = record
        .payload()
        .as_ref()
        .map(person_history_names)
        .unwrap_or_default();

    let values = target
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            if idx == target.payload_index() {
                let text = record.payload_text();
                if text.trim().is_empty() {
                    EMPTY_PAYLOAD.to_string()
                } else {
                    text.to_string()
                }
            } else if is_column(column, EDUCATION_COLUMN) {
                json_list_cell(&schools)
            } else if is_column(column, COMPANIES_COLUMN) {
                json_list_cell(&companies)
            } else {
                source
                    .index_of(column)
                    .and_then(|i| record.value(i))
                    .unwrap_or_default()
                    .to_string()
            }
        })
        .collect();
    target.record(values)
}

pub fn company_processed_schema() -> Schema {
    Schema::from_parts(
        COMPANY_PROCESSED_COLUMNS.iter().map(ToString::to_string).collect(),
        0,
        COMPANY_PROCESSED_COLUMNS.len() - 1,
    )
}

/// Payloads cached before normalization may still carry the `company` envelope.
pub fn unwrap_company(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut map) if map.contains_key("company") => {
            map.remove("company").unwrap_or(JsonValue::Null)
        }
        other => other,
    }
}

/// Derive the fixed processed company row from an interim company record.
pub fn project_company(record: &Record, source: &Schema) -> Record {
    let oracle = ValidityOracle::new(SubjectKind::Company);
    let name = source
        .index_of(COMPANY_LIST_COLUMNS[1])
        .and_then(|i| record.value(i))
        .unwrap_or_default();
    let company = record
        .payload()
        .map(unwrap_company)
        .filter(|data| oracle.is_valid(Some(data)));

    let mut values = vec![record.identifier_str().to_string(), name.to_string()];
    match company {
        Some(data) => {
            let specialties = match data.get("specialities") {
                Some(v) if !v.is_null() => v.to_string(),
                _ => "[]".to_string(),
            };
            values.extend([
                text_at(&data, &["websiteUrl"]),
                escaped_text_at(&data, &["industry"]),
                specialties,
                text_at(&data, &["employeeCount"]),
                text_at(&data, &["headquarter", "city"]),
                text_at(&data, &["headquarter", "geographicArea"]),
                text_at(&data, &["headquarter", "postalCode"]),
                text_at(&data, &["foundedOn", "year"]),
                escaped_text_at(&data, &["tagline"]),
                escaped_text_at(&data, &["description"]),
                text_at(&data, &["logo"]),
                data.to_string(),
            ]);
        }
        None => {
            values.extend([String::new(), String::new(), "[]".to_string()]);
            values.extend(std::iter::repeat_n(String::new(), 8));
            values.push(EMPTY_PAYLOAD.to_string());
        }
    }
    company_processed_schema().record(values)
}

/// Company page referenced from a person's position history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompanyRef {
    pub linkedin_url: String,
    pub name: String,
}

impl CompanyRef {
    pub fn into_row(self) -> Vec<String> {
        vec![self.linkedin_url, self.name]
    }
}

pub fn is_company_page(url: &str) -> bool {
    url.contains("linkedin.com/company/")
        && !url.contains("linkedin.com/search/")
        && !url.contains("keywords=")
}

pub fn companies_from_person(payload: &JsonValue) -> Vec<CompanyRef> {
    json_array(payload, &["positions", "positionHistory"])
        .iter()
        .filter_map(|position| {
            let url = position.get("linkedInUrl").and_then(JsonValue::as_str)?;
            if !is_company_page(url) {
                return None;
            }
            let name = position
                .get("companyName")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            Some(CompanyRef {
                linkedin_url: url.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// Unique companies across all payloads, ordered by name then URL.
pub fn company_list<'a, I>(payloads: I) -> Vec<CompanyRef>
where
    I: IntoIterator<Item = &'a JsonValue>,
{
    payloads
        .into_iter()
        .flat_map(companies_from_person)
        .map(|c| (c.name, c.linkedin_url))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(name, linkedin_url)| CompanyRef { linkedin_url, name })
        .collect()
}
