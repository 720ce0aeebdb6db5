//! Fuzzy first/last name matching that copies emails and phone numbers onto processed people.

use std::path::{Path, PathBuf};

use prospect_core::locate_column;
use prospect_storage::{read_table, write_rows_atomic, StoreError, Table};
use thiserror::Error;
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

pub const EMAIL_COLUMN: &str = "Email_enriched";
pub const PHONE_COLUMN: &str = "PhoneNumbers_enriched";
pub const DEFAULT_MATCH_THRESHOLD: f64 = 95.0;

const BASE_COLUMNS: [&str; 2] = ["First Name", "Last Name"];
const CONTACT_COLUMNS: [&str; 4] = ["FirstName", "LastName", "Emails", "PhoneNumbers"];
const INITIAL_SCORE: f64 = 95.0;

#[derive(Debug, Error)]
pub enum ContactError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("missing required columns in {}: {}", .path.display(), .columns.join(", "))]
    MissingColumns { path: PathBuf, columns: Vec<String> },
}

/// Comparison form of a name; the stored name is never rewritten.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let decoded = String::from_utf8_lossy(&urlencoding::decode_binary(lowered.as_bytes())).into_owned();
    decoded
        .replace('.', "")
        .nfkd()
        .filter(|c| c.is_ascii_alphabetic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

fn ratio(a: &str, b: &str) -> f64 {
    (strsim::normalized_levenshtein(a, b) * 100.0).round()
}

/// Best ratio of the shorter string against every equally long window of the longer one.
fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let long = long.chars().collect::<Vec<_>>();
    let width = short.chars().count();
    if width == 0 || width == long.len() {
        return ratio(short, &long.iter().collect::<String>());
    }
    long.windows(width)
        .map(|window| ratio(short, &window.iter().collect::<String>()))
        .fold(0.0, f64::max)
}

fn part_score(base: &str, candidate: &str) -> f64 {
    if base.chars().count() == 1 {
        if candidate.starts_with(base) {
            INITIAL_SCORE
        } else {
            0.0
        }
    } else {
        ratio(base, candidate)
    }
}

/// `(first, last)` scores in `[0, 100]`. Initials and very short names get extra leeway.
pub fn name_scores(base_first: &str, base_last: &str, first: &str, last: &str) -> (f64, f64) {
    let mut first_score = part_score(base_first, first);
    let mut last_score = part_score(base_last, last);
    if base_first.chars().count() <= 2 || base_last.chars().count() <= 2 {
        first_score = first_score.max(partial_ratio(base_first, first));
        last_score = last_score.max(partial_ratio(base_last, last));
    }
    (first_score, last_score)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactCandidate {
    pub first: String,
    pub last: String,
    pub emails: String,
    pub phones: String,
}

#[derive(Debug, Clone)]
pub struct ContactMatcher {
    threshold: f64,
    candidates: Vec<ContactCandidate>,
}

fn require_columns<const N: usize>(
    path: &Path,
    headers: &[String],
    names: [&str; N],
) -> Result<[usize; N], ContactError> {
    let found = names.map(|name| locate_column(headers, name));
    let missing = names
        .iter()
        .zip(found.iter())
        .filter(|(_, idx)| idx.is_none())
        .map(|(name, _)| name.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ContactError::MissingColumns {
            path: path.to_path_buf(),
            columns: missing,
        });
    }
    Ok(found.map(|idx| idx.unwrap_or_default()))
}

impl ContactMatcher {
    /// Builds candidates from a contacts table, dropping rows without both names.
    pub fn from_table(path: &Path, table: &Table) -> Result<Self, ContactError> {
        let [first, last, emails, phones] = require_columns(path, &table.headers, CONTACT_COLUMNS)?;
        let candidates = table
            .rows
            .iter()
            .filter_map(|row| {
                let candidate = ContactCandidate {
                    first: normalize_name(&row[first]),
                    last: normalize_name(&row[last]),
                    emails: row[emails].clone(),
                    phones: row[phones].clone(),
                };
                (!candidate.first.is_empty() && !candidate.last.is_empty()).then_some(candidate)
            })
            .collect();
        Ok(Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            candidates,
        })
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn candidates(&self) -> &[ContactCandidate] {
        &self.candidates
    }

    /// Highest-scoring candidate at or above the threshold. The earliest wins a tie.
    pub fn best_match(&self, first_name: &str, last_name: &str) -> Option<&ContactCandidate> {
        let first = normalize_name(first_name);
        let last = normalize_name(last_name);
        if first.is_empty() || last.is_empty() {
            debug!(first_name, last_name, "skipping row with incomplete name");
            return None;
        }

        let mut best: Option<(&ContactCandidate, f64)> = None;
        for candidate in &self.candidates {
            let (first_score, last_score) = name_scores(&first, &last, &candidate.first, &candidate.last);
            let combined = (first_score + last_score) / 2.0;
            if combined >= self.threshold && best.is_none_or(|(_, score)| combined > score) {
                best = Some((candidate, combined));
            }
        }
        if let Some((candidate, score)) = best {
            debug!(first_name, last_name, matched_first = %candidate.first, matched_last = %candidate.last, score, "contact matched");
        }
        best.map(|(candidate, _)| candidate)
    }

    /// Adds or overwrites the enriched columns on every row of `base`. Returns the match count.
    pub fn enrich(&self, path: &Path, base: &mut Table) -> Result<usize, ContactError> {
        let [first, last] = require_columns(path, &base.headers, BASE_COLUMNS)?;
        let email_idx = ensure_column(&mut base.headers, EMAIL_COLUMN);
        let phone_idx = ensure_column(&mut base.headers, PHONE_COLUMN);
        let width = base.headers.len();

        let mut enriched = 0usize;
        for row in &mut base.rows {
            row.resize(width, String::new());
            let matched = self.best_match(&row[first], &row[last]).cloned();
            let (emails, phones) = match matched {
                Some(candidate) => {
                    enriched += 1;
                    (candidate.emails, candidate.phones)
                }
                None => (String::new(), String::new()),
            };
            row[email_idx] = emails;
            row[phone_idx] = phones;
        }
        Ok(enriched)
    }
}

fn ensure_column(headers: &mut Vec<String>, name: &str) -> usize {
    match locate_column(headers, name) {
        Some(idx) => idx,
        None => {
            headers.push(name.to_string());
            headers.len() - 1
        }
    }
}

/// `<dir>/<stem>_withContacts.<ext>` next to the base file.
pub fn contacts_output_path(base: &Path) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}_withContacts.{}", ext.to_string_lossy()),
        None => format!("{stem}_withContacts"),
    };
    base.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactReport {
    pub output: PathBuf,
    pub rows: usize,
    pub enriched: usize,
}

pub async fn enrich_contacts(
    base_path: &Path,
    contacts_path: &Path,
    threshold: f64,
) -> Result<ContactReport, ContactError> {
    let mut base = read_table(base_path).await?;
    let contacts = read_table(contacts_path).await?;
    let matcher = ContactMatcher::from_table(contacts_path, &contacts)?.with_threshold(threshold);
    let enriched = matcher.enrich(base_path, &mut base)?;

    let output = contacts_output_path(base_path);
    let stored = write_rows_atomic(&output, &base.headers, base.rows.iter().map(Vec::as_slice)).await?;
    let rows = base.rows.len();
    let rate = if rows == 0 {
        0.0
    } else {
        enriched as f64 * 100.0 / rows as f64
    };
    info!(
        rows,
        enriched,
        rate,
        output = %stored.path.display(),
        "contact enrichment finished"
    );
    Ok(ContactReport {
        output,
        rows,
        enriched,
    })
}
