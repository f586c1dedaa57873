//! Matching: compare extracted fields against the remote policy record.
//!
//! Normalization per field kind:
//! - text: case-insensitive, whitespace runs collapsed
//! - identifiers: exact after trimming
//! - dates: parsed to a calendar date from any accepted layout
//!
//! A field missing on either side is excluded, never counted as agreement.
//! So is the policy number when the document itself supplied the lookup key.
//! With nothing left to compare the verdict is `ambiguous`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::error::ReconcileError;
use super::retry::{register_failure, RetryPolicy};
use super::traits::{RecordSource, SourceError, StateStore};
use super::types::*;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Match one `extracted` record against the remote policy data.
pub fn match_record(
    store: &dyn StateStore,
    source: &dyn RecordSource,
    policy: &RetryPolicy,
    record: &DocumentRecord,
) -> Result<RecordOutcome, ReconcileError> {
    let key = record.policy_key();
    let snapshot = match key {
        Some(key) => match source.fetch_policy(key.id()) {
            Ok(snapshot) => snapshot,
            Err(SourceError::Connection(message)) => return Err(ReconcileError::Connection(message)),
            Err(e) => return register_failure(store, policy, record, &e.to_string()),
        },
        None => None,
    };

    let fields = record.extracted_fields.clone().unwrap_or_default();
    let report = evaluate(&fields, key, snapshot.as_ref());
    let verdict = report.verdict;

    let (to, last_error) = match verdict {
        MatchVerdict::Matched => (DocumentState::Matched, None),
        MatchVerdict::Unmatched => (DocumentState::Unmatched, report.diagnostics()),
        MatchVerdict::Ambiguous => {
            let error = ReconcileError::AmbiguousMatch {
                document_id: record.document_id.clone(),
                diagnostics: report.diagnostics().unwrap_or_default(),
            };
            (DocumentState::Failed, Some(error.to_string()))
        }
    };

    let patch = TransitionPatch {
        match_result: Some(verdict),
        match_report: Some(report),
        last_error,
        ..TransitionPatch::default()
    };

    if !store.transition(&record.document_id, DocumentState::Extracted, to, &patch)? {
        return Err(ReconcileError::StateConflict {
            document_id: record.document_id.clone(),
            expected: DocumentState::Extracted,
        });
    }

    tracing::debug!(document_id = %record.document_id, verdict = %verdict, "Match evaluated");
    Ok(match verdict {
        MatchVerdict::Ambiguous => RecordOutcome::Failed,
        _ => RecordOutcome::Advanced(to),
    })
}

/// Compare every matchable field and derive the verdict.
pub fn evaluate(
    fields: &ExtractedFields,
    key: Option<PolicyKey<'_>>,
    snapshot: Option<&PolicySnapshot>,
) -> MatchReport {
    let mut compared = Vec::new();
    let mut excluded = Vec::new();

    for &field in MatchField::all() {
        let remote = match (key, snapshot) {
            (None, _) => {
                excluded.push(excluded_field(field, "no policy id to look up"));
                continue;
            }
            (Some(key), None) => {
                excluded.push(excluded_field(field, &format!("no remote policy {}", key.id())));
                continue;
            }
            (Some(PolicyKey::FromDocument(_)), Some(_)) if field == MatchField::PolicyId => {
                excluded.push(excluded_field(field, "lookup key from document"));
                continue;
            }
            (Some(_), Some(snapshot)) => snapshot.get(field),
        };

        let extracted = match fields.get(field) {
            Field::Present(value) => value,
            other => {
                excluded.push(excluded_field(field, &format!("{} in document", other.describe())));
                continue;
            }
        };

        let Some(remote) = remote else {
            excluded.push(excluded_field(field, "missing in remote policy"));
            continue;
        };

        compared.push(FieldComparison {
            field,
            extracted: extracted.clone(),
            remote: remote.to_string(),
            agrees: values_agree(field.comparison(), extracted, remote),
        });
    }

    let verdict = if compared.is_empty() {
        MatchVerdict::Ambiguous
    } else if compared.iter().all(|c| c.agrees) {
        MatchVerdict::Matched
    } else {
        MatchVerdict::Unmatched
    };

    MatchReport {
        verdict,
        policy_id: key.map(|k| k.id().to_string()),
        compared,
        excluded,
    }
}

fn excluded_field(field: MatchField, reason: &str) -> ExcludedField {
    ExcludedField {
        field,
        reason: reason.to_string(),
    }
}

/// Dates that fail to parse on either side count as a disagreement.
pub fn values_agree(kind: Comparison, a: &str, b: &str) -> bool {
    match kind {
        Comparison::Text => normalize_text(a) == normalize_text(b),
        Comparison::Identifier => a.trim() == b.trim(),
        Comparison::Date => match (normalize_date(a), normalize_date(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
}
