//! Core types for the POP reconciliation pipeline.
//!
//! These types model the full lifecycle:
//! Remote row → Pending record → Extraction → Matching → Write-back.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ═══════════════════════════════════════════
// Document State
// ═══════════════════════════════════════════

/// Processing state of a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Pending,
    Extracted,
    Matched,
    Unmatched,
    AwaitingApproval,
    WrittenBack,
    Failed,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracted => "extracted",
            Self::Matched => "matched",
            Self::Unmatched => "unmatched",
            Self::AwaitingApproval => "awaiting_approval",
            Self::WrittenBack => "written_back",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "extracted" => Some(Self::Extracted),
            "matched" => Some(Self::Matched),
            "unmatched" => Some(Self::Unmatched),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "written_back" => Some(Self::WrittenBack),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn all() -> &'static [DocumentState] {
        &[
            Self::Pending,
            Self::Extracted,
            Self::Matched,
            Self::Unmatched,
            Self::AwaitingApproval,
            Self::WrittenBack,
            Self::Failed,
        ]
    }

    /// Forward edges of the state graph. `Failed → Pending` is an operator
    /// reset (see `StateStore::reset_failed`), not a transition.
    pub fn can_transition_to(&self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Pending, Extracted)
                | (Pending, Failed)
                | (Extracted, Matched)
                | (Extracted, Unmatched)
                | (Extracted, Failed)
                | (Matched, AwaitingApproval)
                | (Matched, WrittenBack)
                | (Matched, Failed)
                | (AwaitingApproval, WrittenBack)
                | (AwaitingApproval, Failed)
        )
    }

    /// No automatic stage ever moves a record out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WrittenBack | Self::Failed | Self::Unmatched)
    }
}

impl std::fmt::Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Match Verdict
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchVerdict {
    Matched,
    Unmatched,
    Ambiguous,
}

impl MatchVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Unmatched => "unmatched",
            Self::Ambiguous => "ambiguous",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "matched" => Some(Self::Matched),
            "unmatched" => Some(Self::Unmatched),
            "ambiguous" => Some(Self::Ambiguous),
            _ => None,
        }
    }
}

impl std::fmt::Display for MatchVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Extracted fields
// ═══════════════════════════════════════════

/// A single extracted value that keeps "the API never mentioned it" apart
/// from "the API returned it empty".
///
/// Serialized as the bare value, `null` for [`Field::Null`]; [`Field::Absent`]
/// must be skipped with `skip_serializing_if = "Field::is_absent"` and restored
/// through `#[serde(default)]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field<T> {
    #[default]
    Absent,
    Null,
    Present(T),
}

impl<T> Field<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Present(v) => Some(v),
            _ => None,
        }
    }

    /// Short label used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Null => "null",
            Self::Present(_) => "present",
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Present(v) => serializer.serialize_some(v),
            Self::Absent | Self::Null => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Self::Present(v),
            None => Self::Null,
        })
    }
}

/// The matchable fields of a POP document, as returned by extraction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub policy_id: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub named_insured: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub effective_date: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub expiration_date: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub agent_code: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub prior_carrier: Field<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Lookup paths per field: the declarations-page layout first, then the
/// flat keys some extraction prompts produce.
const POLICY_ID_PATHS: &[&[&str]] = &[&["policy_summary", "policy_number"], &["policy_number"], &["policy_id"]];
const NAMED_INSURED_PATHS: &[&[&str]] = &[&["named_insured", "name"], &["named_insured"], &["name"]];
const EFFECTIVE_DATE_PATHS: &[&[&str]] = &[&["policy_summary", "policy_period", "start_date"], &["effective_date"]];
const EXPIRATION_DATE_PATHS: &[&[&str]] = &[&["policy_summary", "policy_period", "end_date"], &["expiration_date"]];
const AGENT_CODE_PATHS: &[&[&str]] = &[&["insurance_agent_info", "agent_number"], &["agent_code"]];
const PRIOR_CARRIER_PATHS: &[&[&str]] = &[&["policy_summary", "underwritten_by"], &["prior_carrier"]];

impl ExtractedFields {
    /// Map a raw field mapping from the extraction API onto typed fields.
    pub fn from_field_mapping(mapping: &serde_json::Value, confidence: Option<f32>) -> Self {
        Self {
            policy_id: first_field(mapping, POLICY_ID_PATHS),
            named_insured: first_field(mapping, NAMED_INSURED_PATHS),
            effective_date: first_field(mapping, EFFECTIVE_DATE_PATHS),
            expiration_date: first_field(mapping, EXPIRATION_DATE_PATHS),
            agent_code: first_field(mapping, AGENT_CODE_PATHS),
            prior_carrier: first_field(mapping, PRIOR_CARRIER_PATHS),
            confidence,
        }
    }

    pub fn get(&self, field: MatchField) -> &Field<String> {
        match field {
            MatchField::PolicyId => &self.policy_id,
            MatchField::NamedInsured => &self.named_insured,
            MatchField::EffectiveDate => &self.effective_date,
            MatchField::ExpirationDate => &self.expiration_date,
            MatchField::AgentCode => &self.agent_code,
            MatchField::PriorCarrier => &self.prior_carrier,
        }
    }
}

fn first_field(root: &serde_json::Value, paths: &[&[&str]]) -> Field<String> {
    paths
        .iter()
        .map(|path| field_at(root, path))
        .find(|f| !f.is_absent())
        .unwrap_or(Field::Absent)
}

fn field_at(root: &serde_json::Value, path: &[&str]) -> Field<String> {
    use serde_json::Value;

    let mut current = root;
    for key in path {
        match current.get(key) {
            None => return Field::Absent,
            Some(Value::Null) => return Field::Null,
            Some(next) => current = next,
        }
    }
    match current {
        Value::String(s) if s.trim().is_empty() => Field::Null,
        Value::String(s) => Field::Present(s.trim().to_string()),
        Value::Number(n) => Field::Present(n.to_string()),
        Value::Bool(b) => Field::Present(b.to_string()),
        _ => Field::Absent,
    }
}

// ═══════════════════════════════════════════
// Match fields and reports
// ═══════════════════════════════════════════

/// How two values of a field are normalized before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Text,
    Identifier,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    PolicyId,
    NamedInsured,
    EffectiveDate,
    ExpirationDate,
    AgentCode,
    PriorCarrier,
}

impl MatchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyId => "policy_id",
            Self::NamedInsured => "named_insured",
            Self::EffectiveDate => "effective_date",
            Self::ExpirationDate => "expiration_date",
            Self::AgentCode => "agent_code",
            Self::PriorCarrier => "prior_carrier",
        }
    }

    pub fn all() -> &'static [MatchField] {
        &[
            Self::PolicyId,
            Self::NamedInsured,
            Self::EffectiveDate,
            Self::ExpirationDate,
            Self::AgentCode,
            Self::PriorCarrier,
        ]
    }

    pub fn comparison(&self) -> Comparison {
        match self {
            Self::PolicyId | Self::AgentCode => Comparison::Identifier,
            Self::NamedInsured | Self::PriorCarrier => Comparison::Text,
            Self::EffectiveDate | Self::ExpirationDate => Comparison::Date,
        }
    }
}

impl std::fmt::Display for MatchField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One field that both sides supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field: MatchField,
    pub extracted: String,
    pub remote: String,
    pub agrees: bool,
}

/// One field left out of the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedField {
    pub field: MatchField,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub verdict: MatchVerdict,
    pub policy_id: Option<String>,
    pub compared: Vec<FieldComparison>,
    pub excluded: Vec<ExcludedField>,
}

impl MatchReport {
    pub fn disagreements(&self) -> impl Iterator<Item = &FieldComparison> {
        self.compared.iter().filter(|c| !c.agrees)
    }

    /// Diagnostic text stored in `last_error`; `None` when there is nothing to say.
    pub fn diagnostics(&self) -> Option<String> {
        let mut lines: Vec<String> = self
            .excluded
            .iter()
            .map(|e| format!("insufficient data for field {} ({})", e.field, e.reason))
            .collect();
        lines.extend(self.disagreements().map(|c| {
            format!(
                "field {} differs: document={:?} remote={:?}",
                c.field, c.extracted, c.remote
            )
        }));
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("; "))
        }
    }
}

// ═══════════════════════════════════════════
// Local record
// ═══════════════════════════════════════════

/// One tracked source document. Owned by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub file_path: String,
    pub policy_id: Option<String>,
    pub source_comment: String,
    pub source_created_at: String,
    pub state: DocumentState,
    pub extracted_fields: Option<ExtractedFields>,
    pub match_result: Option<MatchVerdict>,
    pub match_report: Option<MatchReport>,
    pub approved: bool,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRecord {
    /// Key for the remote policy lookup. The discovery-time id wins over
    /// whatever extraction produced.
    pub fn policy_key(&self) -> Option<PolicyKey<'_>> {
        if let Some(id) = self.policy_id.as_deref() {
            return Some(PolicyKey::Discovered(id));
        }
        self.extracted_fields
            .as_ref()
            .and_then(|f| f.policy_id.value())
            .map(|id| PolicyKey::FromDocument(id.as_str()))
    }

    pub fn lookup_policy_id(&self) -> Option<&str> {
        self.policy_key().map(PolicyKey::id)
    }

    pub fn document_ref(&self) -> DocumentRef {
        DocumentRef {
            document_id: self.document_id.clone(),
            file_path: self.file_path.clone(),
        }
    }
}

/// Remote policy lookup key and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKey<'a> {
    /// From the remote task row at discovery.
    Discovered(&'a str),
    /// Read off the document; a policy fetched with it cannot confirm the
    /// document's own policy number.
    FromDocument(&'a str),
}

impl<'a> PolicyKey<'a> {
    pub fn id(self) -> &'a str {
        match self {
            Self::Discovered(id) | Self::FromDocument(id) => id,
        }
    }
}

/// Fields captured when a remote row is first seen.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub file_path: String,
    pub policy_id: Option<String>,
    pub source_comment: String,
    pub source_created_at: String,
}

impl From<&RemoteRow> for NewDocument {
    fn from(row: &RemoteRow) -> Self {
        Self {
            file_path: row.file_path.clone(),
            policy_id: row.policy_id.clone(),
            source_comment: row.task_comment.clone(),
            source_created_at: row.created_at.clone(),
        }
    }
}

/// Columns written together with a successful state change.
///
/// `None` leaves the stored value untouched, except `last_error`, which is
/// always overwritten so a successful transition clears stale errors.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub extracted_fields: Option<ExtractedFields>,
    pub match_result: Option<MatchVerdict>,
    pub match_report: Option<MatchReport>,
    pub last_error: Option<String>,
}

impl TransitionPatch {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════
// Remote-side shapes
// ═══════════════════════════════════════════

/// Filter for candidate discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub comment_prefix: String,
    pub lookback_days: u32,
}

/// A candidate task row from the remote source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRow {
    pub file_id: String,
    pub file_path: String,
    pub policy_id: Option<String>,
    pub task_comment: String,
    pub created_at: String,
}

/// Authoritative policy data used by the matching stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolicySnapshot {
    pub policy_id: String,
    pub named_insured: Option<String>,
    pub effective_date: Option<String>,
    pub expiration_date: Option<String>,
    pub agent_code: Option<String>,
    pub prior_carrier: Option<String>,
}

impl PolicySnapshot {
    pub fn get(&self, field: MatchField) -> Option<&str> {
        match field {
            MatchField::PolicyId => Some(self.policy_id.as_str()),
            MatchField::NamedInsured => self.named_insured.as_deref(),
            MatchField::EffectiveDate => self.effective_date.as_deref(),
            MatchField::ExpirationDate => self.expiration_date.as_deref(),
            MatchField::AgentCode => self.agent_code.as_deref(),
            MatchField::PriorCarrier => self.prior_carrier.as_deref(),
        }
        .map(str::trim)
        .filter(|v| !v.is_empty())
    }
}

/// Result fields written back to the remote source, keyed on `document_id`.
/// Never carries the extracted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteBackPayload {
    pub document_id: String,
    pub policy_id: Option<String>,
    pub match_result: MatchVerdict,
}

// ═══════════════════════════════════════════
// Extraction client shapes
// ═══════════════════════════════════════════

/// What the extraction client needs to locate a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub document_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub fields: ExtractedFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFailureKind {
    Timeout,
    Auth,
    MalformedResponse,
    Transport,
    Server,
    Document,
}

impl ExtractionFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::MalformedResponse => "malformed_response",
            Self::Transport => "transport",
            Self::Server => "server",
            Self::Document => "document",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{} error: {message}", .kind.as_str())]
pub struct ExtractionFailure {
    pub kind: ExtractionFailureKind,
    pub message: String,
}

impl ExtractionFailure {
    pub fn new(kind: ExtractionFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════
// Stage and cycle reports
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Extraction,
    Matching,
    WriteBack,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Extraction => "extraction",
            Self::Matching => "matching",
            Self::WriteBack => "write_back",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to one record in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Advanced(DocumentState),
    Retrying { attempt: u32 },
    Failed,
    /// Another worker moved the record first.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub rows_seen: u32,
    pub filtered_out: u32,
    pub created: u32,
    pub already_known: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub examined: u32,
    pub advanced: u32,
    pub retrying: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Cancelled before every ready record was examined.
    pub interrupted: bool,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            examined: 0,
            advanced: 0,
            retrying: 0,
            failed: 0,
            skipped: 0,
            interrupted: false,
        }
    }

    pub fn record(&mut self, outcome: RecordOutcome) {
        self.examined += 1;
        match outcome {
            RecordOutcome::Advanced(_) => self.advanced += 1,
            RecordOutcome::Retrying { .. } => self.retrying += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Summary of one orchestrator cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub discovery: Option<DiscoveryReport>,
    pub stages: Vec<StageReport>,
    pub stage_errors: Vec<(Stage, String)>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn new(cycle_id: String) -> Self {
        Self {
            cycle_id,
            discovery: None,
            stages: Vec::new(),
            stage_errors: Vec::new(),
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

// ═══════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════

/// Settings consumed by the reconciliation core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Attempts per stage before a record is marked failed.
    pub max_attempts: u32,
    /// Base delay before a failed record is retried; doubles per attempt.
    pub retry_backoff_secs: u64,
    /// Upper bound for the retry delay.
    pub retry_backoff_max_secs: u64,
    /// How far back discovery looks for task rows.
    pub lookback_days: u32,
    /// Task comments must start with this text (case-sensitive).
    pub comment_prefix_filter: String,
    /// Hold matched records in `awaiting_approval` until approved.
    pub require_human_approval: bool,
    /// Worker threads per stage. Size to the extraction API's rate limit.
    pub workers: usize,
    pub extraction_timeout_secs: u64,
    pub remote_timeout_secs: u64,
    /// Pause between background cycles.
    pub cycle_interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_secs: 60,
            retry_backoff_max_secs: 3600,
            lookback_days: 100,
            comment_prefix_filter: "Proof of Prior".to_string(),
            require_human_approval: false,
            workers: 4,
            extraction_timeout_secs: 120,
            remote_timeout_secs: 30,
            cycle_interval_secs: 900,
        }
    }
}

impl ReconcileConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn candidate_query(&self) -> CandidateQuery {
        CandidateQuery {
            comment_prefix: self.comment_prefix_filter.clone(),
            lookback_days: self.lookback_days,
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.workers == 0 {
            return Err("workers must be at least 1".into());
        }
        if self.comment_prefix_filter.trim().is_empty() {
            return Err("comment_prefix_filter must not be empty".into());
        }
        if self.extraction_timeout_secs == 0 || self.remote_timeout_secs == 0 {
            return Err("timeouts must be greater than zero".into());
        }
        if self.retry_backoff_max_secs < self.retry_backoff_secs {
            return Err("retry_backoff_max_secs must be >= retry_backoff_secs".into());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════
// Timestamps
// ═══════════════════════════════════════════

/// RFC 3339 UTC with millisecond precision. Sorts lexicographically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}
