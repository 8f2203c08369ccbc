#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub type DateTimeUtc = OffsetDateTime;

macro_rules! row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(PipelineId);
row_id!(StepDefId);
row_id!(StepClassId);
row_id!(JobId);
row_id!(PipelineJobId);
row_id!(StepExecutionId);
row_id!(RecordId);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("upstream data error: {0}")]
    UpstreamData(String),
    #[error("external service error: {0}")]
    ExternalService(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("step {step_number} '{step_name}' ({class_name}) of pipeline '{pipeline}' failed: {source}")]
    StepExecution {
        pipeline: String,
        step_number: i64,
        step_name: String,
        class_name: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamData(message.into())
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalService(message.into())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Lifecycle shared by jobs, pipeline jobs and step executions.
///
/// The numeric ids match the seeded `job_statuses` rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    NotStarted,
    Started,
    Finished,
    Failed,
}

impl ExecutionStatus {
    pub const ALL: [Self; 4] = [
        Self::Started,
        Self::Finished,
        Self::NotStarted,
        Self::Failed,
    ];

    #[must_use]
    pub fn status_id(self) -> i64 {
        match self {
            Self::Started => 1,
            Self::Finished => 2,
            Self::NotStarted => 3,
            Self::Failed => 4,
        }
    }

    #[must_use]
    pub fn from_status_id(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Started),
            2 => Some(Self::Finished),
            3 => Some(Self::NotStarted),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Started => "Started",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Top level of the step class taxonomy stored in `data_transformation_step_classes`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Load,
    Merge,
    Coalesce,
    Transform,
    Score,
    Output,
}

impl StepCategory {
    pub const ALL: [Self; 6] = [
        Self::Load,
        Self::Merge,
        Self::Coalesce,
        Self::Transform,
        Self::Score,
        Self::Output,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "Load",
            Self::Merge => "Merge",
            Self::Coalesce => "Coalesce",
            Self::Transform => "Transform",
            Self::Score => "Score",
            Self::Output => "Output",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRecord {
    pub id: PipelineId,
    pub name: String,
    pub definition_hash: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewStepDef {
    pub pipeline_id: PipelineId,
    pub step_number: i64,
    pub name: String,
    pub class_id: StepClassId,
    pub parameters: Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefRecord {
    pub id: StepDefId,
    pub pipeline_id: PipelineId,
    pub step_number: i64,
    pub name: String,
    pub class_name: String,
    pub parameters: Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTimeUtc>,
    pub ended_at: Option<DateTimeUtc>,
    pub is_active: bool,
    pub is_latest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineJobRecord {
    pub id: PipelineJobId,
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTimeUtc>,
    pub ended_at: Option<DateTimeUtc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepExecutionRecord {
    pub id: StepExecutionId,
    pub pipeline_job_id: PipelineJobId,
    pub step_def_id: StepDefId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTimeUtc>,
    pub ended_at: Option<DateTimeUtc>,
    pub is_active: bool,
    pub is_archived: bool,
    pub is_deleted: bool,
}

/// A record a step is about to append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRecord {
    pub data: Value,
    pub meta: Option<Value>,
    pub common_id: Option<String>,
}

impl NewRecord {
    #[must_use]
    pub fn new(data: Value, meta: Option<Value>, common_id: Option<String>) -> Self {
        Self {
            data,
            meta,
            common_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordRow {
    pub id: RecordId,
    pub data: Value,
    pub meta: Option<Value>,
    pub common_id: Option<String>,
    pub step_execution_id: StepExecutionId,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedRecordRow {
    pub record: RecordRow,
    pub archived_at: DateTimeUtc,
}

/// Identifies where a running step sits inside a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepContext {
    pub job_id: JobId,
    pub pipeline_job_id: PipelineJobId,
    pub step_execution_id: StepExecutionId,
    pub pipeline_name: String,
    pub step_number: i64,
    pub step_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ExternalConnection {
    Sqlite { path: PathBuf },
}

pub type ExternalConnections = BTreeMap<String, ExternalConnection>;

/// String-keyed lookup table for step classes, models and functions.
///
/// Registering a name twice replaces the earlier entry and logs a warning.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    kind: &'static str,
    entries: BTreeMap<String, T>,
}

impl<T> Registry<T> {
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Returns `true` when an existing entry was replaced.
    pub fn register(&mut self, name: impl Into<String>, entry: T) -> bool {
        let name = name.into();
        let replaced = self.entries.insert(name.clone(), entry).is_some();
        if replaced {
            tracing::warn!(
                kind = self.kind,
                name = %name,
                "registry entry replaced by later registration"
            );
        }
        replaced
    }

    /// Look up an entry by name.
    ///
    /// # Errors
    /// Returns a configuration error when the name is not registered.
    pub fn resolve(&self, name: &str) -> PipelineResult<&T> {
        self.entries.get(name).ok_or_else(|| {
            PipelineError::configuration(format!("unknown {} '{name}'", self.kind))
        })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// # Errors
/// Returns an error when the timestamp cannot be rendered.
pub fn format_rfc3339(value: DateTimeUtc) -> anyhow::Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow::anyhow!("invalid datetime format: {err}"))
}

/// # Errors
/// Returns an error when the input is not an RFC3339 timestamp.
pub fn parse_rfc3339(value: &str) -> anyhow::Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow::anyhow!("invalid RFC3339 datetime: {err}"))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns a configuration error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> PipelineResult<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::configuration(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Render a scalar JSON value as a join key. Arrays, objects and null have no key form.
#[must_use]
pub fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ensure_non_empty, hash_json, value_as_key, ExecutionStatus, PipelineError, Registry,
    };
    use serde_json::json;

    #[test]
    fn status_ids_round_trip() {
        for status in ExecutionStatus::ALL {
            assert_eq!(
                ExecutionStatus::from_status_id(status.status_id()),
                Some(status)
            );
        }
        assert_eq!(ExecutionStatus::from_status_id(99), None);
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Started.is_terminal());
    }

    #[test]
    fn later_registration_wins() {
        let mut registry: Registry<u8> = Registry::new("step class");
        assert!(!registry.register("Load", 1));
        assert!(registry.register("Load", 2));
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.resolve("Load"), Ok(2)));
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let registry: Registry<u8> = Registry::new("model");
        match registry.resolve("missing") {
            Err(PipelineError::Configuration(message)) => {
                assert!(message.contains("unknown model 'missing'"));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn hash_is_stable_for_equal_values() {
        let first = hash_json(&json!({"a": 1, "b": [1, 2]}));
        let second = hash_json(&json!({"a": 1, "b": [1, 2]}));
        assert!(first.is_ok());
        assert_eq!(
            first.unwrap_or_else(|_| unreachable!()),
            second.unwrap_or_else(|_| unreachable!())
        );
    }

    #[test]
    fn empty_names_are_rejected() {
        assert!(ensure_non_empty("name", "  ").is_err());
        assert!(ensure_non_empty("name", "load").is_ok());
    }

    #[test]
    fn scalar_values_render_as_keys() {
        assert_eq!(value_as_key(&json!("a")), Some("a".to_string()));
        assert_eq!(value_as_key(&json!(12)), Some("12".to_string()));
        assert_eq!(value_as_key(&json!(true)), Some("true".to_string()));
        assert_eq!(value_as_key(&json!(null)), None);
        assert_eq!(value_as_key(&json!([1])), None);
    }
}
