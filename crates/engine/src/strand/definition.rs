//! Strand and frame definitions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::StepError;

/// Continuation recorded in a pushed frame
///
/// When the frame returns, the strand resumes at this program and label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub program: String,
    pub label: String,
}

/// One level of a strand's call stack
///
/// Holds the working parameters of the level. Steps only ever read and
/// write the top frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Where to resume once this level returns (absent for the outermost frame)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,

    /// Parameter name to value
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Frame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from a JSON object (or `null` for an empty frame)
    pub fn from_json(value: Value) -> Result<Self, StepError> {
        match value {
            Value::Object(params) => Ok(Self { link: None, params }),
            Value::Null => Ok(Self::new()),
            other => Err(StepError::validation(format!(
                "frame must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Add a parameter (builder style)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Get a raw parameter value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Check whether a parameter is present
    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Decode a required parameter
    ///
    /// A missing or mistyped parameter is fatal: the frame was written by
    /// the engine or by `assemble`, so a mismatch is a programming error.
    pub fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<T, StepError> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| StepError::fatal(format!("frame is missing parameter '{key}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| StepError::fatal(format!("frame parameter '{key}' is malformed: {e}")))
    }

    /// Decode an optional parameter, falling back to `default`
    pub fn fetch_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StepError> {
        if self.contains(key) {
            self.fetch(key)
        } else {
            Ok(default)
        }
    }

    /// Set a parameter
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), StepError> {
        let value = serde_json::to_value(value)
            .map_err(|e| StepError::fatal(format!("cannot serialize frame parameter: {e}")))?;
        self.params.insert(key.into(), value);
        Ok(())
    }

    /// Remove a parameter
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.params.remove(key)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Strand lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrandStatus {
    /// Strand is alive and may be scheduled
    Running,

    /// Outermost frame returned; `exitval` holds the result
    Completed,

    /// A fatal condition stopped scheduling until an operator resumes it
    Halted,
}

impl StrandStatus {
    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "halted" => Some(Self::Halted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Halted => "halted",
        }
    }
}

impl fmt::Display for StrandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a strand was halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step reported an unrecoverable condition
    Fatal,

    /// Retryable failures kept happening until the retry policy gave up
    RetriesExhausted,

    /// The step broke the engine contract (unknown label, unreaped children, ...)
    ContractViolation,

    /// The step panicked
    Panicked,
}

/// Failure record kept on a halted strand for diagnosis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandFailure {
    pub kind: FailureKind,
    pub message: String,

    /// Label the strand was on when it failed
    pub label: String,

    pub at: DateTime<Utc>,
}

impl fmt::Display for StrandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at '{}': {}", self.kind, self.label, self.message)
    }
}

/// Time-bounded exclusive execution right
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One durable, resumable workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    /// Identity of the strand (and, by convention, of the resource it manages)
    pub id: Uuid,

    /// Program whose step table this strand dispatches against
    pub program: String,

    /// Next step to execute
    pub label: String,

    /// Call stack, last element is the top frame
    pub stack: Vec<Frame>,

    /// Owning strand, set only for spawned children
    pub parent_id: Option<Uuid>,

    pub lease: Option<Lease>,

    /// Do not dispatch before this instant
    pub not_before: DateTime<Utc>,

    pub status: StrandStatus,

    /// Final result once the outermost frame returned
    pub exitval: Option<serde_json::Value>,

    /// Value returned by the most recent same-strand sub-call
    pub retval: Option<serde_json::Value>,

    pub failure: Option<StrandFailure>,

    /// Consecutive retryable failures on the current label
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strand {
    /// Current call depth
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The frame steps operate on
    pub fn top_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    /// Whether the strand has reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.status != StrandStatus::Running
    }

    /// Whether no live lease prevents acquisition at `now`
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(true, |l| l.is_expired(now))
    }

    /// Whether the scheduler may pick this strand up at `now`
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.status == StrandStatus::Running && self.not_before <= now && self.is_leasable(now)
    }
}
