//! Recording status model.
//!
//! The store keeps `status` as text and `errorMetadata` as a JSON document.
//! Both are parsed into typed values here and only serialized again at the
//! storage boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingStatus {
    Pending,
    AskingToJoin,
    Joined,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Pending => "PENDING",
            RecordingStatus::AskingToJoin => "ASKING_TO_JOIN",
            RecordingStatus::Joined => "JOINED",
            RecordingStatus::Completed => "COMPLETED",
            RecordingStatus::Failed => "FAILED",
            RecordingStatus::Timeout => "TIMEOUT",
            RecordingStatus::Cancelled => "CANCELLED",
        }
    }

    /// States after which the recording's active lifecycle ends.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordingStatus::Completed
                | RecordingStatus::Failed
                | RecordingStatus::Timeout
                | RecordingStatus::Cancelled
        )
    }

    /// Non-terminal signals derived from recorder log output.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            RecordingStatus::AskingToJoin | RecordingStatus::Joined
        )
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "ASKING_TO_JOIN" => Ok(Self::AskingToJoin),
            "JOINED" => Ok(Self::Joined),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown recording status '{other}'")),
        }
    }
}

/// Structured `errorMetadata` document.
///
/// `attempt` records which attempt produced the current status and never
/// decreases for a given recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetadata {
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_timed_out: Option<bool>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ErrorMetadata {
    /// Parse a stored document leniently.
    ///
    /// Accepts an object, or a string holding a JSON object (older rows).
    /// `attempt` may be a number or a numeric string; anything else falls back
    /// to 1. Returns `None` when the value is not an object at all.
    pub fn from_stored(value: &Value) -> Option<Self> {
        let object = match value {
            Value::Object(map) => map.clone(),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => return None,
            },
            _ => return None,
        };

        let mut meta = ErrorMetadata {
            attempt: 1,
            ..Default::default()
        };
        for (key, value) in object {
            match key.as_str() {
                "attempt" => meta.attempt = parse_attempt(&value).unwrap_or(1),
                "error" => meta.error = value.as_str().map(str::to_string),
                "exitCode" => meta.exit_code = value.as_i64(),
                "isTimedOut" => meta.is_timed_out = value.as_bool(),
                _ => {
                    meta.details.insert(key, value);
                }
            }
        }
        Some(meta)
    }

    /// Serialize for storage.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Fold a status write's details into this document.
    pub fn merge(&mut self, details: StatusDetails) {
        if details.error.is_some() {
            self.error = details.error;
        }
        if details.exit_code.is_some() {
            self.exit_code = details.exit_code;
        }
        if details.is_timed_out.is_some() {
            self.is_timed_out = details.is_timed_out;
        }
        self.details.extend(details.extra);
    }
}

fn parse_attempt(value: &Value) -> Option<u32> {
    let attempt: Option<u32> = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    attempt.filter(|attempt| *attempt >= 1)
}

/// Details attached to a status write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDetails {
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub is_timed_out: Option<bool>,
    pub extra: Map<String, Value>,
}

impl StatusDetails {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn exit(exit_code: i64, is_timed_out: bool) -> Self {
        Self {
            exit_code: Some(exit_code),
            is_timed_out: Some(is_timed_out),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

/// The slice of a recording row this service reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingState {
    pub status: RecordingStatus,
    pub error_metadata: Option<ErrorMetadata>,
}

impl RecordingState {
    pub fn new(status: RecordingStatus) -> Self {
        Self {
            status,
            error_metadata: None,
        }
    }

    /// Attempt that produced the current status; 1 when nothing is recorded.
    pub fn current_attempt(&self) -> u32 {
        self.error_metadata.as_ref().map_or(1, |m| m.attempt.max(1))
    }
}
