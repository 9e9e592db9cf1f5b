//! Query-related data models.
//!
//! This module defines bind parameters, per-call options, and the normalized
//! result returned by every statement run through the cluster.

use crate::error::ErrorKind;
use crate::models::ConnectionRole;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One result row, keyed by column name.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arbitrary JSON, bound as the backend's JSON type (text for SQLite)
    Json(JsonValue),
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-call options for `query` and `execute`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Suppress the success audit line (used by internal probes).
    pub silent: bool,
    /// Explicit routing for `query`; text classification is used when unset.
    /// `execute` always runs on the writer.
    pub role: Option<ConnectionRole>,
}

impl QueryOptions {
    /// Options for internal statements that should not be audited.
    pub fn silent() -> Self {
        Self {
            silent: true,
            role: None,
        }
    }

    /// Declare the statement read-only so it may run on a replica.
    pub fn read_only(mut self) -> Self {
        self.role = Some(ConnectionRole::Reader);
        self
    }

    /// Pin the statement to the writer (read-after-write consistency).
    pub fn on_writer(mut self) -> Self {
        self.role = Some(ConnectionRole::Writer);
        self
    }
}

/// Normalized outcome of one statement.
///
/// A failed result never carries rows, counts or an insert id, and a
/// successful result never carries an error. Fields are private so the two
/// shapes can only be built through [`ExecutionResult::succeeded`] and
/// [`ExecutionResult::failed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<Vec<JsonRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    affected_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    insert_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn succeeded(rows: Vec<JsonRow>, affected_rows: u64, insert_id: Option<u64>) -> Self {
        Self {
            success: true,
            rows: Some(rows),
            affected_rows: Some(affected_rows),
            insert_id,
            error: None,
        }
    }

    pub fn failed(error: ErrorKind) -> Self {
        Self {
            success: false,
            rows: None,
            affected_rows: None,
            insert_id: None,
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn rows(&self) -> Option<&[JsonRow]> {
        self.rows.as_deref()
    }

    pub fn affected_rows(&self) -> Option<u64> {
        self.affected_rows
    }

    pub fn insert_id(&self) -> Option<u64> {
        self.insert_id
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Number of rows returned (0 for failed results).
    pub fn row_count(&self) -> usize {
        self.rows.as_ref().map_or(0, Vec::len)
    }

    /// First row, if any.
    pub fn first_row(&self) -> Option<&JsonRow> {
        self.rows.as_ref().and_then(|rows| rows.first())
    }
}
