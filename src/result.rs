use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const STATUS_OK: &str = "ok";
pub const STATUS_NEEDS_MANUAL: &str = "needs_manual";
pub const STATUS_ERROR: &str = "error";

/// Where the fields of a canonical result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    ToolOutput,
    ArtifactFinal,
    ArtifactSnapshot,
}

impl ResultSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolOutput => "tool_output",
            Self::ArtifactFinal => "artifact_final",
            Self::ArtifactSnapshot => "artifact_snapshot",
        }
    }
}

/// The record a crawl job produces: an insertion-ordered open map.
///
/// Contract keys (`url`, `status`, `captured_at`, ...) live next to diagnostic
/// and provenance keys. The strict view used for validation is
/// [`crate::contract::CrawlOut`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalResult(Map<String, Value>);

impl CanonicalResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// A contract-valid record describing a failed job.
    pub fn error(url: &str, message: impl Into<String>) -> Self {
        let mut result = Self::new();
        result.insert("url", url);
        result.insert("status", STATUS_ERROR);
        result.insert("captured_at", now_rfc3339());
        result.insert("error", message.into());
        result
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Inserts `value` only when `key` is absent or null.
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) {
        match self.0.get(key) {
            Some(Value::Null) | None => {
                self.0.insert(key.to_owned(), value.into());
            }
            Some(_) => {}
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.get_str("status").map(str::trim)
    }

    pub fn is_error(&self) -> bool {
        self.status() == Some(STATUS_ERROR)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for CanonicalResult {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<CanonicalResult> for Map<String, Value> {
    fn from(result: CanonicalResult) -> Self {
        result.0
    }
}

/// UTC timestamp with millisecond precision, e.g. `2026-01-01T00:00:00.000Z`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
