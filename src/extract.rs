//! Recovery of a JSON object from free-form agent output.
//!
//! Agents wrap their answer in prose or markdown fences, emit several objects,
//! or stop mid-object. Extraction scans for each `{` that can open an object
//! (ignoring braces inside string literals once an object has started) and
//! decodes from there with a streaming decoder, so trailing text is ignored.
//! Numbers are kept as their original tokens.

use std::fmt;

use serde_json::{Map, Value};

const FENCE: &str = "```";

/// Why a response could not be used as a contract object. The variant drives
/// which retry prompt the repair loop sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractIssue {
    EmptyResponse,
    InvalidOrTruncated,
    MultipleTopLevel,
    NotAnObject,
    MissingStatus,
    Unknown,
}

impl ContractIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyResponse => "empty response",
            Self::InvalidOrTruncated => "invalid or truncated JSON",
            Self::MultipleTopLevel => "multiple top-level JSON values",
            Self::NotAnObject => "top-level JSON is not an object",
            Self::MissingStatus => "missing status",
            Self::Unknown => "unknown contract issue",
        }
    }
}

impl fmt::Display for ContractIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First JSON object found in `raw`, whatever its keys.
pub fn extract_first_object(raw: &str) -> anyhow::Result<Map<String, Value>> {
    extract_object(raw, |_| true)
        .ok_or_else(|| anyhow::anyhow!("no valid JSON object found ({})", diagnose(raw)))
}

/// First JSON object in `raw` that carries a non-empty string `status`.
pub fn extract_object_with_status(raw: &str) -> anyhow::Result<Map<String, Value>> {
    extract_object(raw, has_status)
        .ok_or_else(|| anyhow::anyhow!("no JSON object with status found ({})", diagnose(raw)))
}

fn extract_object<P>(raw: &str, accept: P) -> Option<Map<String, Value>>
where
    P: Fn(&Map<String, Value>) -> bool,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(fenced) = first_markdown_fence(raw)
        && let Some(found) = scan_objects(fenced, &accept)
    {
        return Some(found);
    }
    scan_objects(raw, &accept)
}

fn scan_objects<P>(text: &str, accept: &P) -> Option<Map<String, Value>>
where
    P: Fn(&Map<String, Value>) -> bool,
{
    let starts = object_starts(text);
    let found = starts
        .iter()
        .filter_map(|&start| decode_object_prefix(&text[start..]))
        .find(|obj| accept(obj));
    if found.is_some() {
        return found;
    }

    // A stray `{` in prose can put the string tracking out of phase and hide
    // the real object, so retry every remaining brace.
    text.match_indices('{')
        .map(|(idx, _)| idx)
        .filter(|idx| !starts.contains(idx))
        .filter_map(|start| decode_object_prefix(&text[start..]))
        .find(|obj| accept(obj))
}

/// Byte offsets of `{` characters that may open an object. Before the first
/// `{`, text is prose and quotes in it are not string delimiters.
fn object_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                starts.push(idx);
                depth += 1;
            }
            b'}' if depth > 0 => depth -= 1,
            _ => {}
        }
    }

    starts
}

/// Decodes one value from the start of `text`, ignoring whatever follows.
fn decode_object_prefix(text: &str) -> Option<Map<String, Value>> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(obj))) => Some(obj),
        _ => None,
    }
}

fn has_status(obj: &Map<String, Value>) -> bool {
    obj.get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| !status.trim().is_empty())
}

/// Body of the first triple-backtick block. The optional language tag on the
/// opening line is dropped.
pub fn first_markdown_fence(text: &str) -> Option<&str> {
    let start = text.find(FENCE)?;
    let after_open = &text[start + FENCE.len()..];
    let newline = after_open.find('\n')?;
    let body = &after_open[newline + 1..];
    let end = body.find(FENCE)?;
    Some(&body[..end])
}

/// Classifies why `raw` as a whole is not a usable contract object.
///
/// Only the top-level value is considered; objects nested inside a truncated
/// outer object do not count.
pub fn diagnose(raw: &str) -> ContractIssue {
    let mut text = raw.trim();
    if text.is_empty() {
        return ContractIssue::EmptyResponse;
    }
    if text.starts_with(FENCE)
        && let Some(fenced) = first_markdown_fence(text)
    {
        text = fenced.trim();
    }

    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    let top = match stream.next() {
        Some(Ok(value)) => value,
        _ => return ContractIssue::InvalidOrTruncated,
    };
    if matches!(stream.next(), Some(Ok(_))) {
        return ContractIssue::MultipleTopLevel;
    }

    let Value::Object(obj) = top else {
        return ContractIssue::NotAnObject;
    };
    if !has_status(&obj) {
        return ContractIssue::MissingStatus;
    }
    ContractIssue::Unknown
}

/// True when `raw` starts an object that never closes, i.e. the agent ran out
/// of output budget rather than answering with prose.
pub fn looks_truncated(raw: &str) -> bool {
    let mut text = raw.trim();
    if text.starts_with(FENCE) {
        text = match first_markdown_fence(text) {
            Some(fenced) => fenced.trim(),
            None => text
                .split_once('\n')
                .map(|(_, rest)| rest.trim())
                .unwrap_or_default(),
        };
    }
    text.starts_with('{') && diagnose(text) == ContractIssue::InvalidOrTruncated
}
