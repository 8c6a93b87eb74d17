//! Results recovered from files an agent pipeline wrote to its run directory.
//!
//! Two layouts exist under `<out_dir>/artifacts/<run_id>/`: a contract-shaped
//! `final.json`, or a set of per-facet snapshot files named by a pointer object
//! that the agent prints as its answer.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::CrawlError;
use crate::extract::{extract_first_object, extract_object_with_status};
use crate::normalize::dedup_images;
use crate::result::{CanonicalResult, STATUS_ERROR, STATUS_NEEDS_MANUAL, STATUS_OK, now_rfc3339};

pub const FINAL_RECORD_FILE: &str = "final.json";

const DEFAULT_MANUAL_NOTES: &str = "blocked or requires manual intervention";
const DEFAULT_SNAPSHOT_ERROR: &str = "snapshot failed";
const MOUNT_ROOTS: [&str; 4] = ["/out", "/app", "/codex", "/gemini"];

/// `<out_dir>/artifacts/<run_id>`
pub fn artifact_dir(out_dir: &Path, run_id: &str) -> PathBuf {
    out_dir.join("artifacts").join(run_id)
}

/// Reads `final.json` from `dir`. Scraped text sometimes leaves raw control
/// characters in strings, so those are escaped before giving up.
pub async fn load_final_record(dir: &Path) -> Result<CanonicalResult, CrawlError> {
    let path = dir.join(FINAL_RECORD_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read {FINAL_RECORD_FILE}"))
        .map_err(|err| CrawlError::artifact(&path, &err))?;

    let record = decode_object(&bytes)
        .or_else(|_| decode_object(&sanitize_control_chars(&bytes)))
        .or_else(|_| extract_object_with_status(&String::from_utf8_lossy(&bytes)))
        .context("final record is not a JSON object with status")
        .map_err(|err| CrawlError::artifact(&path, &err))?;
    Ok(CanonicalResult::from(record))
}

/// Where a snapshot pointer's files may live when it does not say.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotContext<'a> {
    pub out_dir: &'a Path,
    pub run_id: Option<&'a str>,
}

impl SnapshotContext<'_> {
    fn known_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.out_dir.to_path_buf()];
        roots.extend(MOUNT_ROOTS.iter().map(PathBuf::from));
        roots
    }

    fn run_dir_candidates(&self, run_id: &str) -> [PathBuf; 3] {
        [
            artifact_dir(self.out_dir, run_id),
            artifact_dir(Path::new("out"), run_id),
            artifact_dir(Path::new("/out"), run_id),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotFiles {
    pub snapshot: String,
    pub page_html: String,
    pub page_state: String,
    pub overlay_images: String,
    pub variations: String,
    pub variation_image_map: String,
}

impl SnapshotFiles {
    fn all(&self) -> [&str; 6] {
        [
            self.page_state.as_str(),
            self.snapshot.as_str(),
            self.page_html.as_str(),
            self.overlay_images.as_str(),
            self.variations.as_str(),
            self.variation_image_map.as_str(),
        ]
    }

    fn absolute_paths(&self) -> impl Iterator<Item = &Path> {
        self.all()
            .into_iter()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(Path::new)
            .filter(|path| path.is_absolute())
    }
}

/// The small object a snapshot skill prints instead of the full result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotPointer {
    pub url: String,
    pub status: String,
    pub captured_at: String,
    pub run_id: String,
    pub artifact_dir: String,
    pub snapshot_files: SnapshotFiles,
    pub notes: String,
    pub error: String,
}

impl SnapshotPointer {
    /// Parses the pointer from agent output, tolerating prose around it.
    pub fn parse(raw: &str, ctx: &SnapshotContext<'_>) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            anyhow::bail!("empty snapshot pointer");
        }
        let object = extract_first_object(raw).context("invalid snapshot pointer JSON")?;
        let mut pointer: Self = serde_json::from_value(Value::Object(object))
            .context("invalid snapshot pointer JSON")?;

        if pointer.url.trim().is_empty() {
            anyhow::bail!("snapshot pointer missing url");
        }
        if pointer.status.trim().is_empty() {
            anyhow::bail!("snapshot pointer missing status");
        }
        if pointer.artifact_dir.trim().is_empty() {
            match pointer.infer_artifact_dir(ctx) {
                Some(dir) => pointer.artifact_dir = dir.to_string_lossy().into_owned(),
                None if pointer.snapshot_files.absolute_paths().next().is_some() => {}
                None => anyhow::bail!("snapshot pointer missing artifact_dir"),
            }
        }
        Ok(pointer)
    }

    /// The parent of the first absolute file path under a known root, else the
    /// run directory for the pointer's (or the request's) run id.
    fn infer_artifact_dir(&self, ctx: &SnapshotContext<'_>) -> Option<PathBuf> {
        let roots = ctx.known_roots();
        let from_files = self.snapshot_files.absolute_paths().find_map(|path| {
            roots
                .iter()
                .any(|root| path.starts_with(root))
                .then(|| path.parent().map(Path::to_path_buf))
                .flatten()
        });
        if from_files.is_some() {
            return from_files;
        }

        let run_id = Some(self.run_id.trim())
            .filter(|id| !id.is_empty())
            .or(ctx.run_id)?;
        let candidates = ctx.run_dir_candidates(run_id);
        let existing = candidates.iter().find(|dir| dir.is_dir()).cloned();
        let [first, ..] = candidates;
        Some(existing.unwrap_or(first))
    }

    /// Resolves a file reference against the artifact directory. References
    /// that already start with that directory are not prefixed twice.
    pub fn file_path(&self, reference: &str) -> Option<PathBuf> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        let path = Path::new(reference);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        let dir = self.artifact_dir.trim();
        if dir.is_empty() {
            return Some(path.to_path_buf());
        }

        let dir = clean(Path::new(dir));
        let path = clean(path);
        if path.starts_with(&dir) {
            Some(path)
        } else {
            Some(dir.join(path))
        }
    }
}

/// Lexically normalized path: `.` components and repeated separators dropped.
fn clean(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

/// Merges the snapshot files named by `pointer` into one result.
///
/// Only the page state is required for an `ok` pointer; images, variations
/// and the variation-image map are read when present.
pub async fn build_from_snapshot(
    pointer: &SnapshotPointer,
    fallback_url: &str,
) -> Result<CanonicalResult, CrawlError> {
    let mut result = CanonicalResult::new();
    let url = Some(pointer.url.trim())
        .filter(|url| !url.is_empty())
        .unwrap_or(fallback_url.trim());
    result.insert("url", url);

    let status = pointer.status.trim();
    result.insert("status", status);
    let captured_at = pointer.captured_at.trim();
    if captured_at.is_empty() {
        result.insert("captured_at", now_rfc3339());
    } else {
        result.insert("captured_at", captured_at);
    }

    match status {
        STATUS_NEEDS_MANUAL => {
            result.insert("notes", or_default(&pointer.notes, DEFAULT_MANUAL_NOTES));
            result.insert("images", Value::Array(Vec::new()));
            result.insert("variations", Value::Array(Vec::new()));
            return Ok(result);
        }
        STATUS_ERROR => {
            result.insert("error", or_default(&pointer.error, DEFAULT_SNAPSHOT_ERROR));
            result.insert("images", Value::Array(Vec::new()));
            result.insert("variations", Value::Array(Vec::new()));
            return Ok(result);
        }
        STATUS_OK => {}
        other => {
            return Err(CrawlError::Extraction(format!(
                "unsupported snapshot status: {other:?}"
            )));
        }
    }

    let page_state = pointer
        .file_path(&pointer.snapshot_files.page_state)
        .ok_or_else(|| {
            CrawlError::Extraction("snapshot pointer missing snapshot_files.page_state".to_owned())
        })?;
    let bytes = tokio::fs::read(&page_state)
        .await
        .context("read page_state")
        .map_err(|err| CrawlError::artifact(&page_state, &err))?;
    let core = extract_core(&bytes).map_err(|err| CrawlError::artifact(&page_state, &err))?;
    result.insert("title", core.title);
    result.insert("description", core.description);
    result.insert("currency", core.currency);
    result.insert("price", core.price);

    let images = match read_optional(pointer, &pointer.snapshot_files.overlay_images).await {
        Some(bytes) => images_from_json(&bytes),
        None => Vec::new(),
    };
    result.insert("images", images);

    let mut variations = match read_optional(pointer, &pointer.snapshot_files.variations).await {
        Some(bytes) => variations_from_json(&bytes),
        None => Vec::new(),
    };
    if !variations.is_empty()
        && let Some(bytes) =
            read_optional(pointer, &pointer.snapshot_files.variation_image_map).await
    {
        let by_text = variation_image_map_from_json(&bytes);
        for variation in &mut variations {
            if variation.image.is_none() {
                variation.image = by_text.get(&variation.title).cloned();
            }
        }
    }
    result.insert(
        "variations",
        variations
            .into_iter()
            .map(SnapshotVariation::into_value)
            .collect::<Vec<_>>(),
    );

    Ok(result)
}

fn or_default(value: &str, default: &str) -> String {
    match value.trim() {
        "" => default.to_owned(),
        value => value.to_owned(),
    }
}

async fn read_optional(pointer: &SnapshotPointer, reference: &str) -> Option<Vec<u8>> {
    let path = pointer.file_path(reference)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skip unreadable snapshot file");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreFields {
    pub title: String,
    pub description: String,
    pub currency: String,
    pub price: Value,
}

impl CoreFields {
    fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let text = |key: &str| match obj.get(key) {
            Some(Value::String(s)) => s.trim().to_owned(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let core = Self {
            title: text("title"),
            description: text("description"),
            currency: text("currency"),
            price: obj.get("price").cloned().unwrap_or(Value::Null),
        };
        core.is_complete().then_some(core)
    }

    fn is_complete(&self) -> bool {
        let price_present = match &self.price {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        };
        !self.title.is_empty()
            && !self.description.is_empty()
            && !self.currency.is_empty()
            && price_present
    }
}

/// Title, description, currency and price from a page-state file, preferring
/// its `extracted` object over top-level keys.
pub fn extract_core(bytes: &[u8]) -> anyhow::Result<CoreFields> {
    let obj = match decode_object(bytes) {
        Ok(obj) => obj,
        Err(err) => {
            let sanitized = sanitize_control_chars(bytes);
            let retried = if sanitized != bytes {
                decode_object(&sanitized)
            } else {
                Err(err)
            };
            match retried {
                Ok(obj) => obj,
                Err(err) => {
                    return core_from_extracted_fragment(bytes)
                        .ok_or(err)
                        .context("invalid page_state.json (must be JSON)");
                }
            }
        }
    };

    obj.get("extracted")
        .and_then(Value::as_object)
        .and_then(CoreFields::from_object)
        .or_else(|| CoreFields::from_object(&obj))
        .context(
            "page_state.json missing extracted core fields (title/description/currency/price)",
        )
}

/// Last resort for page states that are not JSON as a whole: parse only the
/// object following the `"extracted"` key.
fn core_from_extracted_fragment(bytes: &[u8]) -> Option<CoreFields> {
    let text = String::from_utf8_lossy(bytes);
    let key = text.find("\"extracted\"")?;
    let colon = key + text[key..].find(':')?;
    let start = colon + text[colon..].find('{')?;
    let end = find_matching_object_end(text.as_bytes(), start)?;

    let fragment = sanitize_control_chars(&text.as_bytes()[start..end]);
    let obj = decode_object(&fragment).ok()?;
    CoreFields::from_object(&obj)
}

/// Index one past the `}` that closes the object opened at `start`.
pub fn find_matching_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &byte) in bytes.iter().enumerate().skip(start) {
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
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escapes raw control bytes that sit inside string literals. Structure is
/// left alone.
pub fn sanitize_control_chars(input: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(input.len() + 64);
    let mut in_string = false;
    let mut escaped = false;

    for &byte in input {
        if !in_string {
            out.push(byte);
            if byte == b'"' {
                in_string = true;
                escaped = false;
            }
            continue;
        }
        if escaped {
            out.push(byte);
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => {
                out.push(byte);
                escaped = true;
            }
            b'"' => {
                out.push(byte);
                in_string = false;
            }
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            byte if byte < 0x20 => {
                out.extend_from_slice(b"\\u00");
                out.push(HEX[usize::from(byte >> 4)]);
                out.push(HEX[usize::from(byte & 0x0f)]);
            }
            byte => out.push(byte),
        }
    }
    out
}

/// First JSON value in `bytes`, which must be an object.
fn decode_object(bytes: &[u8]) -> anyhow::Result<Map<String, Value>> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(obj))) => Ok(obj),
        Some(Ok(_)) => anyhow::bail!("top-level JSON is not an object"),
        Some(Err(err)) => Err(err.into()),
        None => anyhow::bail!("empty JSON document"),
    }
}

/// Accepts `{"images": [...]}` or a bare array.
pub fn images_from_json(bytes: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return Vec::new();
    };
    dedup_images(unwrap_list(&value, "images"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SnapshotVariation {
    title: String,
    position: i64,
    image: Option<String>,
}

impl SnapshotVariation {
    fn into_value(self) -> Value {
        match self.image {
            Some(image) => json!({
                "title": self.title,
                "position": self.position,
                "image": image,
                "images": [image],
            }),
            None => json!({
                "title": self.title,
                "position": self.position,
                "images": [],
            }),
        }
    }
}

/// Accepts `{"variations": [{"position", "text"}]}` or a bare array. Entries
/// without text are dropped.
fn variations_from_json(bytes: &[u8]) -> Vec<SnapshotVariation> {
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return Vec::new();
    };
    let Some(Value::Array(items)) = unwrap_list(&value, "variations") else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let title = item.get("text")?.as_str()?.trim();
            if title.is_empty() {
                return None;
            }
            let position = item.get("position").and_then(Value::as_i64).unwrap_or(0);
            Some(SnapshotVariation {
                title: title.to_owned(),
                position,
                image: None,
            })
        })
        .collect()
}

/// Accepts `{"map": [{"text", "imageUrl"}]}` or `[{"variation", "image"}]`.
/// The first image seen for a variation wins.
fn variation_image_map_from_json(bytes: &[u8]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return map;
    };
    let Some(Value::Array(items)) = unwrap_list(&value, "map") else {
        return map;
    };

    let field = |item: &Value, primary: &str, secondary: &str| -> Option<String> {
        [primary, secondary]
            .into_iter()
            .filter_map(|key| item.get(key).and_then(Value::as_str).map(str::trim))
            .find(|text| !text.is_empty())
            .map(str::to_owned)
    };
    for item in items {
        let (Some(text), Some(image)) = (
            field(item, "text", "variation"),
            field(item, "imageUrl", "image"),
        ) else {
            continue;
        };
        map.entry(text).or_insert(image);
    }
    map
}

/// `value[key]` when `value` is an object wrapping a non-empty array, else
/// `value` itself.
fn unwrap_list<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(obj) => match obj.get(key) {
            Some(list @ Value::Array(items)) if !items.is_empty() => Some(list),
            _ => None,
        },
        Value::Array(_) => Some(value),
        _ => None,
    }
}
