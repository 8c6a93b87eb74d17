//! The crawl output contract and its validator.
//!
//! [`CrawlOut`] is a typed projection of a [`CanonicalResult`], built only at
//! the validation boundary. Keys outside the contract are ignored.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::result::{CanonicalResult, STATUS_ERROR, STATUS_NEEDS_MANUAL, STATUS_OK};

/// JSON schema sent to agents in repair prompts.
pub const CONTRACT_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["url", "status", "captured_at"],
  "properties": {
    "url": { "type": "string" },
    "status": { "enum": ["ok", "needs_manual", "error"] },
    "captured_at": { "type": "string", "format": "date-time" },
    "notes": { "type": "string", "description": "required when status=needs_manual" },
    "error": { "type": "string", "description": "required when status=error" },
    "title": { "type": "string" },
    "description": { "type": "string" },
    "currency": { "type": "string" },
    "price": { "type": ["number", "string"], "pattern": "^[0-9]+(\\.[0-9]+)?$" },
    "images": { "type": "array", "items": { "type": "string" } },
    "variations": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["title", "position"],
        "properties": {
          "title": { "type": "string" },
          "position": { "type": "integer", "minimum": 0 },
          "image": { "type": "string" },
          "images": { "type": "array", "items": { "type": "string" } }
        }
      }
    }
  }
}"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlOut {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub captured_at: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub images: Option<Vec<Value>>,
    #[serde(default)]
    pub variations: Option<Vec<Variation>>,
}

/// A purchasable option of a product. Older outputs carry a single `image`,
/// newer ones an `images` list; normalization keeps both in step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .0.join("; "))]
pub struct ContractViolations(pub Vec<String>);

impl CrawlOut {
    pub fn from_map(candidate: &Map<String, Value>) -> Result<Self, ContractViolations> {
        serde_json::from_value(Value::Object(candidate.clone()))
            .map_err(|err| ContractViolations(vec![format!("decode: {err}")]))
    }

    pub fn validate(&self) -> Result<(), ContractViolations> {
        let mut violations = Vec::new();

        if is_blank(self.url.as_deref()) {
            violations.push("url: required".to_owned());
        }

        let status = self.status.as_deref().map(str::trim).unwrap_or_default();
        if ![STATUS_OK, STATUS_NEEDS_MANUAL, STATUS_ERROR].contains(&status) {
            violations.push(format!(
                "status: must be one of ok, needs_manual, error (got {status:?})"
            ));
        }

        match self.captured_at.as_deref().map(str::trim) {
            None | Some("") => violations.push("captured_at: required".to_owned()),
            Some(ts) if DateTime::parse_from_rfc3339(ts).is_err() => {
                violations.push(format!("captured_at: not an RFC3339 timestamp ({ts:?})"));
            }
            Some(_) => {}
        }

        if status == STATUS_NEEDS_MANUAL && is_blank(self.notes.as_deref()) {
            violations.push("notes: required when status=needs_manual".to_owned());
        }
        if status == STATUS_ERROR && is_blank(self.error.as_deref()) {
            violations.push("error: required when status=error".to_owned());
        }

        if let Some(price) = &self.price
            && !is_valid_price(price)
        {
            violations.push(format!("price: must be a number or numeric string (got {price})"));
        }

        for (idx, variation) in self.variations.iter().flatten().enumerate() {
            if is_blank(variation.title.as_deref()) {
                violations.push(format!("variations[{idx}].title: required"));
            }
            if variation.position.is_some_and(|position| position < 0) {
                violations.push(format!("variations[{idx}].position: must be >= 0"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ContractViolations(violations))
        }
    }
}

/// Projects `result` onto the contract and validates it.
pub fn validate(result: &CanonicalResult) -> Result<CrawlOut, ContractViolations> {
    let out = CrawlOut::from_map(result.as_map())?;
    out.validate()?;
    Ok(out)
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|value| value.trim().is_empty())
}

fn is_valid_price(price: &Value) -> bool {
    match price {
        Value::Null | Value::Number(_) => true,
        Value::String(raw) => is_numeric_string(raw.trim()),
        _ => false,
    }
}

/// `^[0-9]+(\.[0-9]+)?$`
pub fn is_numeric_string(raw: &str) -> bool {
    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    match raw.split_once('.') {
        Some((int, frac)) => all_digits(int) && all_digits(frac),
        None => all_digits(raw),
    }
}
