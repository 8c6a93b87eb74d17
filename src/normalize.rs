use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::result::{CanonicalResult, now_rfc3339};

/// Brings a candidate result into canonical shape. Applying it twice yields
/// the same result as applying it once.
///
/// - `url` and `captured_at` are filled in when absent.
/// - `currency` is trimmed and upper-cased.
/// - blank or null `price` is removed; string prices are trimmed.
/// - `images` becomes an array of unique, non-empty strings.
/// - each variation's `image`/`images` are merged into one de-duplicated list,
///   with the first entry kept as `image`.
///
/// Fields of the wrong JSON type are left as they are so validation can
/// reject them.
pub fn normalize(result: &mut CanonicalResult, fallback_url: &str) {
    result.set_default("url", fallback_url);
    result.set_default("captured_at", now_rfc3339());

    normalize_currency(result);
    normalize_price(result);

    if is_image_list(result.get("images")) {
        let images = dedup_images(result.get("images"));
        result.insert("images", images.into_iter().map(Value::String).collect::<Vec<_>>());
    }

    let variations: Vec<Value> = match result.get("variations") {
        Some(Value::Array(items)) => items.iter().cloned().map(normalize_variation).collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return,
    };
    result.insert("variations", variations);
}

/// An image field that can be normalized: absent, null, a list or one string.
fn is_image_list(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null | Value::Array(_) | Value::String(_)))
}

fn normalize_currency(result: &mut CanonicalResult) {
    let Some(currency) = result.get_str("currency") else {
        return;
    };
    let normalized = currency.trim().to_uppercase();
    if normalized.is_empty() {
        result.remove("currency");
    } else {
        result.insert("currency", normalized);
    }
}

fn normalize_price(result: &mut CanonicalResult) {
    match result.get("price") {
        Some(Value::Null) => {
            result.remove("price");
        }
        Some(Value::String(raw)) => {
            let trimmed = raw.trim().to_owned();
            if trimmed.is_empty() {
                result.remove("price");
            } else {
                result.insert("price", trimmed);
            }
        }
        _ => {}
    }
}

fn normalize_variation(item: Value) -> Value {
    let Value::Object(mut variation) = item else {
        return item;
    };

    if let Some(Value::String(title)) = variation.get("title") {
        let title = title.trim().to_owned();
        variation.insert("title".to_owned(), Value::String(title));
    }

    let image_ok = matches!(variation.get("image"), None | Some(Value::Null | Value::String(_)));
    if !image_ok || !is_image_list(variation.get("images")) {
        return Value::Object(variation);
    }

    let mut candidates = Vec::new();
    if let Some(image) = variation.get("image") {
        candidates.push(image.clone());
    }
    match variation.get("images") {
        Some(Value::Array(images)) => candidates.extend(images.iter().cloned()),
        Some(single @ Value::String(_)) => candidates.push(single.clone()),
        _ => {}
    }
    let images = dedup_images(Some(&Value::Array(candidates)));

    set_variation_images(&mut variation, images);
    Value::Object(variation)
}

fn set_variation_images(variation: &mut Map<String, Value>, images: Vec<String>) {
    match images.first() {
        Some(first) => {
            variation.insert("image".to_owned(), Value::String(first.clone()));
        }
        None => {
            variation.shift_remove("image");
        }
    }
    variation.insert(
        "images".to_owned(),
        Value::Array(images.into_iter().map(Value::String).collect()),
    );
}

/// Unique non-empty trimmed strings from an image list, in first-seen order.
/// A bare string is treated as a one-element list.
pub fn dedup_images(value: Option<&Value>) -> Vec<String> {
    let items: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single @ Value::String(_)) => vec![single],
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_owned)
        .collect()
}
