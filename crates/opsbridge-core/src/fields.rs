//! Field resolution over nested incident payloads.
//!
//! Incident-management webhooks deliver custom fields in two shapes: a flat
//! `slug -> value` mapping, or a list of field-selection records where the
//! value hides inside the first selected option. [`normalize_custom_fields`]
//! folds both shapes into the flat form. [`resolve`] walks dotted paths
//! through the raw payload, with a shortcut for `data.custom_fields.<slug>`
//! that tolerates case and punctuation drift in the slug.
//!
//! Every function here is total: absent or malformed data yields `None` or
//! an empty map, never an error.

use std::collections::BTreeMap;

use serde_json::Value;

/// Priority order for extracting a value out of a selected-option record.
const OPTION_VALUE_KEYS: [&str; 5] = ["value", "slug", "name", "label", "text"];

/// Normalizes a key for comparison: lowercase, runs of non-alphanumerics
/// collapsed to a single underscore, leading/trailing underscores trimmed.
///
/// `"Watch-ID "` and `"watch_id"` normalize to the same key.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut pending_sep = false;
    for ch in lower.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Sanitizes a job-option name to a conservative identifier charset.
///
/// Characters outside `[A-Za-z0-9_-]` each become an underscore; leading and
/// trailing underscores are trimmed.
#[must_use]
pub fn sanitize_option_key(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_matches('_').to_string()
}

/// Renders a JSON value as the string a job option expects.
///
/// Strings pass through untouched; everything else uses its JSON rendering.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Returns true if a selected-option entry carries a usable value.
///
/// Mirrors loose truthiness at the wire: null, `false`, `0`, and the empty
/// string are all "no value here".
fn is_usable(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Normalizes raw custom-field data into a flat `slug -> value` mapping.
///
/// Accepts either the flat mapping form (values stringified, null/blank
/// entries dropped) or the list-of-selection-records form. For the list
/// form, each record's slug comes from `custom_field.slug` (falling back to
/// `custom_field.name`), and its value from the first `selected_options`
/// entry — preferring `value`, then `slug`, `name`, `label`, `text` — with a
/// final fallback to the record's bare `value` field. Blank results are
/// dropped.
#[must_use]
pub fn normalize_custom_fields(raw: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    match raw {
        Value::Object(map) => {
            for (key, value) in map {
                if value.is_null() {
                    continue;
                }
                let text = value_to_string(value);
                if text.trim().is_empty() {
                    continue;
                }
                out.insert(key.clone(), text);
            }
        }
        Value::Array(records) => {
            for record in records {
                let Some(record) = record.as_object() else {
                    continue;
                };
                let meta = record.get("custom_field").and_then(Value::as_object);
                let slug = meta
                    .and_then(|m| m.get("slug").and_then(Value::as_str))
                    .or_else(|| meta.and_then(|m| m.get("name").and_then(Value::as_str)))
                    .unwrap_or("")
                    .trim();
                if slug.is_empty() {
                    continue;
                }

                let mut value = record
                    .get("selected_options")
                    .and_then(Value::as_array)
                    .and_then(|options| options.first())
                    .and_then(Value::as_object)
                    .and_then(|option| {
                        OPTION_VALUE_KEYS
                            .iter()
                            .filter_map(|key| option.get(*key))
                            .find(|candidate| is_usable(candidate))
                    });
                if value.is_none() {
                    value = record.get("value");
                }

                if let Some(value) = value {
                    if value.is_null() {
                        continue;
                    }
                    let text = value_to_string(value);
                    let text = text.trim();
                    if !text.is_empty() {
                        out.insert(slug.to_string(), text.to_string());
                    }
                }
            }
        }
        _ => {}
    }
    out
}

/// Looks up a custom field by slug, tolerating case/punctuation drift.
///
/// The payload's `data.custom_fields` (either shape) is normalized first;
/// both the wanted slug and the stored slugs are compared via
/// [`normalize_key`].
#[must_use]
pub fn custom_field_value(payload: &Value, slug: &str) -> Option<String> {
    if slug.is_empty() {
        return None;
    }
    let fields = payload
        .get("data")
        .and_then(|data| data.get("custom_fields"))
        .map(normalize_custom_fields)
        .unwrap_or_default();
    let want = normalize_key(&slug.replace('-', "_"));
    fields
        .iter()
        .find(|(key, _)| normalize_key(key) == want)
        .map(|(_, value)| value.clone())
}

/// Resolves a dot-separated path against a nested payload.
///
/// Paths of the form `data.custom_fields.<slug>` bypass generic traversal
/// and consult the normalized custom-field mapping. Generic traversal
/// descends mappings by key; sequences by numeric index, or — for a
/// non-numeric segment — by collecting the named field from every element
/// that has it (one hit yields the value itself, several yield the
/// collected array).
///
/// Absent at any hop short-circuits to `None`; this never fails.
#[must_use]
pub fn resolve(payload: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.len() >= 3 && parts[0] == "data" && parts[1] == "custom_fields" {
        let slug = parts[2..].join(".");
        return custom_field_value(payload, &slug).map(Value::String);
    }

    let mut cursor = payload.clone();
    for part in parts {
        cursor = match cursor {
            Value::Object(ref map) => map.get(part)?.clone(),
            Value::Array(ref items) => {
                if let Ok(index) = part.parse::<usize>() {
                    items.get(index)?.clone()
                } else {
                    let hits: Vec<Value> = items
                        .iter()
                        .filter_map(Value::as_object)
                        .filter(|item| item.contains_key(part))
                        .map(|item| item[part].clone())
                        .collect();
                    match hits.len() {
                        0 => return None,
                        1 => hits.into_iter().next()?,
                        _ => Value::Array(hits),
                    }
                }
            }
            _ => return None,
        };
    }
    if cursor.is_null() { None } else { Some(cursor) }
}

/// Returns true if the path resolves to a present, non-null value.
#[must_use]
pub fn has(payload: &Value, path: &str) -> bool {
    resolve(payload, path).is_some()
}
