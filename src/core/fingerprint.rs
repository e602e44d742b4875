//! Record canonicalization and content fingerprints
//!
//! Both sync directions identify record content by the MD5 of a canonical
//! JSON form. Canonicalization is total: every value normalizes to exactly
//! one representation, so the same logical content read from either side
//! hashes identically.
//!
//! Normalization rules:
//! - keys are DB column names, sorted (the record type is a BTreeMap)
//! - NULL values are absent from the canonical object
//! - strings are NFC-normalized and trimmed; strings that parse as
//!   timestamps re-render as RFC3339 UTC truncated to seconds
//! - floats round to 9 decimal places
//! - timestamps render as RFC3339 UTC truncated to seconds
//! - string lists sort and dedup (multi-select carries set semantics)
//! - system columns (`_sync_source`, the pair's updated-at column, a
//!   surrogate `id`) are excluded by the caller

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use md5::{Digest, Md5};
use serde_json::Value as JsonValue;
use unicode_normalization::UnicodeNormalization;

use crate::types::{Fingerprint, Record, Value};

/// Column the engine stamps on its own DB writes so triggers suppress echo
pub const SYNC_SOURCE_COLUMN: &str = "_sync_source";

/// Marker value written into `_sync_source`
pub const SYNC_SOURCE_SHEET: &str = "sheet";

/// Build the canonical JSON object for a record.
///
/// `exclude` lists the system columns to drop in addition to NULLs.
pub fn canonicalize(record: &Record, exclude: &[&str]) -> JsonValue {
    let mut object = serde_json::Map::new();
    for (column, value) in record {
        if exclude.contains(&column.as_str()) {
            continue;
        }
        if let Some(canonical) = canonical_value(value) {
            object.insert(column.clone(), canonical);
        }
    }
    JsonValue::Object(object)
}

/// Canonical JSON text; BTreeMap iteration keeps key order stable
pub fn canonical_json(record: &Record, exclude: &[&str]) -> String {
    canonicalize(record, exclude).to_string()
}

/// Lower-hex MD5 over the canonical JSON text
pub fn fingerprint(record: &Record, exclude: &[&str]) -> Fingerprint {
    let mut hasher = Md5::new();
    hasher.update(canonical_json(record, exclude).as_bytes());
    let digest = hasher.finalize();
    Fingerprint::from_digest(digest.as_slice())
}

/// Normalize one value; `None` means absent (NULL)
fn canonical_value(value: &Value) -> Option<JsonValue> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let normalized: String = s.trim().nfc().collect();
            if let Some(ts) = parse_timestamp(&normalized) {
                Some(JsonValue::String(render_timestamp(&ts)))
            } else {
                Some(JsonValue::String(normalized))
            }
        }
        Value::Integer(i) => Some(JsonValue::from(*i)),
        Value::Float(f) => {
            let rounded = (f * 1e9).round() / 1e9;
            serde_json::Number::from_f64(rounded).map(JsonValue::Number)
        }
        Value::Bool(b) => Some(JsonValue::Bool(*b)),
        Value::Timestamp(ts) => Some(JsonValue::String(render_timestamp(ts))),
        Value::StringList(items) => {
            let mut sorted: Vec<String> =
                items.iter().map(|s| s.trim().nfc().collect()).collect();
            sorted.sort();
            sorted.dedup();
            Some(JsonValue::Array(
                sorted.into_iter().map(JsonValue::String).collect(),
            ))
        }
    }
}

fn render_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Recognize the timestamp string shapes both sides emit: RFC3339 and the
/// MySQL datetime form (naive, taken as UTC).
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(entries: &[(&str, Value)]) -> Record {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_system_columns_excluded() {
        let a = record(&[
            ("name", Value::String("x".into())),
            ("_sync_source", Value::String("sheet".into())),
            ("updated_at", Value::String("2024-01-01 00:00:00".into())),
        ]);
        let b = record(&[("name", Value::String("x".into()))]);
        let exclude = [SYNC_SOURCE_COLUMN, "updated_at"];
        assert_eq!(fingerprint(&a, &exclude), fingerprint(&b, &exclude));
    }

    #[test]
    fn test_null_same_as_absent() {
        let a = record(&[("name", Value::String("x".into())), ("age", Value::Null)]);
        let b = record(&[("name", Value::String("x".into()))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_float_precision() {
        // 0.1 + 0.2 differs from 0.3 in the 17th digit only
        let a = record(&[("ratio", Value::Float(0.1 + 0.2))]);
        let b = record(&[("ratio", Value::Float(0.3))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_timestamp_string_matches_timestamp_value() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let a = record(&[("at", Value::Timestamp(instant))]);
        let b = record(&[("at", Value::String("2024-01-01 12:00:00".into()))]);
        let c = record(&[("at", Value::String("2024-01-01T12:00:00Z".into()))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
        assert_eq!(fingerprint(&a, &[]), fingerprint(&c, &[]));
    }

    #[test]
    fn test_timestamp_truncated_to_seconds() {
        let a = record(&[("at", Value::String("2024-01-01 12:00:00.123".into()))]);
        let b = record(&[("at", Value::String("2024-01-01 12:00:00".into()))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_offset_timestamp_converts_to_utc() {
        let a = record(&[("at", Value::String("2024-01-01T20:00:00+08:00".into()))]);
        let b = record(&[("at", Value::String("2024-01-01 12:00:00".into()))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_nfc_normalization_and_trim() {
        // "é" composed (U+00E9) vs decomposed (e + U+0301)
        let a = record(&[("name", Value::String("caf\u{00e9}".into()))]);
        let b = record(&[("name", Value::String(" cafe\u{0301} ".into()))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_string_list_set_semantics() {
        let a = record(&[(
            "tags",
            Value::StringList(vec!["b".into(), "a".into(), "b".into()]),
        )]);
        let b = record(&[("tags", Value::StringList(vec!["a".into(), "b".into()]))]);
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_content_changes_hash() {
        let a = record(&[("age", Value::Integer(1))]);
        let b = record(&[("age", Value::Integer(2))]);
        assert_ne!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[test]
    fn test_hex_shape() {
        let fp = fingerprint(&record(&[("k", Value::Integer(1))]), &[]);
        assert_eq!(fp.as_str().len(), 32);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_plain_string_not_mistaken_for_timestamp() {
        let a = record(&[("name", Value::String("alice".into()))]);
        assert_eq!(
            canonical_json(&a, &[]),
            r#"{"name":"alice"}"#
        );
    }
}
