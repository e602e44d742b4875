//! Core types for the sync engine
//!
//! Defines the tagged value type flowing between both systems, sync
//! directions, change events, and queue rows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// A field value as the engine sees it.
///
/// Conversion from raw Sheet JSON and from MySQL values happens explicitly at
/// the boundaries; inside the engine only these shapes exist. Unsupported
/// Sheet field shapes (people, attachments, nested objects) are stringified
/// deterministically at conversion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL / absent
    Null,
    /// String value
    String(String),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point
    Float(f64),
    /// Boolean
    Bool(bool),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
    /// Multi-select: list of strings with set semantics
    StringList(Vec<String>),
}

impl Value {
    /// Check if the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may serve as an external identity (key field)
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::String(_) | Value::Integer(_) | Value::Float(_) | Value::Bool(_)
        )
    }

    /// Render the value as the string used for key comparison and id_mapping
    pub fn key_repr(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            Value::StringList(items) => items.join(","),
        }
    }

    /// Convert a raw Sheet JSON field value.
    ///
    /// Total: every JSON shape maps to exactly one `Value`. Arrays that are
    /// not plain string lists and objects are stringified with sorted keys so
    /// the result does not depend on the Sheet's serialization order.
    pub fn from_sheet_json(raw: &JsonValue) -> Value {
        match raw {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => {
                if items.iter().all(|v| v.is_string()) {
                    Value::StringList(
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect(),
                    )
                } else {
                    Value::String(deterministic_json_string(raw))
                }
            }
            JsonValue::Object(_) => Value::String(deterministic_json_string(raw)),
        }
    }

    /// Render for the Sheet API: timestamps become their string form
    pub fn to_sheet_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            }
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Timestamp(ts) => {
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Value::StringList(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Timestamp(ts) => {
                write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Value::StringList(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Re-serialize a JSON value with recursively sorted object keys.
fn deterministic_json_string(raw: &JsonValue) -> String {
    fn sort(v: &JsonValue) -> JsonValue {
        match v {
            JsonValue::Object(map) => {
                let sorted: BTreeMap<&String, JsonValue> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(JsonValue::Null)
            }
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(raw).to_string()
}

/// A record keyed by DB column name.
///
/// BTreeMap keeps keys sorted, which the canonical form relies on.
pub type Record = BTreeMap<String, Value>;

/// Which way a write travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sheet edit applied to the DB
    SheetToDb,
    /// DB change applied to the Sheet
    DbToSheet,
}

impl Direction {
    /// The string stored in `sync_log.direction`
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SheetToDb => "sheet_to_db",
            Direction::DbToSheet => "db_to_sheet",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::SheetToDb => Direction::DbToSheet,
            Direction::DbToSheet => Direction::SheetToDb,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of change a record underwent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    /// Parse the action strings the DB trigger writes into `sync_queue`
    pub fn from_queue_str(s: &str) -> Option<ChangeAction> {
        match s {
            "INSERT" => Some(ChangeAction::Create),
            "UPDATE" => Some(ChangeAction::Update),
            "DELETE" => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Create => write!(f, "CREATE"),
            ChangeAction::Update => write!(f, "UPDATE"),
            ChangeAction::Delete => write!(f, "DELETE"),
        }
    }
}

/// Content hash of a canonical record: 32 lower-hex chars of MD5
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-hex digest (e.g. read back from `sync_log`)
    pub fn from_hex(hex: String) -> Fingerprint {
        Fingerprint(hex)
    }

    /// Hex-encode a raw 16-byte digest
    pub fn from_digest(bytes: &[u8]) -> Fingerprint {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            hex.push_str(&format!("{:02x}", b));
        }
        Fingerprint(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A change discovered by the poller, ready to apply to the DB
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Pair name (`sheet_db:sheet_table`)
    pub pair: String,
    pub action: ChangeAction,
    /// The Sheet's record identifier
    pub external_id: String,
    /// Value of the key field, identity on the DB side
    pub key_value: Value,
    /// Mapped payload keyed by DB column; empty for deletes
    pub payload: Record,
    pub fingerprint: Fingerprint,
    pub detected_at: DateTime<Utc>,
}

/// Processing state of a `sync_queue` row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

/// A claimed row from `sync_queue`
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub id: u64,
    /// DB table the trigger fired on
    pub table: String,
    /// Key value of the changed row, as the trigger recorded it
    pub record_id: String,
    pub action: ChangeAction,
    pub old_json: Option<String>,
    pub new_json: Option<String>,
    /// Hash the trigger computed; advisory, the engine recomputes
    pub sync_hash: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_sheet_json_scalars() {
        assert_eq!(Value::from_sheet_json(&json!(null)), Value::Null);
        assert_eq!(Value::from_sheet_json(&json!(true)), Value::Bool(true));
        assert_eq!(Value::from_sheet_json(&json!(42)), Value::Integer(42));
        assert_eq!(Value::from_sheet_json(&json!(1.5)), Value::Float(1.5));
        assert_eq!(
            Value::from_sheet_json(&json!("hi")),
            Value::String("hi".into())
        );
    }

    #[test]
    fn test_from_sheet_json_string_list() {
        assert_eq!(
            Value::from_sheet_json(&json!(["a", "b"])),
            Value::StringList(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_from_sheet_json_stringifies_objects_deterministically() {
        // Same object content, different key order in the source text
        let a = Value::from_sheet_json(&json!({"name": "x", "id": 1}));
        let b = Value::from_sheet_json(&json!({"id": 1, "name": "x"}));
        assert_eq!(a, b);
        match a {
            Value::String(s) => assert_eq!(s, r#"{"id":1,"name":"x"}"#),
            other => panic!("expected stringified object, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_array_stringified() {
        let v = Value::from_sheet_json(&json!(["a", 1]));
        assert!(matches!(v, Value::String(_)));
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::SheetToDb.opposite(), Direction::DbToSheet);
        assert_eq!(Direction::DbToSheet.opposite(), Direction::SheetToDb);
        assert_eq!(Direction::SheetToDb.as_str(), "sheet_to_db");
    }

    #[test]
    fn test_action_from_queue_str() {
        assert_eq!(
            ChangeAction::from_queue_str("INSERT"),
            Some(ChangeAction::Create)
        );
        assert_eq!(
            ChangeAction::from_queue_str("DELETE"),
            Some(ChangeAction::Delete)
        );
        assert_eq!(ChangeAction::from_queue_str("TRUNCATE"), None);
    }

    #[test]
    fn test_fingerprint_hex() {
        let fp = Fingerprint::from_digest(&[0x00, 0xff, 0x10]);
        assert_eq!(fp.as_str(), "00ff10");
    }

    #[test]
    fn test_key_repr() {
        assert_eq!(Value::Integer(7).key_repr(), "7");
        assert_eq!(Value::String("k1".into()).key_repr(), "k1");
        assert_eq!(Value::Bool(true).key_repr(), "1");
    }
}
