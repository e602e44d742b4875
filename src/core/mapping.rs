//! Field and record translation between the Sheet and the DB
//!
//! A [`Mapper`] is built per pair from its configured field map. It projects
//! raw sheet records into DB-keyed [`Record`]s and back, and owns the list of
//! system columns excluded from fingerprints. Fields not mentioned in the
//! field map are ignored in both directions; a missing or non-scalar key
//! field is a mapping error.

use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::config::{FieldMapEntry, PairConfig};
use crate::core::fingerprint::{self, SYNC_SOURCE_COLUMN};
use crate::error::{Result, SyncError};
use crate::types::{Fingerprint, Record, Value};

/// Ordered sheet-field / db-column mapping with both lookup directions
#[derive(Debug, Clone)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
    sheet_to_db: HashMap<String, String>,
    db_to_sheet: HashMap<String, String>,
}

impl FieldMap {
    pub fn new(entries: &[FieldMapEntry]) -> FieldMap {
        let entries: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.sheet.clone(), e.db.clone()))
            .collect();
        let sheet_to_db = entries.iter().map(|(s, d)| (s.clone(), d.clone())).collect();
        let db_to_sheet = entries.iter().map(|(s, d)| (d.clone(), s.clone())).collect();
        FieldMap { entries, sheet_to_db, db_to_sheet }
    }

    /// DB column for a sheet field, if mapped
    pub fn db_column(&self, sheet_field: &str) -> Option<&str> {
        self.sheet_to_db.get(sheet_field).map(String::as_str)
    }

    /// Sheet field for a DB column, if mapped
    pub fn sheet_field(&self, db_column: &str) -> Option<&str> {
        self.db_to_sheet.get(db_column).map(String::as_str)
    }

    /// Mapping entries in configuration order
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

/// Per-pair record translator
#[derive(Debug, Clone)]
pub struct Mapper {
    pair_name: String,
    key_field: String,
    updated_at_column: String,
    field_map: FieldMap,
}

impl Mapper {
    pub fn from_pair(pair: &PairConfig) -> Mapper {
        Mapper {
            pair_name: pair.name(),
            key_field: pair.key_field.clone(),
            updated_at_column: pair.updated_at_column.clone(),
            field_map: FieldMap::new(&pair.field_map),
        }
    }

    pub fn pair_name(&self) -> &str {
        &self.pair_name
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Sheet-side name of the key field; config validation guarantees the
    /// mapping exists
    pub fn sheet_key_field(&self) -> Result<&str> {
        self.field_map.sheet_field(&self.key_field).ok_or_else(|| {
            SyncError::Mapping(format!("key field '{}' is not mapped", self.key_field))
        })
    }

    /// Columns excluded from canonicalization for this pair.
    ///
    /// `id` stays excluded as a surrogate unless it is the key field itself.
    pub fn system_columns(&self) -> Vec<&str> {
        let mut cols = vec![SYNC_SOURCE_COLUMN, self.updated_at_column.as_str()];
        if self.key_field != "id" {
            cols.push("id");
        }
        cols
    }

    /// Fingerprint a mapped record under this pair's exclusions
    pub fn fingerprint(&self, record: &Record) -> Fingerprint {
        fingerprint::fingerprint(record, &self.system_columns())
    }

    /// Project raw sheet fields into `(key_value, db_record)`.
    ///
    /// Unmapped sheet fields are dropped. Fails when the key field's sheet
    /// column is absent or maps to a non-scalar value.
    pub fn sheet_to_db(
        &self,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<(Value, Record)> {
        let mut record = Record::new();
        for (sheet_field, db_column) in self.field_map.entries() {
            if let Some(raw) = fields.get(sheet_field) {
                record.insert(db_column.clone(), Value::from_sheet_json(raw));
            }
        }
        let key = match record.get(&self.key_field) {
            None | Some(Value::Null) => {
                return Err(SyncError::missing_key_field(&self.key_field))
            }
            Some(v) if !v.is_scalar() => {
                return Err(SyncError::non_scalar_key(&self.key_field))
            }
            Some(v) => v.clone(),
        };
        Ok((key, record))
    }

    /// Render a DB record as the sheet field map for a write.
    ///
    /// Inverse of [`Mapper::sheet_to_db`]; timestamps are rendered in the
    /// sheet's string form by [`Value::to_sheet_json`].
    pub fn db_to_sheet(&self, record: &Record) -> serde_json::Map<String, JsonValue> {
        let mut fields = serde_json::Map::new();
        for (sheet_field, db_column) in self.field_map.entries() {
            if let Some(value) = record.get(db_column) {
                fields.insert(sheet_field.clone(), value.to_sheet_json());
            }
        }
        fields
    }

    /// Parse a queue row payload (`new_json` / `old_json`) into a mapped
    /// record.
    ///
    /// The trigger serializes the whole DB row; only mapped columns are kept,
    /// which also drops every system column.
    pub fn record_from_row_json(&self, json: &str) -> Result<Record> {
        let parsed: JsonValue = serde_json::from_str(json)?;
        let object = parsed
            .as_object()
            .ok_or_else(|| SyncError::Mapping("queue payload is not a JSON object".into()))?;
        let mut record = Record::new();
        for (_, db_column) in self.field_map.entries() {
            if let Some(raw) = object.get(db_column) {
                record.insert(db_column.clone(), Value::from_sheet_json(raw));
            }
        }
        Ok(record)
    }

    /// Extract the key value from a mapped record
    pub fn key_of(&self, record: &Record) -> Result<Value> {
        match record.get(&self.key_field) {
            None | Some(Value::Null) => Err(SyncError::missing_key_field(&self.key_field)),
            Some(v) if !v.is_scalar() => Err(SyncError::non_scalar_key(&self.key_field)),
            Some(v) => Ok(v.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use serde_json::json;

    fn mapper() -> Mapper {
        Mapper::from_pair(&SyncConfig::skeleton().pairs[0])
    }

    fn sheet_fields(raw: JsonValue) -> serde_json::Map<String, JsonValue> {
        raw.as_object().unwrap().clone()
    }

    #[test]
    fn test_sheet_to_db_projection() {
        let m = mapper();
        let fields = sheet_fields(json!({
            "Employee ID": "k1",
            "Name": "alice",
            "Age": 30,
            "Unmapped": "dropped"
        }));
        let (key, record) = m.sheet_to_db(&fields).unwrap();
        assert_eq!(key, Value::String("k1".into()));
        assert_eq!(record.get("name"), Some(&Value::String("alice".into())));
        assert_eq!(record.get("age"), Some(&Value::Integer(30)));
        assert!(!record.contains_key("Unmapped"));
        assert!(!record.contains_key("unmapped"));
    }

    #[test]
    fn test_missing_key_field_is_mapping_error() {
        let m = mapper();
        let fields = sheet_fields(json!({"Name": "alice"}));
        let err = m.sheet_to_db(&fields).unwrap_err();
        assert!(err.to_string().contains("employee_id"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_non_scalar_key_rejected() {
        let m = mapper();
        let fields = sheet_fields(json!({
            "Employee ID": ["not", "scalar"],
            "Name": "alice"
        }));
        assert!(m.sheet_to_db(&fields).is_err());
    }

    #[test]
    fn test_db_to_sheet_inverse() {
        let m = mapper();
        let mut record = Record::new();
        record.insert("employee_id".into(), Value::String("k1".into()));
        record.insert("age".into(), Value::Integer(31));
        let fields = m.db_to_sheet(&record);
        assert_eq!(fields.get("Employee ID"), Some(&json!("k1")));
        assert_eq!(fields.get("Age"), Some(&json!(31)));
        assert!(fields.get("Name").is_none());
    }

    #[test]
    fn test_record_from_row_json_drops_system_columns() {
        let m = mapper();
        let record = m
            .record_from_row_json(
                r#"{"id": 9, "employee_id": "k1", "age": 30, "_sync_source": "sheet", "updated_at": "2024-01-01 00:00:00"}"#,
            )
            .unwrap();
        assert!(!record.contains_key("id"));
        assert!(!record.contains_key("_sync_source"));
        assert!(!record.contains_key("updated_at"));
        assert_eq!(record.get("age"), Some(&Value::Integer(30)));
    }

    #[test]
    fn test_roundtrip_preserves_fingerprint() {
        let m = mapper();
        let fields = sheet_fields(json!({
            "Employee ID": "k1",
            "Name": "alice",
            "Age": 30
        }));
        let (_, record) = m.sheet_to_db(&fields).unwrap();
        let fp1 = m.fingerprint(&record);

        // Through the sheet rendering and back
        let rendered = m.db_to_sheet(&record);
        let (_, back) = m.sheet_to_db(&rendered).unwrap();
        assert_eq!(fp1, m.fingerprint(&back));
    }
}
