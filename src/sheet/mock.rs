//! In-memory sheet client for tests
//!
//! Serves canned records with real cursor pagination and records every write
//! it receives, so tests can drive the poller and consumer without a sheet
//! service. Can be switched into a rate-limited mode where every call
//! returns a 429-equivalent error.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sheet::client::{SheetClient, SheetPage, SheetRecord};

/// A write the mock received
#[derive(Debug, Clone, PartialEq)]
pub enum MockWrite {
    Create {
        table: String,
        fields: serde_json::Map<String, JsonValue>,
    },
    Update {
        table: String,
        external_id: String,
        fields: serde_json::Map<String, JsonValue>,
    },
    Delete {
        table: String,
        external_id: String,
    },
}

#[derive(Default)]
pub struct MockSheetClient {
    records: Mutex<Vec<SheetRecord>>,
    writes: Mutex<Vec<MockWrite>>,
    next_id: AtomicU64,
    page_size: usize,
    rate_limited: AtomicBool,
    list_calls: AtomicU64,
}

impl MockSheetClient {
    pub fn new() -> MockSheetClient {
        MockSheetClient {
            page_size: 100,
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Small pages force the pagination path in tests
    pub fn with_page_size(page_size: usize) -> MockSheetClient {
        MockSheetClient {
            page_size,
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Seed a record with an explicit external id
    pub fn seed(&self, id: &str, fields: serde_json::Map<String, JsonValue>) {
        self.records.lock().unwrap().push(SheetRecord {
            id: id.to_string(),
            fields,
        });
    }

    /// Current record set, as a listing would return it
    pub fn records(&self) -> Vec<SheetRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Every write received so far, in order
    pub fn writes(&self) -> Vec<MockWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// While set, every call fails with a rate-limit error
    pub fn set_rate_limited(&self, limited: bool) {
        self.rate_limited.store(limited, Ordering::Relaxed);
    }

    fn check_rate_limit(&self) -> Result<()> {
        if self.rate_limited.load(Ordering::Relaxed) {
            Err(SyncError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SheetClient for MockSheetClient {
    async fn list_records(
        &self,
        _db: &str,
        _table: &str,
        cursor: Option<&str>,
    ) -> Result<SheetPage> {
        self.check_rate_limit()?;
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let records = self.records.lock().unwrap();
        let start: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let end = (start + self.page_size).min(records.len());
        let page: Vec<SheetRecord> = records[start..end].to_vec();
        let next_cursor = if end < records.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(SheetPage {
            records: page,
            next_cursor,
        })
    }

    async fn create_record(
        &self,
        _db: &str,
        table: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<String> {
        self.check_rate_limit()?;
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.lock().unwrap().push(SheetRecord {
            id: id.clone(),
            fields: fields.clone(),
        });
        self.writes.lock().unwrap().push(MockWrite::Create {
            table: table.to_string(),
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn update_record(
        &self,
        _db: &str,
        table: &str,
        external_id: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<()> {
        self.check_rate_limit()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == external_id)
            .ok_or_else(|| SyncError::NotFound(format!("record {} not found", external_id)))?;
        for (field, value) in fields {
            record.fields.insert(field.clone(), value.clone());
        }
        self.writes.lock().unwrap().push(MockWrite::Update {
            table: table.to_string(),
            external_id: external_id.to_string(),
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn delete_record(&self, _db: &str, table: &str, external_id: &str) -> Result<()> {
        self.check_rate_limit()?;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.id != external_id);
        if records.len() == before {
            return Err(SyncError::NotFound(format!(
                "record {} not found",
                external_id
            )));
        }
        self.writes.lock().unwrap().push(MockWrite::Delete {
            table: table.to_string(),
            external_id: external_id.to_string(),
        });
        Ok(())
    }

    async fn query(
        &self,
        _db: &str,
        _table: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Vec<SheetRecord>> {
        self.check_rate_limit()?;
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.fields.get(field) == Some(value))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::client::list_all;
    use serde_json::json;

    fn fields(raw: JsonValue) -> serde_json::Map<String, JsonValue> {
        raw.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_pagination_to_exhaustion() {
        let mock = MockSheetClient::with_page_size(2);
        for i in 0..5 {
            mock.seed(&format!("r{}", i), fields(json!({"Name": i.to_string()})));
        }
        let all = list_all(&mock, "db", "t").await.unwrap();
        assert_eq!(all.len(), 5);
        // 3 pages of 2, 2, 1
        assert_eq!(mock.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_records_write() {
        let mock = MockSheetClient::new();
        let id = mock
            .create_record("db", "t", &fields(json!({"Name": "a"})))
            .await
            .unwrap();
        assert_eq!(id, "mock-1");
        assert_eq!(mock.writes().len(), 1);
        assert_eq!(mock.records().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let mock = MockSheetClient::new();
        let err = mock
            .update_record("db", "t", "nope", &fields(json!({"Name": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_by_field_equality() {
        let mock = MockSheetClient::new();
        mock.seed("r1", fields(json!({"Key": "k1"})));
        mock.seed("r2", fields(json!({"Key": "k2"})));
        let hits = mock.query("db", "t", "Key", &json!("k2")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "r2");
    }

    #[tokio::test]
    async fn test_rate_limited_mode() {
        let mock = MockSheetClient::new();
        mock.set_rate_limited(true);
        assert!(mock.list_records("db", "t", None).await.is_err());
        mock.set_rate_limited(false);
        assert!(mock.list_records("db", "t", None).await.is_ok());
    }
}
