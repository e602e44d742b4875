//! Sheet client capability trait
//!
//! Everything the engine needs from the sheet vendor: paged reads, record
//! CRUD, and a single-field equality query. Implementations classify their
//! transport errors into the engine taxonomy before returning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::sheet::rate_limit::TokenBucket;

/// A raw record as the sheet returns it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetRecord {
    /// The sheet's record identifier (external id)
    pub id: String,
    /// Field name → raw JSON value
    pub fields: serde_json::Map<String, JsonValue>,
}

/// One page of a record listing
#[derive(Debug, Clone)]
pub struct SheetPage {
    pub records: Vec<SheetRecord>,
    /// Cursor for the next page; `None` on the last page
    pub next_cursor: Option<String>,
}

/// Capability set the engine consumes
#[async_trait]
pub trait SheetClient: Send + Sync {
    /// One page of records; pass the previous page's cursor to continue
    async fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> Result<SheetPage>;

    /// Create a record, returning the sheet-assigned external id
    async fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<String>;

    async fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<()>;

    async fn delete_record(&self, db: &str, table: &str, external_id: &str) -> Result<()>;

    /// Records where `field == value`; the only filter shape the engine needs
    async fn query(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Vec<SheetRecord>>;
}

#[async_trait]
impl<T: SheetClient + ?Sized> SheetClient for Arc<T> {
    async fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> Result<SheetPage> {
        (**self).list_records(db, table, cursor).await
    }

    async fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<String> {
        (**self).create_record(db, table, fields).await
    }

    async fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<()> {
        (**self).update_record(db, table, external_id, fields).await
    }

    async fn delete_record(&self, db: &str, table: &str, external_id: &str) -> Result<()> {
        (**self).delete_record(db, table, external_id).await
    }

    async fn query(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Vec<SheetRecord>> {
        (**self).query(db, table, field, value).await
    }
}

/// Read every page of a table to exhaustion.
///
/// The poller must never diff against a partial listing, so pagination is
/// driven here until the sheet stops returning a cursor.
pub async fn list_all(
    client: &dyn SheetClient,
    db: &str,
    table: &str,
) -> Result<Vec<SheetRecord>> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = client.list_records(db, table, cursor.as_deref()).await?;
        records.extend(page.records);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(records)
}

/// Decorator enforcing the shared QPS cap on every call.
///
/// A 429 from the inner client additionally puts the bucket into its
/// penalty mode, halving the effective rate for the next minute.
pub struct RateLimitedSheet<C> {
    inner: C,
    bucket: Arc<TokenBucket>,
}

impl<C: SheetClient> RateLimitedSheet<C> {
    pub fn new(inner: C, bucket: Arc<TokenBucket>) -> RateLimitedSheet<C> {
        RateLimitedSheet { inner, bucket }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(SyncError::RateLimited { retry_after }) = &result {
            self.bucket.penalize(*retry_after);
        }
        result
    }
}

#[async_trait]
impl<C: SheetClient> SheetClient for RateLimitedSheet<C> {
    async fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> Result<SheetPage> {
        self.bucket.acquire().await;
        let result = self.inner.list_records(db, table, cursor).await;
        self.observe(result)
    }

    async fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<String> {
        self.bucket.acquire().await;
        let result = self.inner.create_record(db, table, fields).await;
        self.observe(result)
    }

    async fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<()> {
        self.bucket.acquire().await;
        let result = self.inner.update_record(db, table, external_id, fields).await;
        self.observe(result)
    }

    async fn delete_record(&self, db: &str, table: &str, external_id: &str) -> Result<()> {
        self.bucket.acquire().await;
        let result = self.inner.delete_record(db, table, external_id).await;
        self.observe(result)
    }

    async fn query(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Vec<SheetRecord>> {
        self.bucket.acquire().await;
        let result = self.inner.query(db, table, field, value).await;
        self.observe(result)
    }
}
