//! HTTP implementation of the sheet client
//!
//! A thin JSON REST transport: bearer token auth, 15 s request timeout, and
//! status-code classification into the engine error taxonomy. The engine
//! never sees raw HTTP errors.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sheet::client::{SheetClient, SheetPage, SheetRecord};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ListResponse {
    records: Vec<SheetRecord>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    records: Vec<SheetRecord>,
}

pub struct HttpSheetClient {
    base: Url,
    token: String,
    client: Client,
}

impl HttpSheetClient {
    pub fn new(base_url: &str, token: &str) -> Result<HttpSheetClient> {
        let base = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("invalid sheet base_url: {}", e)))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(SyncError::from)?;
        Ok(HttpSheetClient {
            base,
            token: token.to_string(),
            client,
        })
    }

    /// `{base}/databases/{db}/tables/{table}/records[/{suffix}...]`
    fn records_url(&self, db: &str, table: &str, suffix: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                SyncError::Config("sheet base_url cannot be a base".to_string())
            })?;
            segments.extend(["databases", db, "tables", table, "records"]);
            segments.extend(suffix);
        }
        Ok(url)
    }

    /// Turn a non-success response into the matching taxonomy error
    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SyncError::RateLimited { retry_after });
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("sheet returned {}: {}", status, body);
        match status {
            StatusCode::NOT_FOUND => Err(SyncError::NotFound(message)),
            s if s.is_server_error() => Err(SyncError::Sheet { message, transient: true }),
            _ => Err(SyncError::Sheet { message, transient: false }),
        }
    }
}

#[async_trait]
impl SheetClient for HttpSheetClient {
    async fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> Result<SheetPage> {
        let mut url = self.records_url(db, table, &[])?;
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body: ListResponse = self.check(response).await?.json().await?;
        Ok(SheetPage {
            records: body.records,
            next_cursor: body.cursor,
        })
    }

    async fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<String> {
        let url = self.records_url(db, table, &[])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        let body: CreateResponse = self.check(response).await?.json().await?;
        Ok(body.id)
    }

    async fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Result<()> {
        let url = self.records_url(db, table, &[external_id])?;
        let response = self
            .client
            .patch(url)
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_record(&self, db: &str, table: &str, external_id: &str) -> Result<()> {
        let url = self.records_url(db, table, &[external_id])?;
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn query(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Vec<SheetRecord>> {
        let url = self.records_url(db, table, &["query"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "filter": { "field": field, "value": value } }))
            .send()
            .await?;
        let body: QueryResponse = self.check(response).await?.json().await?;
        Ok(body.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_url_shape() {
        let client = HttpSheetClient::new("https://sheet.example.com/api/v1", "t").unwrap();
        let url = client.records_url("MyDB", "users", &[]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheet.example.com/api/v1/databases/MyDB/tables/users/records"
        );
        let url = client.records_url("MyDB", "users", &["rec1"]).unwrap();
        assert!(url.as_str().ends_with("/records/rec1"));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(HttpSheetClient::new("not a url", "t").is_err());
    }
}
