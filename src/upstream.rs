//! Upstream query-service client.
//!
//! The upstream service is an opaque network dependency speaking the KairosDB
//! query dialect: `POST /api/v1/datapoints/query` with a JSON body, answering
//! `{"queries": [...]}` on success or `{"error": ..., "status_code": ...}` on
//! failure. Error payloads are returned as values, not raised here; the query
//! descriptor decides whether they propagate.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::Result;

/// Client interface to the upstream time-series query service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Issue one query. Returns the raw result payload; an upstream-reported
    /// error arrives as an `{"error", "status_code"}` value, and only
    /// transport failures are `Err`.
    async fn query(&self, body: &Value) -> Result<Value>;
}

/// HTTP implementation over reqwest.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.query_url(),
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn query(&self, body: &Value) -> Result<Value> {
        debug!(url = %self.url, "Proxying query upstream");
        let response = self.client.post(&self.url).json(body).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(response.json().await?)
        } else {
            // Normalize HTTP-level failures into the upstream error shape so
            // callers inspect one payload format.
            let message = response.text().await.unwrap_or_default();
            Ok(json!({
                "error": message,
                "status_code": status.as_u16(),
            }))
        }
    }
}

/// Whether an upstream payload is an error report rather than a result.
pub fn is_error_payload(payload: &Value) -> bool {
    payload.get("error").is_some()
}
