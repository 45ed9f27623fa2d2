//! HTTP client for the hosted backend.
//!
//! Implements [`RemoteStore`] over JSON endpoints. Every write sends the
//! mutation's op id in the `Idempotency-Key` header so the backend can
//! collapse replays.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RemoteError, RemoteResult};
use crate::remote::{Filter, NaturalKey, Precondition, RemoteStore, UpdateOutcome, UpsertAck};

const API_KEY_HEADER: &str = "X-POS-API-Key";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout;
    }
    if err.is_connect() {
        return RemoteError::Unavailable(format!("cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return RemoteError::Rejected(format!("invalid backend URL: {url}"));
    }
    RemoteError::Unavailable(format!("network error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "terminal not authorized".to_string(),
        404 => "backend endpoint not found".to_string(),
        409 | 412 => "record changed remotely".to_string(),
        429 => "rate limited by backend".to_string(),
        s if s >= 500 => "backend server error".to_string(),
        _ => "unexpected response from backend".to_string(),
    }
}

/// Build the error message from a failed response body, keeping validation
/// details the backend sends.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(body) = serde_json::from_str::<Value>(trimmed) {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status_message(status));
        return match body.get("details").or_else(|| body.get("errors")) {
            Some(details) => format!("{message} (HTTP {}): {details}", status.as_u16()),
            None => format!("{message} (HTTP {})", status.as_u16()),
        };
    }
    if trimmed.is_empty() {
        format!("{} (HTTP {})", status_message(status), status.as_u16())
    } else {
        format!(
            "{} (HTTP {}): {trimmed}",
            status_message(status),
            status.as_u16()
        )
    }
}

/// Classify a non-success status.
pub fn status_error(status: StatusCode, body_text: &str) -> RemoteError {
    let detail = error_detail(status, body_text);
    match status.as_u16() {
        409 | 412 => RemoteError::Conflict(detail),
        408 => RemoteError::Timeout,
        429 => RemoteError::Transient(detail),
        s if s >= 500 => RemoteError::Transient(detail),
        _ => RemoteError::Rejected(detail),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Rejected(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
        })
    }

    pub fn from_config(config: &Config) -> RemoteResult<Self> {
        match (&config.remote_url, &config.api_key) {
            (Some(url), Some(key)) => Self::new(url, key, config.remote_timeout()),
            _ => Err(RemoteError::Rejected(
                "remote store is not configured".to_string(),
            )),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        op_id: Option<&str>,
    ) -> RemoteResult<(StatusCode, String)> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method, &url)
            .header(API_KEY_HEADER, &self.api_key);
        if let Some(op_id) = op_id {
            req = req.header(IDEMPOTENCY_HEADER, op_id);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        debug!(path, status = status.as_u16(), "backend response");
        Ok((status, text))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        op_id: Option<&str>,
    ) -> RemoteResult<T> {
        let (status, text) = self.send(method, path, body, op_id).await?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        decode(&text)
    }
}

fn decode<T: DeserializeOwned>(text: &str) -> RemoteResult<T> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text)
        .map_err(|e| RemoteError::Decode(format!("invalid JSON from backend: {e}")))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn atomic_increment(&self, counter_key: &str) -> RemoteResult<i64> {
        let body: Value = self
            .call(
                Method::POST,
                &format!("/api/counters/{counter_key}/increment"),
                None,
                None,
            )
            .await?;
        body.get("value")
            .and_then(Value::as_i64)
            .ok_or_else(|| RemoteError::Decode("counter response has no value".to_string()))
    }

    async fn set_counter(&self, counter_key: &str, value: i64) -> RemoteResult<()> {
        let _: Value = self
            .call(
                Method::PUT,
                &format!("/api/counters/{counter_key}"),
                Some(&json!({ "value": value })),
                None,
            )
            .await?;
        Ok(())
    }

    async fn upsert_by_natural_key(
        &self,
        table: &str,
        key: &NaturalKey,
        fields: Value,
        op_id: &str,
    ) -> RemoteResult<UpsertAck> {
        let body = json!({ "key": key, "fields": fields, "op_id": op_id });
        self.call(
            Method::POST,
            &format!("/api/tables/{table}/upsert"),
            Some(&body),
            Some(op_id),
        )
        .await
    }

    async fn conditional_update(
        &self,
        table: &str,
        id: &str,
        precondition: &Precondition,
        fields: Value,
        op_id: &str,
    ) -> RemoteResult<UpdateOutcome> {
        let body = json!({ "precondition": precondition, "fields": fields, "op_id": op_id });
        let (status, text) = self
            .send(
                Method::PATCH,
                &format!("/api/tables/{table}/{id}"),
                Some(&body),
                Some(op_id),
            )
            .await?;

        match status.as_u16() {
            200..=299 => Ok(UpdateOutcome::Applied),
            // A failed precondition is an outcome, not an error; the body
            // carries the current row when the backend includes it.
            409 | 412 => {
                let current = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("current").cloned())
                    .filter(|v| !v.is_null());
                Ok(UpdateOutcome::Conflict { current })
            }
            _ => Err(status_error(status, &text)),
        }
    }

    async fn query(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
        let body = serde_json::to_value(filter)
            .map_err(|e| RemoteError::Decode(format!("cannot encode filter: {e}")))?;
        let response: Value = self
            .call(
                Method::POST,
                &format!("/api/tables/{table}/query"),
                Some(&body),
                None,
            )
            .await?;
        match response {
            Value::Array(rows) => Ok(rows),
            Value::Object(mut map) => match map.remove("rows") {
                Some(Value::Array(rows)) => Ok(rows),
                _ => Err(RemoteError::Decode("query response has no rows".to_string())),
            },
            Value::Null => Ok(Vec::new()),
            _ => Err(RemoteError::Decode("unexpected query response".to_string())),
        }
    }

    async fn health_check(&self) -> RemoteResult<()> {
        let start = Instant::now();
        let (status, text) = self.send(Method::GET, "/api/health", None, None).await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        if status.is_success() {
            debug!(latency_ms, "backend health check passed");
            Ok(())
        } else {
            warn!(latency_ms, status = status.as_u16(), "backend health check failed");
            Err(status_error(status, &text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("shop.example/api/"), "https://shop.example");
        assert_eq!(normalize_base_url("localhost:3000/"), "http://localhost:3000");
        assert_eq!(
            normalize_base_url(" https://shop.example/tenant// "),
            "https://shop.example/tenant"
        );
    }

    #[test]
    fn test_status_classification() {
        let unauthorized = status_error(StatusCode::UNAUTHORIZED, "");
        assert!(matches!(unauthorized, RemoteError::Rejected(ref m) if m.contains("API key")));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, ""),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, ""),
            RemoteError::Conflict(_)
        ));
        assert!(matches!(
            status_error(StatusCode::PRECONDITION_FAILED, ""),
            RemoteError::Conflict(_)
        ));
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!status_error(StatusCode::FORBIDDEN, "").is_transient());
    }

    #[test]
    fn test_error_detail_keeps_backend_message() {
        let detail = error_detail(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid payload","details":{"field":"line_items"}}"#,
        );
        assert!(detail.starts_with("invalid payload (HTTP 400)"));
        assert!(detail.contains("line_items"));

        let plain = error_detail(StatusCode::SERVICE_UNAVAILABLE, "maintenance");
        assert_eq!(plain, "backend server error (HTTP 503): maintenance");
    }

    #[test]
    fn test_from_config_requires_url_and_key() {
        let config = Config::default();
        assert!(HttpRemoteStore::from_config(&config).is_err());

        let config = Config {
            remote_url: Some("shop.example".to_string()),
            api_key: Some("k-1".to_string()),
            ..Config::default()
        };
        let store = HttpRemoteStore::from_config(&config).unwrap();
        assert_eq!(store.base_url(), "https://shop.example");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let store = HttpRemoteStore::new("http://127.0.0.1:1", "k-1", Duration::from_secs(2)).unwrap();
        let err = store.health_check().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
