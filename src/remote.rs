//! Remote backend client.
//!
//! `RemoteApi` is the seam between the sync core and the backend: the
//! gateway and sync manager only ever talk to this trait, so drains are
//! testable against an in-process fake. `HttpRemoteApi` is the production
//! implementation over reqwest.
//!
//! The backend must be idempotent on `clientId`: resubmitting the same
//! record returns the original result instead of creating a duplicate. A
//! duplicate response is reported as success with `duplicate = true`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::RecordKind;

/// Server acknowledgment for one submitted record.
#[derive(Debug, Clone, Default)]
pub struct SubmitAck {
    /// The server had already applied this `clientId`; the resubmission
    /// was collapsed. Counts as success.
    pub duplicate: bool,
    /// Server-assigned id, when the backend reports one.
    pub server_id: Option<String>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Submit one record. The payload is sent verbatim with `clientId`
    /// injected so the server can deduplicate.
    async fn submit(&self, kind: RecordKind, client_id: &str, payload: &Value)
        -> Result<SubmitAck>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::NetworkUnreachable(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self, kind: RecordKind) -> String {
        match kind {
            RecordKind::Order => format!("{}/orders", self.base_url),
            RecordKind::CashTransaction => format!("{}/cash-transactions", self.base_url),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn submit(
        &self,
        kind: RecordKind,
        client_id: &str,
        payload: &Value,
    ) -> Result<SubmitAck> {
        let url = self.endpoint(kind);
        let body = with_client_id(payload, client_id);

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            req = req.header("X-POS-API-Key", key);
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::NetworkUnreachable(friendly_error(&url, &e)))?;
        let status = resp.status();

        // 409 means the server already applied this clientId — the prior
        // attempt succeeded but its acknowledgment was lost. Success.
        if status == StatusCode::CONFLICT {
            info!(kind = kind.as_str(), client_id = %client_id, "Server reported duplicate");
            return Ok(SubmitAck {
                duplicate: true,
                server_id: None,
            });
        }

        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SyncError::RemoteRejected {
                status: status.as_u16(),
                message: rejection_message(status, &body_text),
            });
        }

        let json: Value = serde_json::from_str(&body_text).unwrap_or(Value::Null);
        let duplicate = json
            .get("duplicate")
            .or_else(|| json.get("deduplicated"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let server_id = json
            .get("id")
            .or_else(|| json.get("orderId"))
            .or_else(|| json.get("transactionId"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        debug!(
            kind = kind.as_str(),
            client_id = %client_id,
            duplicate,
            "Record accepted by backend"
        );
        Ok(SubmitAck {
            duplicate,
            server_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Preserve validation details from the response body for the sync queue.
fn rejection_message(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        if let Some(details) = json.get("details").or_else(|| json.get("errors")) {
            return format!("{message}: {details}");
        }
        return message;
    }
    if !body_text.trim().is_empty() {
        return format!("{}: {}", status_error(status), body_text.trim());
    }
    status_error(status)
}

/// Inject `clientId` into the outgoing body without mutating the stored
/// payload — the queued document is replayed verbatim on every attempt.
fn with_client_id(payload: &Value, client_id: &str) -> Value {
    match payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert(
                "clientId".to_string(),
                Value::String(client_id.to_string()),
            );
            Value::Object(map)
        }
        other => serde_json::json!({
            "clientId": client_id,
            "payload": other,
        }),
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Programmable backend fake shared by gateway and sync-manager tests: a
/// script of responses consumed in order, recording every submission.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) struct FakeRemote {
        script: Mutex<Vec<Result<SubmitAck>>>,
        pub calls: Mutex<Vec<(RecordKind, String, Value)>>,
        pub call_count: AtomicUsize,
        /// Extra await inside submit, for single-flight tests.
        pub delay: Option<std::time::Duration>,
    }

    impl FakeRemote {
        pub fn new(script: Vec<Result<SubmitAck>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
                delay: None,
            }
        }

        /// Empty script: every submission succeeds.
        pub fn always_ok() -> Self {
            Self::new(Vec::new())
        }

        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn submitted_ids(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn submit(
            &self,
            kind: RecordKind,
            client_id: &str,
            payload: &Value,
        ) -> Result<SubmitAck> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((kind, client_id.to_string(), payload.clone()));
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(SubmitAck::default())
            } else {
                script.remove(0)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_with_client_id_injects_without_mutating_source() {
        let payload = json!({"totalAmount": 12.5, "items": []});
        let body = with_client_id(&payload, "c-123");
        assert_eq!(body.get("clientId").and_then(Value::as_str), Some("c-123"));
        assert_eq!(body.get("totalAmount"), payload.get("totalAmount"));
        // Source untouched
        assert!(payload.get("clientId").is_none());
    }

    #[test]
    fn test_with_client_id_wraps_non_object_payloads() {
        let payload = json!([1, 2, 3]);
        let body = with_client_id(&payload, "c-9");
        assert_eq!(body.get("clientId").and_then(Value::as_str), Some("c-9"));
        assert_eq!(body.get("payload"), Some(&payload));
    }

    #[test]
    fn test_rejection_message_prefers_body_error() {
        let msg = rejection_message(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error": "validation failed", "details": {"totalAmount": "required"}}"#,
        );
        assert!(msg.contains("validation failed"));
        assert!(msg.contains("totalAmount"));

        let plain = rejection_message(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(plain, "Backend server error (HTTP 500)");
    }

    #[test]
    fn test_endpoint_per_kind() {
        let api = HttpRemoteApi::new(&SyncConfig::new("pos.example.com", "/tmp/unused"))
            .expect("build client");
        assert_eq!(
            api.endpoint(RecordKind::Order),
            "https://pos.example.com/orders"
        );
        assert_eq!(
            api.endpoint(RecordKind::CashTransaction),
            "https://pos.example.com/cash-transactions"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_maps_to_network_unreachable() {
        let mut cfg = SyncConfig::new("http://127.0.0.1:9", "/tmp/unused");
        cfg.request_timeout = Duration::from_millis(200);
        let api = HttpRemoteApi::new(&cfg).expect("build client");

        let result = api
            .submit(RecordKind::Order, "c-1", &json!({"totalAmount": 1.0}))
            .await;
        assert!(matches!(result, Err(SyncError::NetworkUnreachable(_))));
    }
}
