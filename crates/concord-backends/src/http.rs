//! HTTP backend implementation.
//!
//! Posts the canonical request as JSON and classifies every failure into a
//! `BackendError` variant.

use crate::factory::BackendConfig;
use async_trait::async_trait;
use concord_abstraction::{
    Backend, BackendError, BackendReply, Payload, PredictionRequest, checked_confidence,
};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// JSON-over-HTTP prediction backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// Backend ID.
    id: String,
    /// Base URL (e.g., "http://forecast.internal").
    endpoint: String,
    /// Prediction path appended to the endpoint.
    path: String,
    /// Health probe path appended to the endpoint.
    health_path: String,
    /// Time bound, also applied to the HTTP client.
    timeout: Duration,
    /// Static fields merged into every request body.
    params: Payload,
    /// JSON pointers tried in order to find the confidence.
    confidence_paths: Vec<String>,
    /// HTTP client for making requests.
    client: Client,
}

impl HttpBackend {
    /// Creates a new `HttpBackend` from configuration.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if the endpoint is missing or the
    /// HTTP client cannot be created.
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            BackendError::Configuration(format!("backend '{}' has no endpoint", config.id))
        })?;
        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            id: config.id.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            path: config.path.clone(),
            health_path: config.health_path.clone(),
            timeout,
            params: config.params.clone(),
            confidence_paths: config.confidence_paths.clone(),
            client,
        })
    }

    /// Builds the backend-specific request body.
    ///
    /// Static params go in first so the canonical fields always win.
    fn build_body(&self, request: &PredictionRequest) -> Payload {
        let mut body = self.params.clone();
        body.insert("fingerprint".to_string(), Value::String(request.fingerprint.clone()));
        body.insert("payload".to_string(), Value::Object(request.payload.clone()));
        body.insert("context".to_string(), Value::Object(request.context.clone()));
        body
    }

    fn classify_transport_error(&self, err: &reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if err.is_connect() {
            BackendError::Unavailable(format!("{} not reachable: {err}", self.endpoint))
        } else {
            BackendError::Unavailable(format!("network error: {err}"))
        }
    }
}

/// Finds the confidence in a backend reply.
///
/// The first pointer that resolves to a non-null value decides; a value that
/// is not a number in `[0, 1]` makes the whole reply malformed.
///
/// # Errors
/// Returns `BackendError::MalformedResponse` for a non-numeric or out-of-range confidence.
pub fn extract_confidence(body: &Value, paths: &[String]) -> Result<Option<f64>, BackendError> {
    for path in paths {
        match body.pointer(path) {
            None | Some(Value::Null) => {}
            Some(value) => {
                let number = value.as_f64().ok_or_else(|| {
                    BackendError::MalformedResponse(format!("confidence at '{path}' is not a number"))
                })?;
                return checked_confidence(number).map(Some);
            }
        }
    }
    Ok(None)
}

#[async_trait]
impl Backend for HttpBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<BackendReply, BackendError> {
        let url = format!("{}{}", self.endpoint, self.path);
        debug!(backend_id = %self.id, url = %url, fingerprint = %request.fingerprint, "Calling backend");

        let response = self
            .client
            .post(&url)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(backend_id = %self.id, status = %status, "Backend returned error status");
            return Err(BackendError::Unavailable(format!("HTTP {status}: {error_text}")));
        }

        let text = response.text().await.map_err(|e| self.classify_transport_error(&e))?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::MalformedResponse(format!("invalid JSON: {e}")))?;
        let confidence = extract_confidence(&body, &self.confidence_paths)?;

        match body {
            Value::Object(payload) => Ok(BackendReply { payload, confidence }),
            other => Err(BackendError::MalformedResponse(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.endpoint, self.health_path);
        let response =
            self.client.get(&url).send().await.map_err(|e| self.classify_transport_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!("health probe returned {}", response.status())))
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths() -> Vec<String> {
        vec!["/confidence".to_string(), "/prediction/confidence".to_string()]
    }

    #[test]
    fn test_extract_confidence_top_level() {
        let body = json!({"confidence": 0.9});
        assert_eq!(extract_confidence(&body, &paths()).unwrap(), Some(0.9));
    }

    #[test]
    fn test_extract_confidence_nested() {
        let body = json!({"prediction": {"confidence": 0.4, "label": "up"}});
        assert_eq!(extract_confidence(&body, &paths()).unwrap(), Some(0.4));
    }

    #[test]
    fn test_extract_confidence_skips_null() {
        let body = json!({"confidence": null, "prediction": {"confidence": 0.2}});
        assert_eq!(extract_confidence(&body, &paths()).unwrap(), Some(0.2));
    }

    #[test]
    fn test_extract_confidence_absent() {
        let body = json!({"label": "up"});
        assert_eq!(extract_confidence(&body, &paths()).unwrap(), None);
    }

    #[test]
    fn test_extract_confidence_rejects_out_of_range_and_text() {
        assert!(extract_confidence(&json!({"confidence": 1.7}), &paths()).is_err());
        assert!(extract_confidence(&json!({"confidence": "high"}), &paths()).is_err());
    }

    #[test]
    fn test_build_body_keeps_canonical_fields() {
        let mut config = BackendConfig::http("a", "http://a.local/");
        config.params.insert("payload".to_string(), json!("shadowed"));
        config.params.insert("priority".to_string(), json!(0.7));
        let backend = HttpBackend::from_config(&config).unwrap();
        assert_eq!(backend.endpoint, "http://a.local");

        let mut payload = Payload::new();
        payload.insert("q".to_string(), json!("x"));
        let request = PredictionRequest {
            fingerprint: "fp".to_string(),
            payload,
            context: Payload::new(),
            backend_weights: std::collections::BTreeMap::new(),
            deadline: Duration::from_secs(1),
            skip_secondary: false,
        };

        let body = backend.build_body(&request);
        assert_eq!(body["payload"], json!({"q": "x"}));
        assert_eq!(body["priority"], json!(0.7));
        assert_eq!(body["fingerprint"], json!("fp"));
    }
}
