//! HTTP secondary analyzer.
//!
//! Sends the aggregated partial results to one reasoning endpoint and turns
//! whatever comes back into a JSON object.

use crate::factory::AnalyzerConfig;
use async_trait::async_trait;
use concord_abstraction::{AnalysisInput, Analyzer, BackendError, Payload};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Secondary analyzer reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    id: String,
    endpoint: String,
    timeout: Duration,
    client: Client,
}

impl HttpAnalyzer {
    /// Creates a new `HttpAnalyzer` from configuration.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if the endpoint is missing or the
    /// HTTP client cannot be created.
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, BackendError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            BackendError::Configuration("secondary analyzer has no endpoint".to_string())
        })?;
        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { id: config.id.clone(), endpoint, timeout, client })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, input: &AnalysisInput<'_>) -> Result<Payload, BackendError> {
        debug!(
            analyzer_id = %self.id,
            fingerprint = %input.request.fingerprint,
            result_count = input.results.len(),
            "Requesting secondary analysis"
        );

        let response = self.client.post(&self.endpoint).json(input).send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Unavailable(format!("network error: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(analyzer_id = %self.id, status = %status, "Analyzer returned error status");
            return Err(BackendError::Unavailable(format!("HTTP {status}: {error_text}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to read analysis: {e}")))?;
        Ok(parse_analysis(&text))
    }
}

/// Turns an analyzer response body into a JSON object.
///
/// A JSON object is used as-is unless it only wraps generated text in a
/// `text` or `content` field, in which case the text is parsed instead. Text
/// containing a fenced ```json block yields that block; anything else is
/// kept verbatim under `analysis_text`.
pub fn parse_analysis(text: &str) -> Payload {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => match wrapped_text(&object) {
            Some(inner) => parse_text_analysis(inner),
            None => object,
        },
        Ok(Value::String(inner)) => parse_text_analysis(&inner),
        _ => parse_text_analysis(text),
    }
}

fn wrapped_text(object: &Payload) -> Option<&str> {
    if object.len() != 1 {
        return None;
    }
    object.get("text").or_else(|| object.get("content")).and_then(Value::as_str)
}

fn parse_text_analysis(text: &str) -> Payload {
    if let Some(block) = fenced_json(text) {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(block) {
            return object;
        }
    }
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text.trim()) {
        return object;
    }

    let mut payload = Payload::new();
    payload.insert("analysis_text".to_string(), Value::String(text.to_string()));
    payload
}

fn fenced_json(text: &str) -> Option<&str> {
    const FENCE: &str = "```json";
    let start = text.find(FENCE)? + FENCE.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}
