//! Request normalization and fingerprinting.
//!
//! Turns whatever the caller sent into a canonical `PredictionRequest`. This
//! never fails: input that does not look like an envelope is wrapped instead.

use concord_abstraction::{Payload, PredictionRequest};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Builds canonical requests with a configured default deadline.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    default_deadline: Duration,
}

impl Normalizer {
    /// Creates a normalizer that falls back to `default_deadline`.
    #[must_use]
    pub fn new(default_deadline: Duration) -> Self {
        Self { default_deadline }
    }

    /// Normalizes raw input into a canonical request.
    ///
    /// - An object with a `payload` key is an envelope
    ///   `{ payload, context?, backend_weights?, skip_secondary?, deadline_ms? }`.
    /// - Any other object is the payload itself.
    /// - A string holding a JSON object is parsed and normalized again;
    ///   other strings become `{ "raw": <string> }`.
    /// - Numbers, booleans, arrays and null become `{ "raw": <json text> }`.
    pub fn normalize(&self, raw: Value) -> PredictionRequest {
        match raw {
            Value::Object(mut envelope) if envelope.contains_key("payload") => {
                let payload = into_object(envelope.remove("payload").unwrap_or(Value::Null));
                let context = match envelope.remove("context") {
                    None | Some(Value::Null) => Payload::new(),
                    Some(context) => into_object(context),
                };
                let backend_weights =
                    envelope.get("backend_weights").map(parse_weights).unwrap_or_default();
                let skip_secondary =
                    envelope.get("skip_secondary").and_then(Value::as_bool).unwrap_or(false);
                let deadline = envelope
                    .get("deadline_ms")
                    .and_then(parse_deadline)
                    .unwrap_or(self.default_deadline);

                self.build(payload, context, backend_weights, deadline, skip_secondary)
            }
            Value::Object(payload) => {
                self.build(payload, Payload::new(), BTreeMap::new(), self.default_deadline, false)
            }
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed @ Value::Object(_)) => self.normalize(parsed),
                _ => self.build(
                    raw_object(text),
                    Payload::new(),
                    BTreeMap::new(),
                    self.default_deadline,
                    false,
                ),
            },
            other => self.build(
                raw_object(other.to_string()),
                Payload::new(),
                BTreeMap::new(),
                self.default_deadline,
                false,
            ),
        }
    }

    fn build(
        &self,
        payload: Payload,
        context: Payload,
        backend_weights: BTreeMap<String, f64>,
        deadline: Duration,
        skip_secondary: bool,
    ) -> PredictionRequest {
        PredictionRequest {
            fingerprint: fingerprint(&payload, &context),
            payload,
            context,
            backend_weights,
            deadline,
            skip_secondary,
        }
    }
}

/// Normalizes with a 30 second default deadline.
pub fn normalize(raw: Value) -> PredictionRequest {
    Normalizer::new(Duration::from_secs(30)).normalize(raw)
}

/// Deterministic fingerprint of a payload and context.
///
/// SHA-256 over the canonical serialization of `{"context": .., "payload": ..}`
/// with object keys sorted at every level, as lowercase hex.
pub fn fingerprint(payload: &Payload, context: &Payload) -> String {
    let mut canonical = String::new();
    canonical.push_str("{\"context\":");
    write_object(context, &mut canonical);
    canonical.push_str(",\"payload\":");
    write_object(payload, &mut canonical);
    canonical.push('}');

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) => write_object(object, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(object: &Payload, out: &mut String) {
    let mut keys: Vec<&String> = object.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&object[key], out);
    }
    out.push('}');
}

fn into_object(value: Value) -> Payload {
    match value {
        Value::Object(object) => object,
        Value::String(text) => raw_object(text),
        other => raw_object(other.to_string()),
    }
}

fn raw_object(text: String) -> Payload {
    let mut object = Payload::new();
    object.insert("raw".to_string(), Value::String(text));
    object
}

fn parse_weights(value: &Value) -> BTreeMap<String, f64> {
    let Some(object) = value.as_object() else {
        return BTreeMap::new();
    };
    object
        .iter()
        .filter_map(|(id, weight)| {
            let weight = weight.as_f64().filter(|w| w.is_finite())?;
            Some((id.clone(), weight.clamp(0.0, 1.0)))
        })
        .collect()
}

fn parse_deadline(value: &Value) -> Option<Duration> {
    if let Some(ms) = value.as_u64() {
        return (ms > 0).then(|| Duration::from_millis(ms));
    }
    value
        .as_f64()
        .filter(|ms| ms.is_finite() && *ms >= 1.0)
        .map(|ms| Duration::from_millis(ms.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(Duration::from_millis(5_000))
    }

    #[test]
    fn test_envelope_fields() {
        let request = normalizer().normalize(json!({
            "payload": {"query": "demand"},
            "context": {"region": "eu"},
            "backend_weights": {"a": 0.4, "b": 2.0, "c": -1, "d": "heavy"},
            "skip_secondary": true,
            "deadline_ms": 200
        }));

        assert_eq!(request.payload["query"], json!("demand"));
        assert_eq!(request.context["region"], json!("eu"));
        assert_eq!(request.backend_weights.get("a"), Some(&0.4));
        assert_eq!(request.backend_weights.get("b"), Some(&1.0));
        assert_eq!(request.backend_weights.get("c"), Some(&0.0));
        assert!(!request.backend_weights.contains_key("d"));
        assert!(request.skip_secondary);
        assert_eq!(request.deadline, Duration::from_millis(200));
        assert_eq!(request.fingerprint.len(), 64);
    }

    #[test]
    fn test_bare_object_is_payload() {
        let request = normalizer().normalize(json!({"query": "demand"}));
        assert_eq!(request.payload["query"], json!("demand"));
        assert!(request.context.is_empty());
        assert_eq!(request.deadline, Duration::from_millis(5_000));
        assert!(!request.skip_secondary);
    }

    #[test]
    fn test_strings_and_scalars_are_wrapped() {
        let text = normalizer().normalize(json!("forecast revenue"));
        assert_eq!(text.payload["raw"], json!("forecast revenue"));

        let number = normalizer().normalize(json!(42));
        assert_eq!(number.payload["raw"], json!("42"));

        let array = normalizer().normalize(json!([1, 2]));
        assert_eq!(array.payload["raw"], json!("[1,2]"));

        let null = normalizer().normalize(Value::Null);
        assert_eq!(null.payload["raw"], json!("null"));
    }

    #[test]
    fn test_json_string_is_parsed() {
        let from_text = normalizer().normalize(json!(r#"{"payload": {"q": 1}, "deadline_ms": 10}"#));
        let from_value = normalizer().normalize(json!({"payload": {"q": 1}, "deadline_ms": 10}));
        assert_eq!(from_text, from_value);
    }

    #[test]
    fn test_non_object_envelope_parts_are_wrapped() {
        let request = normalizer().normalize(json!({"payload": "plain", "context": 7}));
        assert_eq!(request.payload["raw"], json!("plain"));
        assert_eq!(request.context["raw"], json!("7"));
    }

    #[test]
    fn test_bad_deadline_uses_default() {
        for deadline in [json!(0), json!("soon"), json!(-5), json!(null)] {
            let request = normalizer().normalize(json!({"payload": {}, "deadline_ms": deadline}));
            assert_eq!(request.deadline, Duration::from_millis(5_000));
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = normalizer().normalize(json!({
            "payload": {"b": 1, "a": {"y": [1, {"k": 2, "j": 3}], "x": null}},
            "context": {"s": "1", "r": true}
        }));
        let b = normalizer().normalize(json!({
            "context": {"r": true, "s": "1"},
            "payload": {"a": {"x": null, "y": [1, {"j": 3, "k": 2}]}, "b": 1}
        }));
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_fingerprint_ignores_options() {
        let plain = normalizer().normalize(json!({"payload": {"q": 1}}));
        let tuned = normalizer().normalize(json!({
            "payload": {"q": 1},
            "backend_weights": {"a": 1.0},
            "skip_secondary": true,
            "deadline_ms": 10
        }));
        assert_eq!(plain.fingerprint, tuned.fingerprint);
    }

    #[test]
    fn test_fingerprint_distinguishes_payload_and_context() {
        let mut payload = Payload::new();
        payload.insert("q".to_string(), json!(1));
        let empty = Payload::new();
        assert_ne!(fingerprint(&payload, &empty), fingerprint(&empty, &payload));
        assert_ne!(fingerprint(&payload, &empty), fingerprint(&empty, &empty));
    }

    #[test]
    fn test_fingerprint_is_lowercase_hex_sha256() {
        let empty = Payload::new();
        let fp = fingerprint(&empty, &empty);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(fp, fingerprint(&empty, &empty));
    }
}
