//! Predict command implementation.

use super::report_failure;
use anyhow::Context;
use concord_orchestrator::{Coordinator, CoordinatorConfig};
use serde_json::{Map, Value};
use std::io::Read;

/// Request options given as flags.
#[derive(Debug, Default)]
pub struct PredictOptions {
    pub context: Option<String>,
    pub weights: Vec<String>,
    pub skip_secondary: bool,
    pub deadline_ms: Option<u64>,
}

impl PredictOptions {
    fn is_empty(&self) -> bool {
        self.context.is_none() && self.weights.is_empty() && !self.skip_secondary && self.deadline_ms.is_none()
    }
}

/// Execute the predict command.
///
/// Prints the composed response as JSON.
pub async fn execute(
    config: CoordinatorConfig,
    input: Option<String>,
    options: PredictOptions,
) -> anyhow::Result<()> {
    let text = read_input(input)?;
    let request = build_request(parse_input(&text), &options)?;

    let coordinator = Coordinator::from_config(config).map_err(report_failure)?;
    let response = coordinator.predict(request).await.map_err(report_failure)?;

    println!("{}", serde_json::to_string_pretty(response.as_ref())?);
    Ok(())
}

fn read_input(input: Option<String>) -> anyhow::Result<String> {
    match input {
        Some(text) if text != "-" => Ok(text),
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).context("failed to read input from stdin")?;
            Ok(text)
        }
    }
}

/// JSON input as-is; anything else is free text.
fn parse_input(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.trim().to_string()))
}

/// Folds flag options into the request envelope.
///
/// Flags win over the same fields given in the input envelope.
fn build_request(input: Value, options: &PredictOptions) -> anyhow::Result<Value> {
    if options.is_empty() {
        return Ok(input);
    }

    let mut envelope = match input {
        Value::Object(object) if object.contains_key("payload") => object,
        payload => {
            let mut envelope = Map::new();
            envelope.insert("payload".to_string(), payload);
            envelope
        }
    };

    if let Some(context) = &options.context {
        let context: Value = serde_json::from_str(context).context("--context must be valid JSON")?;
        envelope.insert("context".to_string(), context);
    }
    if !options.weights.is_empty() {
        let mut weights = Map::new();
        for weight in &options.weights {
            let (id, weight) = parse_weight(weight)?;
            weights.insert(id, Value::from(weight));
        }
        envelope.insert("backend_weights".to_string(), Value::Object(weights));
    }
    if options.skip_secondary {
        envelope.insert("skip_secondary".to_string(), Value::Bool(true));
    }
    if let Some(deadline_ms) = options.deadline_ms {
        envelope.insert("deadline_ms".to_string(), Value::from(deadline_ms));
    }
    Ok(Value::Object(envelope))
}

fn parse_weight(arg: &str) -> anyhow::Result<(String, f64)> {
    let (id, weight) = arg
        .split_once('=')
        .with_context(|| format!("invalid weight '{arg}', expected ID=WEIGHT"))?;
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("invalid weight '{arg}': backend id is empty");
    }
    let weight: f64 =
        weight.trim().parse().with_context(|| format!("invalid weight '{arg}': not a number"))?;
    Ok((id.to_string(), weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input(r#"{"q": 1}"#), json!({"q": 1}));
        assert_eq!(parse_input("will it rain\n"), json!("will it rain"));
    }

    #[test]
    fn test_build_request_without_flags_keeps_input() {
        let input = json!({"q": 1});
        assert_eq!(build_request(input.clone(), &PredictOptions::default()).unwrap(), input);
    }

    #[test]
    fn test_build_request_wraps_payload() {
        let options = PredictOptions {
            context: Some(r#"{"region": "eu"}"#.to_string()),
            weights: vec!["a=0.7".to_string(), "b = 0.3".to_string()],
            skip_secondary: true,
            deadline_ms: Some(500),
        };
        let request = build_request(json!({"q": 1}), &options).unwrap();

        assert_eq!(
            request,
            json!({
                "payload": {"q": 1},
                "context": {"region": "eu"},
                "backend_weights": {"a": 0.7, "b": 0.3},
                "skip_secondary": true,
                "deadline_ms": 500
            })
        );
    }

    #[test]
    fn test_build_request_extends_envelope() {
        let options = PredictOptions { deadline_ms: Some(100), ..PredictOptions::default() };
        let request =
            build_request(json!({"payload": {"q": 1}, "deadline_ms": 9000}), &options).unwrap();
        assert_eq!(request, json!({"payload": {"q": 1}, "deadline_ms": 100}));
    }

    #[test]
    fn test_parse_weight_errors() {
        assert_eq!(parse_weight("a=0.5").unwrap(), ("a".to_string(), 0.5));
        assert!(parse_weight("a").is_err());
        assert!(parse_weight("=0.5").is_err());
        assert!(parse_weight("a=high").is_err());
    }

    #[test]
    fn test_invalid_context_is_rejected() {
        let options = PredictOptions { context: Some("{not json".to_string()), ..PredictOptions::default() };
        assert!(build_request(json!({}), &options).is_err());
    }
}
