use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::errors::{AgentError, AgentResult};

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("valid fenced block pattern");
}

/// Parse a JSON object out of free-form model output
///
/// Models wrap their JSON in prose or markdown fences; this tries, in order, the raw text,
/// every fenced block, and the outermost `{ ... }` span.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> AgentResult<T> {
    let trimmed = text.trim();
    let mut first_error = match serde_json::from_str(trimmed) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err.to_string(),
    };

    for captures in FENCED_BLOCK.captures_iter(trimmed) {
        if let Some(block) = captures.get(1) {
            match serde_json::from_str(block.as_str().trim()) {
                Ok(parsed) => return Ok(parsed),
                Err(err) => first_error = err.to_string(),
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            match serde_json::from_str(&trimmed[start..=end]) {
                Ok(parsed) => return Ok(parsed),
                Err(err) => first_error = err.to_string(),
            }
        }
    }

    Err(AgentError::Parse(format!(
        "no JSON object found in model output: {}",
        first_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_plain_json() {
        let value: Value = parse_json(r#" {"rate": 7} "#).unwrap();
        assert_eq!(value, json!({"rate": 7}));
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here is my answer:\n```json\n{\"thought\": \"ok\", \"rate\": \"8\"}\n```\nThanks";
        let value: Value = parse_json(text).unwrap();
        assert_eq!(value["rate"], "8");
    }

    #[test]
    fn test_embedded_json() {
        let text = "Sure! {\"command\": {\"name\": \"search\"}} hope that helps";
        let value: Value = parse_json(text).unwrap();
        assert_eq!(value["command"]["name"], "search");
    }

    #[test]
    fn test_no_json() {
        let result: AgentResult<Value> = parse_json("I refuse to answer in JSON");
        assert!(matches!(result, Err(AgentError::Parse(_))));
    }
}
