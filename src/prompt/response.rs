//! Agent decision response sanitizing and validation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Confidence cut-offs applied to validated decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    /// Below this, the decision carries a low-confidence warning.
    pub require_approval: f64,
    /// Below this, the action is demoted to requiring approval.
    pub auto_advance: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            require_approval: 0.5,
            auto_advance: 0.8,
        }
    }
}

/// A decision that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    /// The raw decision string, e.g. `jump_to_implement`.
    pub decision: String,
    /// Action stem, e.g. `jump` or `advance`.
    pub action: String,
    /// Destination parsed from `..._to_<target>`.
    pub target: Option<String>,
    pub reasoning: String,
    pub confidence: f64,

    #[serde(default)]
    pub recommendations: Vec<String>,

    /// Set when low confidence demoted the action.
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub response: Option<DecisionResponse>,
}

/// Strip markdown fences, surrounding whitespace, escaped quotes, and
/// control characters from a raw agent reply.
pub fn sanitize_response(raw: &str) -> String {
    let mut text = raw.trim();

    if let Some(stripped) = text.strip_prefix("```") {
        // Drop the info string (e.g. ```json) up to the first newline.
        let body = match stripped.find('\n') {
            Some(idx) => &stripped[idx + 1..],
            None => stripped,
        };
        text = body.strip_suffix("```").unwrap_or(body);
        text = text.trim();
    }

    let unescaped = text.replace("\\\"", "\"");
    unescaped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

fn decision_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<action>[a-z]+(?:_[a-z]+)*?)(?:_to_(?P<target>[A-Za-z0-9][A-Za-z0-9_-]*))?$")
            .expect("decision pattern compiles")
    })
}

/// Parse `<action>[_to_<target>]`.
pub fn parse_decision(decision: &str) -> Option<(String, Option<String>)> {
    let captures = decision_pattern().captures(decision)?;
    let action = captures.name("action")?.as_str().to_string();
    let target = captures.name("target").map(|m| m.as_str().to_string());
    Some((action, target))
}

/// Validate a raw agent reply against the decision contract.
///
/// `allowed_destinations` bounds where `jump_*` and `advance_to_*` may go;
/// empty means any destination passes.
pub fn validate_response(
    raw: &str,
    allowed_destinations: &[String],
    thresholds: Option<ConfidenceThresholds>,
) -> ValidationResult {
    let mut result = ValidationResult::default();
    let sanitized = sanitize_response(raw);

    if sanitized.is_empty() {
        result.errors.push("response is empty".to_string());
        return result;
    }

    let json: Value = match serde_json::from_str(&sanitized) {
        Ok(json) => json,
        Err(e) => {
            result.errors.push(format!("response is not valid JSON: {e}"));
            return result;
        }
    };

    let decision = match json.get("decision").and_then(Value::as_str) {
        Some(decision) if !decision.is_empty() => decision.to_string(),
        _ => {
            result
                .errors
                .push("missing or empty 'decision' field".to_string());
            return result;
        }
    };

    let Some((action, target)) = parse_decision(&decision) else {
        result
            .errors
            .push(format!("decision '{decision}' does not match <action>[_to_<target>]"));
        return result;
    };

    let reasoning = json
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if reasoning.is_empty() {
        result
            .errors
            .push("missing or empty 'reasoning' field".to_string());
    }

    let confidence = match json.get("confidence").and_then(Value::as_f64) {
        Some(confidence) if (0.0..=1.0).contains(&confidence) => confidence,
        Some(confidence) => {
            result
                .errors
                .push(format!("confidence {confidence} outside 0..=1"));
            0.0
        }
        None => {
            result.errors.push("missing 'confidence' field".to_string());
            0.0
        }
    };

    let recommendations = match json.get("recommendations") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(_) => {
            result
                .errors
                .push("'recommendations' must be an array".to_string());
            Vec::new()
        }
    };

    // Destination-bearing actions must target somewhere we allow.
    let needs_destination = action == "jump" || (action == "advance" && target.is_some());
    if needs_destination {
        match &target {
            None => {
                result
                    .errors
                    .push(format!("action '{decision}' requires a target phase"));
            }
            Some(target) if !allowed_destinations.is_empty()
                && !allowed_destinations.iter().any(|d| d == target) =>
            {
                result.errors.push(format!(
                    "destination '{target}' is not one of the allowed destinations"
                ));
            }
            Some(_) => {}
        }
    }

    if !result.errors.is_empty() {
        return result;
    }

    let thresholds = thresholds.unwrap_or_default();
    let mut requires_approval = false;
    if confidence < thresholds.require_approval {
        result.warnings.push(format!(
            "confidence {confidence:.2} below approval threshold {:.2}",
            thresholds.require_approval
        ));
    }
    if confidence < thresholds.auto_advance {
        requires_approval = true;
        result.warnings.push(format!(
            "confidence {confidence:.2} below auto-advance threshold {:.2}; requiring approval",
            thresholds.auto_advance
        ));
    }

    result.valid = true;
    result.response = Some(DecisionResponse {
        decision,
        action,
        target,
        reasoning,
        confidence,
        recommendations,
        requires_approval,
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_fences_and_controls() {
        let raw = "```json\n{\"decision\": \"advance\"}\n```";
        assert_eq!(sanitize_response(raw), "{\"decision\": \"advance\"}");

        let raw = "  {\"a\": 1}\u{0007}  ";
        assert_eq!(sanitize_response(raw), "{\"a\": 1}");
    }

    #[test]
    fn parses_decision_grammar() {
        assert_eq!(
            parse_decision("advance"),
            Some(("advance".to_string(), None))
        );
        assert_eq!(
            parse_decision("jump_to_implement"),
            Some(("jump".to_string(), Some("implement".to_string())))
        );
        assert_eq!(
            parse_decision("advance_to_code-review"),
            Some(("advance".to_string(), Some("code-review".to_string())))
        );
        assert_eq!(parse_decision("Not Valid"), None);
    }

    fn destinations() -> Vec<String> {
        vec!["implement".to_string(), "test".to_string()]
    }

    #[test]
    fn accepts_well_formed_response() {
        let raw = r#"{"decision": "jump_to_implement", "reasoning": "tests regressed",
                      "confidence": 0.9, "recommendations": ["rerun suite"]}"#;
        let result = validate_response(raw, &destinations(), None);
        assert!(result.valid, "errors: {:?}", result.errors);
        let response = result.response.unwrap();
        assert_eq!(response.action, "jump");
        assert_eq!(response.target.as_deref(), Some("implement"));
        assert!(!response.requires_approval);
        assert_eq!(response.recommendations, vec!["rerun suite"]);
    }

    #[test]
    fn rejects_disallowed_destination() {
        let raw = r#"{"decision": "jump_to_deploy", "reasoning": "x", "confidence": 0.9}"#;
        let result = validate_response(raw, &destinations(), None);
        assert!(!result.valid);
        assert!(result.errors[0].contains("deploy"));
    }

    #[test]
    fn rejects_missing_fields() {
        let result = validate_response(r#"{"decision": "advance"}"#, &[], None);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("reasoning")));
        assert!(result.errors.iter().any(|e| e.contains("confidence")));
    }

    #[test]
    fn empty_and_garbage_responses_fail() {
        assert!(!validate_response("", &[], None).valid);
        assert!(!validate_response("   \n  ", &[], None).valid);
        assert!(!validate_response("not json at all", &[], None).valid);
    }

    #[test]
    fn low_confidence_demotes_to_approval() {
        let raw = r#"{"decision": "advance", "reasoning": "probably fine", "confidence": 0.6}"#;
        let result = validate_response(raw, &[], None);
        assert!(result.valid);
        let response = result.response.unwrap();
        assert!(response.requires_approval);
        assert_eq!(result.warnings.len(), 1);

        // Below both thresholds: warning for each.
        let raw = r#"{"decision": "advance", "reasoning": "guessing", "confidence": 0.3}"#;
        let result = validate_response(raw, &[], None);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.response.unwrap().requires_approval);
    }

    #[test]
    fn high_confidence_passes_clean() {
        let raw = r#"{"decision": "advance", "reasoning": "all green", "confidence": 0.95}"#;
        let result = validate_response(raw, &[], None);
        assert!(result.valid);
        assert!(result.warnings.is_empty());
        assert!(!result.response.unwrap().requires_approval);
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let raw = r#"{"decision": "advance", "reasoning": "x", "confidence": 1.5}"#;
        assert!(!validate_response(raw, &[], None).valid);
    }
}
