//! Human-in-the-loop reason validation.
//!
//! A reason rides on the issue as `ashep-hitl:<reason>` and gates further
//! autonomous dispatch. Predefined reasons always pass; custom reasons are
//! checked against the configured character set and never start with a digit.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CustomValidation {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "alphanumeric")]
    Alphanumeric,
    #[default]
    #[serde(rename = "alphanumeric-dash-underscore")]
    AlphanumericDashUnderscore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlReasonRules {
    #[serde(default = "default_predefined")]
    pub predefined: Vec<String>,

    #[serde(default = "default_true")]
    pub allow_custom: bool,

    #[serde(default)]
    pub custom_validation: CustomValidation,
}

impl Default for HitlReasonRules {
    fn default() -> Self {
        Self {
            predefined: default_predefined(),
            allow_custom: true,
            custom_validation: CustomValidation::default(),
        }
    }
}

fn default_predefined() -> Vec<String> {
    [
        "approval",
        "max-retries-exceeded",
        "loop-detected",
        "no-capable-agent",
        "assistant-block",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_true() -> bool {
    true
}

/// Check a HITL reason against the configured rule set.
pub fn validate_hitl_reason(reason: &str, rules: &HitlReasonRules) -> Result<(), String> {
    if reason.is_empty() {
        return Err("HITL reason must not be empty".to_string());
    }

    if rules.predefined.iter().any(|r| r == reason) {
        return Ok(());
    }

    if !rules.allow_custom {
        return Err(format!(
            "'{reason}' is not a predefined HITL reason and custom reasons are disabled"
        ));
    }

    match rules.custom_validation {
        CustomValidation::None => Ok(()),
        CustomValidation::Alphanumeric => {
            check_charset(reason, |c| c.is_ascii_alphanumeric(), "alphanumeric")
        }
        CustomValidation::AlphanumericDashUnderscore => check_charset(
            reason,
            |c| c.is_ascii_alphanumeric() || c == '-' || c == '_',
            "alphanumeric, dash, or underscore",
        ),
    }
}

fn check_charset(reason: &str, allowed: impl Fn(char) -> bool, description: &str) -> Result<(), String> {
    if reason.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(format!("HITL reason '{reason}' must not start with a digit"));
    }
    if let Some(bad) = reason.chars().find(|&c| !allowed(c)) {
        return Err(format!(
            "HITL reason '{reason}' contains '{bad}'; only {description} characters are allowed"
        ));
    }
    Ok(())
}
