//! The label protocol shared with the external tracker.
//!
//! An issue carries at most one phase label and at most one HITL label;
//! `ashep-excluded` removes it from dispatch entirely.

pub const PHASE_PREFIX: &str = "ashep-phase:";
pub const HITL_PREFIX: &str = "ashep-hitl:";
pub const EXCLUDED_LABEL: &str = "ashep-excluded";

pub fn phase_label(phase: &str) -> String {
    format!("{PHASE_PREFIX}{phase}")
}

pub fn hitl_label(reason: &str) -> String {
    format!("{HITL_PREFIX}{reason}")
}

pub fn excluded_label() -> &'static str {
    EXCLUDED_LABEL
}

pub fn is_phase_label(label: &str) -> bool {
    label.starts_with(PHASE_PREFIX)
}

pub fn is_hitl_label(label: &str) -> bool {
    label.starts_with(HITL_PREFIX)
}

/// Phase name from the first `ashep-phase:*` label, if any.
pub fn extract_phase<'a, I>(labels: I) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    labels
        .into_iter()
        .find_map(|l| l.strip_prefix(PHASE_PREFIX))
        .map(String::from)
}

/// HITL reason from the first `ashep-hitl:*` label, if any.
pub fn extract_hitl_reason<'a, I>(labels: I) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    labels
        .into_iter()
        .find_map(|l| l.strip_prefix(HITL_PREFIX))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let label = phase_label("implement");
        assert_eq!(label, "ashep-phase:implement");
        assert!(is_phase_label(&label));
        assert!(!is_hitl_label(&label));
    }

    #[test]
    fn extraction() {
        let labels = vec![
            "bug".to_string(),
            "ashep-phase:test".to_string(),
            "ashep-hitl:approval".to_string(),
        ];
        assert_eq!(extract_phase(&labels).as_deref(), Some("test"));
        assert_eq!(extract_hitl_reason(&labels).as_deref(), Some("approval"));
    }

    #[test]
    fn extraction_absent() {
        let labels = vec!["bug".to_string()];
        assert_eq!(extract_phase(&labels), None);
        assert_eq!(extract_hitl_reason(&labels), None);
    }
}
