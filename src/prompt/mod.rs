//! Decision prompt construction and response processing.
//!
//! Templates are rendered with a small deterministic substitution language
//! (field paths, `#each` iteration, optional blocks) rather than a full
//! templating engine, so prompt output is reproducible byte for byte.

pub mod analytics;
pub mod response;
pub mod template;

pub use analytics::{AnalyticsSnapshot, DecisionAnalytics};
pub use response::{
    parse_decision, sanitize_response, validate_response, ConfidenceThresholds, DecisionResponse,
    ValidationResult,
};
pub use template::{render, BuiltPrompt, PromptTemplate, TemplateSet};
