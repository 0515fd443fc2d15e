//! Minimal template language: `{{path.to.field}}` substitution,
//! `{{#each xs}}...{{/each}}` iteration with `{{this}}`, and optional
//! `{{#field}}...{{/field}}` blocks rendered only when the field is truthy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub system_prompt: String,
    pub user_prompt_template: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Look up a dot path, treating a leading `this` as the current scope.
fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        if segment == "this" {
            continue;
        }
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Object(_) => true,
    }
}

/// Find the `{{/name}}` matching an already-consumed opener, honoring
/// nested blocks of the same name. Returns (body, rest-after-close).
fn split_block<'a>(input: &'a str, name: &str) -> Option<(&'a str, &'a str)> {
    let open = format!("{{{{#{name}}}}}");
    let open_each = format!("{{{{#each ");
    let close = format!("{{{{/{name}}}}}");

    let mut depth = 1usize;
    let mut cursor = 0usize;
    while let Some(offset) = input[cursor..].find("{{") {
        let at = cursor + offset;
        let rest = &input[at..];
        if rest.starts_with(&close) {
            depth -= 1;
            if depth == 0 {
                return Some((&input[..at], &input[at + close.len()..]));
            }
            cursor = at + close.len();
        } else if rest.starts_with(&open) || (name == "each" && rest.starts_with(&open_each)) {
            depth += 1;
            cursor = at + 2;
        } else {
            cursor = at + 2;
        }
    }
    None
}

/// Render `template` against `context`. Unknown fields render empty; an
/// unterminated block renders literally.
pub fn render(template: &str, context: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            // No closing braces; emit the remainder verbatim.
            output.push_str(&rest[start..]);
            return output;
        };
        let tag = after_open[..end].trim();
        let after_tag = &after_open[end + 2..];

        if let Some(each_path) = tag.strip_prefix("#each ") {
            let Some((body, remainder)) = split_block(after_tag, "each") else {
                output.push_str(&rest[start..]);
                return output;
            };
            if let Some(Value::Array(items)) = lookup(context, each_path.trim()) {
                for item in items {
                    let scope = scoped(context, item);
                    output.push_str(&render(body, &scope));
                }
            }
            rest = remainder;
        } else if let Some(block_name) = tag.strip_prefix('#') {
            let Some((body, remainder)) = split_block(after_tag, block_name) else {
                output.push_str(&rest[start..]);
                return output;
            };
            if lookup(context, block_name).map(is_truthy).unwrap_or(false) {
                output.push_str(&render(body, context));
            }
            rest = remainder;
        } else {
            if let Some(value) = lookup(context, tag) {
                output.push_str(&value_to_text(value));
            }
            rest = after_tag;
        }
    }

    output.push_str(rest);
    output
}

/// Iteration scope: the item is addressable as `this` (and its fields as
/// `this.x`), outer fields stay visible.
fn scoped(outer: &Value, item: &Value) -> Value {
    let mut scope = match outer {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(serde_json::Map::new()),
    };
    if let Value::Object(object) = &mut scope {
        object.insert("this".to_string(), item.clone());
        // Item fields shadow outer fields of the same name.
        if let Value::Object(fields) = item {
            for (key, value) in fields {
                object.insert(key.clone(), value.clone());
            }
        }
    }
    scope
}

/// Named templates with a guaranteed fallback.
pub struct TemplateSet {
    templates: HashMap<String, PromptTemplate>,
    fallback: PromptTemplate,
}

impl TemplateSet {
    pub fn new(templates: Vec<PromptTemplate>, fallback: PromptTemplate) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.name.clone(), t)).collect(),
            fallback,
        }
    }

    /// The built-in set: a generic phase prompt, the worker assistant
    /// review, and the dynamic decision prompt. The generic phase prompt
    /// doubles as the fallback.
    pub fn builtin() -> Self {
        let phase = PromptTemplate {
            name: "phase".to_string(),
            description: "Generic phase execution prompt".to_string(),
            system_prompt: "You are an autonomous coding agent working one phase of an issue. \
                            Work only on what the phase asks for and finish with a short summary."
                .to_string(),
            user_prompt_template: "\
Issue {{issue.id}}: {{issue.title}}

{{issue.description}}

Current phase: {{phase.name}}
{{#phase.description}}Phase goal: {{phase.description}}\n{{/phase.description}}\
Required capabilities:{{#each phase.capabilities}} {{this}}{{/each}}
{{#messages}}
Context from earlier phases:
{{#each messages}}- [{{from_phase}}] {{content}}
{{/each}}{{/messages}}"
                .to_string(),
        };

        let assistant = PromptTemplate {
            name: "worker-assistant".to_string(),
            description: "Post-run outcome review".to_string(),
            system_prompt: "You review the outcome of one agent phase run and answer with a \
                            single JSON object: {\"decision\": \"advance|retry|block\", \
                            \"reasoning\": \"...\", \"confidence\": 0.0}"
                .to_string(),
            user_prompt_template: "\
Issue {{issue.id}} phase {{phase.name}} finished with success={{outcome.success}}.
{{#outcome.message}}Agent summary: {{outcome.message}}\n{{/outcome.message}}\
{{#outcome.error}}Error: {{outcome.error.message}}\n{{/outcome.error}}\
Decide whether the issue should advance, retry, or block."
                .to_string(),
        };

        let decision = PromptTemplate {
            name: "dynamic-decision".to_string(),
            description: "Mid-workflow routing decision".to_string(),
            system_prompt: "You decide where an issue goes next. Answer with a single JSON \
                            object: {\"decision\": \"<action>\", \"reasoning\": \"...\", \
                            \"confidence\": 0.0}. Valid actions: advance_to_<phase>, \
                            jump_to_<phase>, retry, block."
                .to_string(),
            user_prompt_template: "\
Issue {{issue.id}}: {{issue.title}}
Current phase: {{phase.name}}
Allowed destinations:{{#each destinations}} {{this}}{{/each}}
{{#outcome.message}}Latest outcome: {{outcome.message}}\n{{/outcome.message}}"
                .to_string(),
        };

        let fallback = phase.clone();
        Self::new(vec![phase, assistant, decision], fallback)
    }

    /// Merge templates loaded from configuration over the built-ins.
    pub fn with_overrides(mut self, overrides: Vec<PromptTemplate>) -> Self {
        for template in overrides {
            self.templates.insert(template.name.clone(), template);
        }
        self
    }

    /// Named template, or the fallback when the name is unknown.
    pub fn get(&self, name: &str) -> &PromptTemplate {
        self.templates.get(name).unwrap_or(&self.fallback)
    }

    pub fn build_prompt(&self, name: &str, context: &Value) -> BuiltPrompt {
        let template = self.get(name);
        BuiltPrompt {
            system_prompt: render(&template.system_prompt, context),
            user_prompt: render(&template.user_prompt_template, context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_paths() {
        let context = json!({"issue": {"id": "I1", "title": "Fix the bug"}});
        assert_eq!(
            render("Issue {{issue.id}}: {{issue.title}}", &context),
            "Issue I1: Fix the bug"
        );
    }

    #[test]
    fn missing_fields_render_empty() {
        let context = json!({});
        assert_eq!(render("[{{nope.deep}}]", &context), "[]");
    }

    #[test]
    fn each_iterates_with_this() {
        let context = json!({"capabilities": ["code", "test"]});
        assert_eq!(
            render("caps:{{#each capabilities}} {{this}}{{/each}}", &context),
            "caps: code test"
        );
    }

    #[test]
    fn each_exposes_item_fields() {
        let context = json!({"messages": [
            {"from_phase": "implement", "content": "done"},
            {"from_phase": "test", "content": "3 failures"}
        ]});
        assert_eq!(
            render(
                "{{#each messages}}[{{from_phase}}] {{content}}\n{{/each}}",
                &context
            ),
            "[implement] done\n[test] 3 failures\n"
        );
    }

    #[test]
    fn optional_block_renders_when_truthy() {
        let with = json!({"note": "careful"});
        let without = json!({"note": ""});
        let template = "{{#note}}Note: {{note}}{{/note}}";
        assert_eq!(render(template, &with), "Note: careful");
        assert_eq!(render(template, &without), "");
    }

    #[test]
    fn nested_each_inside_block() {
        let context = json!({"extra": true, "xs": ["a", "b"]});
        assert_eq!(
            render("{{#extra}}{{#each xs}}<{{this}}>{{/each}}{{/extra}}", &context),
            "<a><b>"
        );
    }

    #[test]
    fn unterminated_block_is_literal() {
        let context = json!({"x": 1});
        assert_eq!(render("{{#x}}no close", &context), "{{#x}}no close");
    }

    #[test]
    fn fallback_template_for_unknown_name() {
        let set = TemplateSet::builtin();
        assert_eq!(set.get("no-such-template").name, "phase");
        assert_eq!(set.get("worker-assistant").name, "worker-assistant");
    }

    #[test]
    fn builds_phase_prompt() {
        let set = TemplateSet::builtin();
        let prompt = set.build_prompt(
            "phase",
            &json!({
                "issue": {"id": "I1", "title": "Fix it", "description": "The thing is broken"},
                "phase": {"name": "implement", "capabilities": ["code"]}
            }),
        );
        assert!(prompt.user_prompt.contains("Issue I1: Fix it"));
        assert!(prompt.user_prompt.contains("Current phase: implement"));
        assert!(prompt.user_prompt.contains(" code"));
        assert!(!prompt.system_prompt.is_empty());
    }
}
