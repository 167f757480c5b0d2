//! Planner hints → workflow definitions.
//!
//! The reasoning component hands over an ordered list of call hints. The
//! list is untrusted: it is decoded with unknown fields rejected, bounded
//! in length, then validated like any other definition.

use serde::Deserialize;
use serde_json::Value;

use super::definition::validate;
use super::errors::WorkflowError;
use super::types::{CallSpec, RetryPolicy, StepDefinition, WorkflowDefinition};

/// Upper bound on hints accepted from one plan.
pub const MAX_HINTS: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Hint {
    #[serde(default)]
    id: Option<String>,
    target: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    /// Absent means "after the previous hint".
    #[serde(default)]
    depends_on: Option<Vec<String>>,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    idempotent: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Build a validated definition named `name` from a JSON hint list.
pub fn definition_from_hints(name: &str, hints: Value) -> Result<WorkflowDefinition, WorkflowError> {
    let Value::Array(items) = hints else {
        return Err(WorkflowError::schema("planner hints must be a JSON array"));
    };
    if items.is_empty() {
        return Err(WorkflowError::schema("planner produced no hints"));
    }
    if items.len() > MAX_HINTS {
        return Err(WorkflowError::schema(format!(
            "planner produced {} hints, limit is {MAX_HINTS}",
            items.len()
        )));
    }

    let mut steps: Vec<StepDefinition> = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let hint: Hint = serde_json::from_value(item)
            .map_err(|e| WorkflowError::schema(format!("hint #{}: {e}", i + 1)))?;

        if let Some(arguments) = &hint.arguments {
            if !arguments.is_object() {
                return Err(WorkflowError::schema(format!(
                    "hint #{}: arguments must be an object",
                    i + 1
                )));
            }
        }

        let depends_on = match hint.depends_on {
            Some(deps) => deps,
            None => steps.last().map(|s| vec![s.id.clone()]).unwrap_or_default(),
        };

        steps.push(StepDefinition {
            id: hint.id.unwrap_or_else(|| format!("step_{}", i + 1)),
            call: CallSpec {
                target: hint.target,
                method: hint.method,
                arguments: hint
                    .arguments
                    .unwrap_or_else(|| Value::Object(Default::default())),
            },
            depends_on,
            optional: hint.optional,
            retry: hint.retry.unwrap_or_default(),
            idempotent: hint.idempotent,
            timeout_ms: hint.timeout_ms,
        });
    }

    let definition = WorkflowDefinition {
        name: name.to_string(),
        steps,
    };
    validate(&definition)?;
    Ok(definition)
}

/// Parse planner output text, which may wrap the JSON array in prose or
/// markdown fences.
pub fn definition_from_text(name: &str, text: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let hints: Value = serde_json::from_str(extract_json_array(text))
        .map_err(|e| WorkflowError::schema(format!("planner output is not JSON: {e}")))?;
    definition_from_hints(name, hints)
}

fn extract_json_array(text: &str) -> &str {
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            return &text[start..=end];
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_hints_chain_in_order() {
        let d = definition_from_hints(
            "triage",
            json!([
                {"target": "gh_search", "arguments": {"q": "crash"}},
                {"target": "shortcut_create_issue", "retry": {"max_attempts": 3, "backoff_ms": [100]}},
                {"id": "notify", "target": "slack", "method": "chat/post", "depends_on": []}
            ]),
        )
        .unwrap();

        assert_eq!(d.steps[0].id, "step_1");
        assert!(d.steps[0].depends_on.is_empty());
        assert_eq!(d.steps[1].depends_on, vec!["step_1".to_string()]);
        assert_eq!(d.steps[1].retry.max_attempts, 3);
        assert!(d.steps[2].depends_on.is_empty());
        assert_eq!(d.steps[2].call.method.as_deref(), Some("chat/post"));
    }

    #[test]
    fn test_untrusted_shapes_rejected() {
        let cases = [
            json!({"target": "x"}),
            json!([]),
            json!([{"target": "x", "shell": "rm -rf /"}]),
            json!([{"target": "x", "arguments": "not an object"}]),
            json!([{"target": "x", "depends_on": ["nowhere"]}]),
            json!([{"method": "tools/call"}]),
        ];
        for hints in cases {
            let err = definition_from_hints("p", hints.clone()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SchemaViolation, "{hints}");
        }

        let too_many: Vec<Value> = (0..=MAX_HINTS).map(|_| json!({"target": "x"})).collect();
        assert!(definition_from_hints("p", Value::Array(too_many)).is_err());
    }

    #[test]
    fn test_fenced_planner_output() {
        let text = "Here is the plan:\n```json\n[{\"target\": \"gh_search\"}]\n```";
        let d = definition_from_text("p", text).unwrap();
        assert_eq!(d.steps.len(), 1);
        assert!(definition_from_text("p", "no plan today").is_err());
    }
}
