//! Definition loading, validation and fingerprinting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::errors::WorkflowError;
use super::types::WorkflowDefinition;

/// Check that a definition is a runnable DAG.
///
/// Step ids must be unique and non-empty, every dependency must name a
/// declared step other than itself, the graph must be acyclic, and every
/// retry budget must allow at least one attempt.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if definition.name.trim().is_empty() {
        return Err(WorkflowError::schema("workflow name is empty"));
    }
    if definition.steps.is_empty() {
        return Err(WorkflowError::schema(format!(
            "workflow '{}' has no steps",
            definition.name
        )));
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in definition.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::schema(format!("step #{} has an empty id", i + 1)));
        }
        if index.insert(step.id.as_str(), i).is_some() {
            return Err(WorkflowError::schema(format!("duplicate step id '{}'", step.id)));
        }
        if step.call.target.trim().is_empty() {
            return Err(WorkflowError::schema(format!("step '{}' has no call target", step.id)));
        }
        if step.retry.max_attempts == 0 {
            return Err(WorkflowError::schema(format!(
                "step '{}' allows zero attempts",
                step.id
            )));
        }
    }

    let mut indegree = vec![0usize; definition.steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definition.steps.len()];
    for (i, step) in definition.steps.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(WorkflowError::schema(format!("step '{}' depends on itself", step.id)));
            }
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(WorkflowError::schema(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                )));
            };
            if seen.insert(d) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    // Kahn's algorithm: anything left unvisited sits on a cycle.
    let mut queue: VecDeque<usize> = (0..indegree.len()).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if visited != definition.steps.len() {
        let cyclic: Vec<&str> = definition
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, s)| s.id.as_str())
            .collect();
        return Err(WorkflowError::schema(format!(
            "dependency cycle among steps: {}",
            cyclic.join(", ")
        )));
    }

    Ok(())
}

/// SHA-256 of the definition's canonical JSON, hex encoded.
pub fn fingerprint(definition: &WorkflowDefinition) -> String {
    let canonical = serde_json::to_vec(definition).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let hash = hasher.finalize();
    format!("{hash:x}")
}

/// Read and validate a definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        WorkflowError::schema(format!("cannot read '{}': {e}", path.display()))
    })?;
    let definition = parse_definition(&text, path)?;
    validate(&definition)?;
    Ok(definition)
}

fn parse_definition(text: &str, path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(text)
            .map_err(|e| WorkflowError::schema(format!("{}: {e}", path.display())))
    } else {
        serde_json::from_str(text)
            .map_err(|e| WorkflowError::schema(format!("{}: {e}", path.display())))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn def(steps: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(json!({"name": "w", "steps": steps})).unwrap()
    }

    fn reason(result: Result<(), WorkflowError>) -> String {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
        err.to_string()
    }

    #[test]
    fn test_valid_diamond() {
        let d = def(json!([
            {"id": "a", "call": {"target": "x_a"}},
            {"id": "b", "call": {"target": "x_b"}, "depends_on": ["a"]},
            {"id": "c", "call": {"target": "x_c"}, "depends_on": ["a"]},
            {"id": "d", "call": {"target": "x_d"}, "depends_on": ["b", "c"]}
        ]));
        validate(&d).unwrap();
    }

    #[test]
    fn test_rejects_cycle() {
        let d = def(json!([
            {"id": "a", "call": {"target": "x"}, "depends_on": ["c"]},
            {"id": "b", "call": {"target": "x"}, "depends_on": ["a"]},
            {"id": "c", "call": {"target": "x"}, "depends_on": ["b"]},
            {"id": "free", "call": {"target": "x"}}
        ]));
        let msg = reason(validate(&d));
        assert!(msg.contains("cycle"));
        assert!(!msg.contains("free"));
    }

    #[test]
    fn test_rejects_bad_references() {
        let unknown = def(json!([{"id": "a", "call": {"target": "x"}, "depends_on": ["ghost"]}]));
        assert!(reason(validate(&unknown)).contains("ghost"));

        let own = def(json!([{"id": "a", "call": {"target": "x"}, "depends_on": ["a"]}]));
        assert!(reason(validate(&own)).contains("itself"));

        let dup = def(json!([
            {"id": "a", "call": {"target": "x"}},
            {"id": "a", "call": {"target": "y"}}
        ]));
        assert!(reason(validate(&dup)).contains("duplicate"));

        let zero = def(json!([{"id": "a", "call": {"target": "x"}, "retry": {"max_attempts": 0}}]));
        assert!(reason(validate(&zero)).contains("zero attempts"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = def(json!([{"id": "a", "call": {"target": "x", "arguments": {"k": 1}}}]));
        let b = def(json!([{"id": "a", "call": {"target": "x", "arguments": {"k": 2}}}]));
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_load_yaml_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.yaml");
        std::fs::write(
            &path,
            "name: triage\nsteps:\n  - id: fetch\n    call:\n      target: gh_search\n      arguments: {q: bug}\n  - id: file\n    depends_on: [fetch]\n    call:\n      target: shortcut_create_issue\n",
        )
        .unwrap();
        let d = load_definition(&path).unwrap();
        assert_eq!(d.steps.len(), 2);
        assert_eq!(d.steps[1].depends_on, vec!["fetch".to_string()]);
    }
}
