//! Prompt composition.
//!
//! The builder assembles one text document from up to three sections,
//! joined by `\n\n---\n\n`: agent instructions, the task card, and
//! previous-attempt context on retries. Output is byte-identical for
//! identical inputs (task metadata is a sorted map). No escaping is
//! performed; keeping description and metadata strings safe is the
//! caller's job.

use crate::agent::AgentDefinition;
use crate::task::Task;

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Compose the prompt for one execution attempt.
pub fn build_prompt(task: &Task, agent: Option<&AgentDefinition>, retry_context: Option<&str>) -> String {
    let mut sections = Vec::with_capacity(3);

    if let Some(agent) = agent {
        sections.push(format!("# Agent Instructions\n\n{}", agent.prompt()));
    }

    sections.push(task_section(task));

    if let Some(context) = retry_context {
        sections.push(format!("# Previous Attempt Context\n\n{context}"));
    }

    sections.join(SECTION_SEPARATOR)
}

fn task_section(task: &Task) -> String {
    let mut out = String::from("# Task\n\n");
    out.push_str(&format!("**ID:** {}\n", task.id));
    out.push_str(&format!("**Title:** {}\n", task.title));
    out.push_str(&format!("**Status:** {}\n", task.status));
    out.push_str(&format!("**Priority:** {}\n", task.priority));
    if let Some(feature) = &task.feature {
        out.push_str(&format!("**Feature:** {feature}\n"));
    }
    out.push('\n');
    out.push_str(&task.description);

    if !task.metadata.is_empty() {
        out.push_str("\n\n## Metadata\n");
        for (key, value) in &task.metadata {
            out.push_str(&format!("\n- **{key}:** {}", render_value(value)));
        }
    }

    out
}

/// Render a metadata value: strings verbatim, arrays comma-joined,
/// objects as compact JSON.
fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    fn task() -> Task {
        Task::new("T1", "Fix login", "The login form 500s.", TaskPriority::High)
    }

    fn agent() -> AgentDefinition {
        AgentDefinition::new("fixer", "", "You fix bugs carefully.").unwrap()
    }

    #[test]
    fn sections_are_joined_by_separator() {
        let a = agent();
        let prompt = build_prompt(&task(), Some(&a), Some("attempt 1 timed out"));

        let parts: Vec<&str> = prompt.split(SECTION_SEPARATOR).collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("# Agent Instructions"));
        assert!(parts[1].starts_with("# Task"));
        assert!(parts[2].starts_with("# Previous Attempt Context"));
    }

    #[test]
    fn agent_prompt_appears_verbatim() {
        let a = agent();
        let prompt = build_prompt(&task(), Some(&a), None);
        assert!(prompt.contains("You fix bugs carefully."));
    }

    #[test]
    fn no_agent_means_task_section_first() {
        let prompt = build_prompt(&task(), None, None);
        assert!(prompt.starts_with("# Task"));
        assert!(!prompt.contains("Agent Instructions"));
    }

    #[test]
    fn task_card_fields() {
        let t = task().with_feature("auth");
        let prompt = build_prompt(&t, None, None);
        assert!(prompt.contains("**ID:** T1"));
        assert!(prompt.contains("**Title:** Fix login"));
        assert!(prompt.contains("**Status:** pending"));
        assert!(prompt.contains("**Priority:** high"));
        assert!(prompt.contains("**Feature:** auth"));
        assert!(prompt.contains("The login form 500s."));
    }

    #[test]
    fn metadata_rendering() {
        let t = task()
            .with_metadata("labels", serde_json::json!(["p0", "regression"]))
            .with_metadata("attempt_budget", serde_json::json!(3))
            .with_metadata("origin", serde_json::json!({"kind": "issue", "n": 42}));
        let prompt = build_prompt(&t, None, None);

        assert!(prompt.contains("## Metadata"));
        assert!(prompt.contains("- **labels:** p0, regression"));
        assert!(prompt.contains("- **attempt_budget:** 3"));
        assert!(prompt.contains(r#"- **origin:** {"kind":"issue","n":42}"#));
    }

    #[test]
    fn no_metadata_no_subsection() {
        let prompt = build_prompt(&task(), None, None);
        assert!(!prompt.contains("## Metadata"));
    }

    #[test]
    fn output_is_deterministic() {
        let t = task()
            .with_metadata("zeta", serde_json::json!(1))
            .with_metadata("alpha", serde_json::json!(2));
        let a = agent();

        let first = build_prompt(&t, Some(&a), Some("ctx"));
        let second = build_prompt(&t, Some(&a), Some("ctx"));
        assert_eq!(first, second);

        // Sorted metadata keys, regardless of insertion order.
        let alpha = first.find("- **alpha:**").unwrap();
        let zeta = first.find("- **zeta:**").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn size_grows_with_added_sections() {
        let t = task();
        let a = agent();

        let bare = build_prompt(&t, None, None);
        let with_agent = build_prompt(&t, Some(&a), None);
        let with_retry = build_prompt(&t, Some(&a), Some("context"));

        assert!(bare.len() < with_agent.len());
        assert!(with_agent.len() < with_retry.len());
    }
}
