//! Document invariants and the violations that abort a task.

use std::collections::HashSet;

use crate::core::document::{DocumentState, ROOT_SECTION_ID};

/// Conditions the engine cannot recover from by re-prompting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("relation cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("section id '{id}' is claimed by both '{existing}' and '{incoming}'")]
    IdCollision {
        id: String,
        existing: String,
        incoming: String,
    },
    #[error("synthesized fallback batch was rejected: {reason}")]
    FallbackRejected { reason: String },
    #[error("document state is inconsistent: {}", .errors.join("; "))]
    Inconsistent { errors: Vec<String> },
}

/// Check semantic invariants of a document state:
/// - Map keys match section ids; ids are unique and non-empty
/// - The root section exists
/// - Focus, if set, names an existing section
/// - Every relation endpoint names an existing section
/// - The parent graph is acyclic
/// - Creation counters are consistent with `next_seq` and `iteration`
pub fn validate_invariants(state: &DocumentState) -> Vec<String> {
    let mut errors = Vec::new();

    if !state.sections.contains_key(ROOT_SECTION_ID) {
        errors.push(format!("missing root section '{ROOT_SECTION_ID}'"));
    }

    let mut seqs = HashSet::new();
    for (key, section) in &state.sections {
        if key != &section.id {
            errors.push(format!("section keyed '{key}' has id '{}'", section.id));
        }
        if section.id.trim().is_empty() {
            errors.push("section with empty id".to_string());
        }
        if section.seq >= state.next_seq {
            errors.push(format!(
                "{}: seq {} is not below next_seq {}",
                section.id, section.seq, state.next_seq
            ));
        }
        if !seqs.insert(section.seq) {
            errors.push(format!("{}: duplicate seq {}", section.id, section.seq));
        }
        if section.created_at_iteration > state.iteration {
            errors.push(format!(
                "{}: created at iteration {} after state iteration {}",
                section.id, section.created_at_iteration, state.iteration
            ));
        }
    }

    if let Some(focus) = &state.current_focus_id
        && !state.sections.contains_key(focus)
    {
        errors.push(format!("focus '{focus}' does not exist"));
    }

    let edges = state
        .relations
        .children
        .iter()
        .chain(state.relations.references.iter());
    for (from, targets) in edges {
        for id in std::iter::once(from).chain(targets.iter()) {
            if !state.sections.contains_key(id) {
                errors.push(format!("relation mentions missing section '{id}'"));
            }
        }
    }

    let mut parents: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for (parent, kids) in &state.relations.children {
        for kid in kids {
            if let Some(previous) = parents.insert(kid.as_str(), parent.as_str()) {
                errors.push(format!(
                    "section '{kid}' has two parents '{previous}' and '{parent}'"
                ));
            }
        }
    }

    if let Some(path) = state.relations.find_cycle() {
        errors.push(InvariantViolation::Cycle { path }.to_string());
    }

    errors
}
