//! Section naming: tag-safe ids and the duplicate-detection key.

use serde::{Deserialize, Serialize};

/// How section names are compared when checking for duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    /// Names that differ only by case, spaces, underscores or hyphens collide.
    #[default]
    CaseInsensitiveNormalize,
    /// Names must match exactly to collide.
    Strict,
}

impl NamingPolicy {
    /// Key used to detect duplicate names under this policy.
    pub fn key(self, name: &str) -> String {
        match self {
            NamingPolicy::CaseInsensitiveNormalize => normalized_key(name),
            NamingPolicy::Strict => name.trim().to_string(),
        }
    }
}

/// Derive the tag-safe section id for a display name.
///
/// Trims the name, replaces each run of whitespace with a single `_` and maps
/// every other character outside `[A-Za-z0-9_-]` to `_`, so the id can be
/// used as an element name in the document text form.
pub fn section_id(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .map(|c| if is_id_char(c) { c } else { '_' })
        .collect()
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Lowercase the id of `name` and collapse runs of underscores and hyphens.
///
/// `"Initial Analysis Plan"`, `"Initial_Analysis_Plan"` and
/// `" initial-analysis  plan "` all map to `"initial analysis plan"`. Names
/// that share an id always share a key.
pub fn normalized_key(name: &str) -> String {
    section_id(name)
        .split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_id_replaces_whitespace_runs() {
        assert_eq!(section_id("  Initial   Analysis Plan "), "Initial_Analysis_Plan");
        assert_eq!(section_id("Plan"), "Plan");
    }

    #[test]
    fn section_id_is_tag_safe() {
        assert_eq!(section_id("A<B"), "A_B");
        assert_eq!(section_id("Q&A: \"draft\" v2"), "Q_A___draft__v2");
        assert_eq!(section_id("Café"), "Caf_");
        assert!(
            section_id("x</y> <z a=\"1\">")
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        );
    }

    #[test]
    fn names_sharing_an_id_share_a_key() {
        assert_eq!(normalized_key("A<B"), normalized_key("A>B"));
        assert_eq!(normalized_key("A<B"), "a b");
    }

    #[test]
    fn normalized_key_collapses_case_space_and_underscore() {
        let a = normalized_key("Initial Analysis Plan");
        let b = normalized_key("Initial_Analysis_Plan");
        let c = normalized_key("initial--analysis__PLAN");
        assert_eq!(a, "initial analysis plan");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn strict_policy_keeps_case() {
        assert_ne!(
            NamingPolicy::Strict.key("Plan"),
            NamingPolicy::Strict.key("plan")
        );
        assert_eq!(
            NamingPolicy::CaseInsensitiveNormalize.key("Plan"),
            NamingPolicy::CaseInsensitiveNormalize.key("plan")
        );
    }
}
