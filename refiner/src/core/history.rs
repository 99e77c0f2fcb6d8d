//! Append-only history ledger of document states.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::directive::Directive;
use crate::core::document::DocumentState;
use crate::core::execution::ExecutionRecord;
use crate::core::recovery::RecoveryTrace;

/// One state transition. Entries are never mutated once pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub state: DocumentState,
    pub raw_response: String,
    pub directives: Vec<Directive>,
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
    #[serde(default)]
    pub recovery: RecoveryTrace,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Section-level change list between two states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl StateDiff {
    pub fn between(before: &DocumentState, after: &DocumentState) -> Self {
        let before_ids: BTreeSet<&String> = before.sections.keys().collect();
        let after_ids: BTreeSet<&String> = after.sections.keys().collect();

        let added = after_ids
            .difference(&before_ids)
            .map(|id| id.to_string())
            .collect();
        let removed = before_ids
            .difference(&after_ids)
            .map(|id| id.to_string())
            .collect();
        let modified = before_ids
            .intersection(&after_ids)
            .filter(|id| {
                let id = id.as_str();
                let old = &before.sections[id];
                let new = &after.sections[id];
                old.content != new.content
                    || old.name != new.name
                    || before.relations.parent_of(id) != after.relations.parent_of(id)
            })
            .map(|id| id.to_string())
            .collect();

        Self {
            added,
            modified,
            removed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Ledger of every accepted transition, rooted at the initial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLedger {
    initial: DocumentState,
    entries: Vec<HistoryEntry>,
}

impl HistoryLedger {
    pub fn new(initial: DocumentState) -> Self {
        Self {
            initial,
            entries: Vec::new(),
        }
    }

    /// Only the orchestrator records transitions.
    pub(crate) fn append(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    /// Entries oldest first. Each call starts a fresh traversal.
    pub fn entries(&self) -> std::slice::Iter<'_, HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn initial_state(&self) -> &DocumentState {
        &self.initial
    }

    /// Entry recorded for `iteration`.
    pub fn get_at(&self, iteration: u32) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.iteration == iteration)
    }

    /// State after `iteration`; iteration 0 (or the initial state's own
    /// iteration) is the initial state.
    pub fn state_at(&self, iteration: u32) -> Option<&DocumentState> {
        if iteration == self.initial.iteration {
            return Some(&self.initial);
        }
        self.get_at(iteration).map(|e| &e.state)
    }

    /// Most recent committed state.
    pub fn last_state(&self) -> &DocumentState {
        self.entries
            .last()
            .map(|e| &e.state)
            .unwrap_or(&self.initial)
    }

    /// Sections added, modified and removed between two recorded iterations.
    pub fn diff(&self, from: u32, to: u32) -> Option<StateDiff> {
        let before = self.state_at(from)?;
        let after = self.state_at(to)?;
        Some(StateDiff::between(before, after))
    }

    /// Ledger consistency problems, empty when sound.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut expected = self.initial.iteration + 1;
        for entry in &self.entries {
            if entry.iteration != expected {
                errors.push(format!(
                    "ledger entry has iteration {} but {} was expected",
                    entry.iteration, expected
                ));
            }
            if entry.state.iteration != entry.iteration {
                errors.push(format!(
                    "ledger entry {} holds a state at iteration {}",
                    entry.iteration, entry.state.iteration
                ));
            }
            expected = entry.iteration + 1;
        }
        errors
    }
}
