//! Errors that end a task.
//!
//! Recoverable problems (parse failures, rejected batches) never surface
//! here; they are absorbed by the recovery controller.

use crate::core::document::DocumentState;
use crate::core::history::HistoryLedger;
use crate::core::invariants::InvariantViolation;
use crate::io::model::ProviderFailure;

/// Last committed state and the ledger up to the failure point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub last_state: DocumentState,
    pub history: HistoryLedger,
}

impl TaskSnapshot {
    pub fn of(history: &HistoryLedger) -> Box<Self> {
        Box::new(Self {
            last_state: history.last_state().clone(),
            history: history.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("model call failed after {attempts} attempt(s): {source}")]
    Provider {
        attempts: u32,
        #[source]
        source: ProviderFailure,
        snapshot: Box<TaskSnapshot>,
    },
    #[error("fatal invariant violation: {violation}")]
    FatalInvariant {
        #[source]
        violation: InvariantViolation,
        snapshot: Box<TaskSnapshot>,
    },
    #[error("task is already complete")]
    Finished,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// State and history to fall back on, when the failure has them.
    pub fn snapshot(&self) -> Option<&TaskSnapshot> {
        match self {
            TaskError::Provider { snapshot, .. } | TaskError::FatalInvariant { snapshot, .. } => {
                Some(snapshot)
            }
            TaskError::Finished | TaskError::Internal(_) => None,
        }
    }

    pub fn is_fatal_invariant(&self) -> bool {
        matches!(self, TaskError::FatalInvariant { .. })
    }
}
