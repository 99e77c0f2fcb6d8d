//! Per-iteration time budget shared by model and sandbox calls.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("iteration timed out")]
pub struct BudgetExhausted;

/// Deadline for one iteration; `None` means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct IterationBudget {
    deadline: Option<Instant>,
}

impl IterationBudget {
    pub fn starting_now(limit: Option<Duration>) -> Self {
        Self {
            deadline: limit.map(|limit| Instant::now() + limit),
        }
    }

    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    /// Time left before the deadline. `Ok(None)` when unbounded.
    pub fn remaining(&self) -> Result<Option<Duration>, BudgetExhausted> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::from_secs(0));
        if remaining.is_zero() {
            return Err(BudgetExhausted);
        }
        Ok(Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_runs_out() {
        assert_eq!(IterationBudget::unbounded().remaining(), Ok(None));
        assert_eq!(IterationBudget::starting_now(None).remaining(), Ok(None));
    }

    #[test]
    fn elapsed_deadline_is_exhausted() {
        let budget = IterationBudget::starting_now(Some(Duration::from_secs(0)));
        assert_eq!(budget.remaining(), Err(BudgetExhausted));
    }

    #[test]
    fn future_deadline_reports_remaining() {
        let budget = IterationBudget::starting_now(Some(Duration::from_secs(60)));
        let left = budget.remaining().expect("budget").expect("bounded");
        assert!(left <= Duration::from_secs(60));
    }
}
