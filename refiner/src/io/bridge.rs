//! Execution bridge: routes `Execute` directives to a sandbox and stages
//! interpreter context until the owning batch is accepted.

use tracing::debug;

use crate::core::budget::IterationBudget;
use crate::core::execution::{CodeRunner, ExecutionContext, ExecutionRecord, ExecutionResult};
use crate::io::sandbox::Sandbox;

/// Owns the task's shared execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionBridge {
    context: ExecutionContext,
}

impl ExecutionBridge {
    pub fn new(context: ExecutionContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Start a batch. Context changes stay local to the returned runner.
    pub fn stage<'a, S: Sandbox + ?Sized>(
        &self,
        sandbox: &'a S,
        budget: IterationBudget,
    ) -> StagedExecution<'a, S> {
        StagedExecution {
            sandbox,
            budget,
            context: self.context.clone(),
        }
    }

    /// Adopt the context of an accepted batch.
    pub fn commit<S: Sandbox + ?Sized>(&mut self, staged: StagedExecution<'_, S>) {
        self.context = staged.context;
    }
}

/// Runner handed to the document store for one batch.
pub struct StagedExecution<'a, S: Sandbox + ?Sized> {
    sandbox: &'a S,
    budget: IterationBudget,
    context: ExecutionContext,
}

impl<S: Sandbox + ?Sized> CodeRunner for StagedExecution<'_, S> {
    fn run(&mut self, code: &str) -> ExecutionRecord {
        let result = match self.budget.remaining() {
            Ok(timeout) => self.sandbox.execute(code, &self.context, timeout),
            Err(exhausted) => {
                debug!("no iteration budget left for execution");
                ExecutionResult::raised(&self.context, exhausted.to_string())
            }
        };
        let record = ExecutionRecord::from_result(code, &result);
        self.context = result.updated_context;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedSandbox;

    #[test]
    fn context_changes_apply_only_on_commit() {
        let sandbox = ScriptedSandbox::new(["4\n"]);
        let mut bridge = ExecutionBridge::default();

        let mut staged = bridge.stage(&sandbox, IterationBudget::unbounded());
        let record = staged.run("print(2+2)");
        assert_eq!(record.stdout, "4\n");
        assert!(bridge.context().blocks.is_empty());

        bridge.commit(staged);
        assert_eq!(bridge.context().blocks, vec!["print(2+2)".to_string()]);
    }

    #[test]
    fn dropped_stage_leaves_context_untouched() {
        let sandbox = ScriptedSandbox::new(["1\n"]);
        let bridge = ExecutionBridge::default();
        {
            let mut staged = bridge.stage(&sandbox, IterationBudget::unbounded());
            staged.run("x = 1");
        }
        assert_eq!(bridge.context(), &ExecutionContext::default());
    }

    #[test]
    fn exhausted_budget_is_reported_as_data() {
        let sandbox = ScriptedSandbox::new(["never"]);
        let bridge = ExecutionBridge::default();
        let budget = IterationBudget::starting_now(Some(std::time::Duration::ZERO));
        let mut staged = bridge.stage(&sandbox, budget);
        let record = staged.run("x");
        assert_eq!(record.raised_error.as_deref(), Some("iteration timed out"));
        assert!(sandbox.codes().is_empty());
    }
}
