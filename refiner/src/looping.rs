//! Multi-iteration driver: `run` until completion, budget or cancellation.

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::document::DocumentState;
use crate::core::history::HistoryLedger;
use crate::error::TaskError;
use crate::io::config::RefinerConfig;
use crate::io::model::LanguageModel;
use crate::io::sandbox::{Sandbox, sandbox_from_config};
use crate::task::{StepOutcome, Task, create_task, step};

/// Why `run` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed { final_answer: String },
    /// The task reached `max_iterations` total iterations without completing.
    MaxIterations,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub final_state: DocumentState,
    pub history: HistoryLedger,
    pub stop: StopReason,
    pub steps_executed: u32,
}

/// Step `task` until it completes, its iteration count reaches
/// `max_iterations`, or its cancel flag is raised.
///
/// The budget counts every iteration the task has ever run, so a resumed
/// task only continues up to the same total.
#[instrument(skip_all, fields(max_iterations = max_iterations))]
pub fn run<M, S, F>(
    task: &mut Task,
    model: &M,
    sandbox: &S,
    max_iterations: u32,
    mut on_step: F,
) -> Result<RunOutcome, TaskError>
where
    M: LanguageModel + ?Sized,
    S: Sandbox + ?Sized,
    F: FnMut(&StepOutcome),
{
    let cancel = task.cancel_flag();
    let mut steps_executed = 0u32;
    let stop = loop {
        if let Some(answer) = task.completion() {
            break StopReason::Completed {
                final_answer: answer.to_string(),
            };
        }
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if task.current_state().iteration >= max_iterations {
            break StopReason::MaxIterations;
        }
        let outcome = step(task, model, sandbox)?;
        steps_executed += 1;
        on_step(&outcome);
    };

    info!(steps_executed, stop = ?stop, "run finished");
    Ok(RunOutcome {
        final_state: task.current_state().clone(),
        history: task.history().clone(),
        stop,
        steps_executed,
    })
}

/// Create a task with default configuration and run it.
pub fn solve<M: LanguageModel + ?Sized>(
    initial_request: &str,
    model: &M,
    max_iterations: u32,
) -> Result<RunOutcome, TaskError> {
    let config = RefinerConfig::default();
    let sandbox = sandbox_from_config(&config.sandbox);
    let mut task = create_task(initial_request, config)?;
    run(&mut task, model, sandbox.as_ref(), max_iterations, |_| {})
}
