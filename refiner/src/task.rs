//! One refinement iteration: prompt, model, parse, apply, record.
//!
//! Every iteration ends in exactly one new ledger entry. Rejected responses
//! escalate through corrective prompts, a fallback prompt and finally a
//! synthesized batch that stores the raw reply, so only provider failures
//! and invariant violations stop a task.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::IterationBudget;
use crate::core::directive::Directive;
use crate::core::document::DocumentState;
use crate::core::execution::NoExecution;
use crate::core::history::{HistoryEntry, HistoryLedger, StateDiff};
use crate::core::invariants::{InvariantViolation, validate_invariants};
use crate::core::parser::parse_response;
use crate::core::recovery::{
    RecoveryController, RecoveryTier, RecoveryTrace, Rejection, give_up_directives,
};
use crate::core::store::{Applied, ApplyError, ApplyOptions, apply};
use crate::error::{TaskError, TaskSnapshot};
use crate::io::bridge::ExecutionBridge;
use crate::io::config::RefinerConfig;
use crate::io::iteration_log::{Exchange, IterationMeta, IterationWriteRequest, write_iteration};
use crate::io::model::{LanguageModel, ProviderFailure};
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptKind};
use crate::io::sandbox::Sandbox;
use crate::io::session_store::SessionFile;

/// Cooperative cancellation shared between a running task and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A refinement task: configuration, ledger and interpreter context.
#[derive(Debug)]
pub struct Task {
    config: RefinerConfig,
    ledger: HistoryLedger,
    bridge: ExecutionBridge,
    completion: Option<String>,
    cancel: CancelFlag,
    log_dir: Option<PathBuf>,
}

/// Start a task whose root section holds `initial_request`.
pub fn create_task(initial_request: &str, config: RefinerConfig) -> Result<Task> {
    config.validate()?;
    Ok(Task {
        ledger: HistoryLedger::new(DocumentState::initial(initial_request)),
        bridge: ExecutionBridge::default(),
        completion: None,
        cancel: CancelFlag::new(),
        log_dir: None,
        config,
    })
}

impl Task {
    /// Resume a persisted task.
    pub fn from_session(session: SessionFile, config: RefinerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger: session.ledger,
            bridge: ExecutionBridge::new(session.context),
            completion: session.completion,
            cancel: CancelFlag::new(),
            log_dir: None,
            config,
        })
    }

    pub fn to_session(&self) -> SessionFile {
        SessionFile {
            ledger: self.ledger.clone(),
            context: self.bridge.context().clone(),
            completion: self.completion.clone(),
        }
    }

    /// Write per-iteration artifacts under `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &RefinerConfig {
        &self.config
    }

    pub fn current_state(&self) -> &DocumentState {
        self.ledger.last_state()
    }

    pub fn history(&self) -> &HistoryLedger {
        &self.ledger
    }

    pub fn completion(&self) -> Option<&str> {
        self.completion.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_some()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn snapshot(&self) -> Box<TaskSnapshot> {
        TaskSnapshot::of(&self.ledger)
    }

    /// Warnings of the previous iteration, shown in the next prompt.
    fn carry_over_notes(&self) -> Option<String> {
        let last = self.ledger.entries().last()?;
        let mut notes = last.warnings.clone();
        if last.recovery.tier != RecoveryTier::Normal {
            notes.push(format!(
                "the previous reply needed recovery ({}); follow the directive format exactly",
                last.recovery.tier.label()
            ));
        }
        (!notes.is_empty()).then(|| notes.join("\n"))
    }
}

/// What one iteration committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub entry: HistoryEntry,
    /// Final answer when this iteration applied `complete`.
    pub completion: Option<String>,
    /// Sections changed relative to the previous state.
    pub changes: StateDiff,
}

impl StepOutcome {
    pub fn state(&self) -> &DocumentState {
        &self.entry.state
    }
}

struct Accepted {
    applied: Applied,
    directives: Vec<Directive>,
    warnings: Vec<String>,
    raw_response: String,
}

/// Run one iteration of `task`.
#[instrument(skip_all, fields(iteration = task.current_state().iteration + 1))]
pub fn step<M, S>(task: &mut Task, model: &M, sandbox: &S) -> Result<StepOutcome, TaskError>
where
    M: LanguageModel + ?Sized,
    S: Sandbox + ?Sized,
{
    if task.is_complete() {
        return Err(TaskError::Finished);
    }
    let started = Instant::now();
    let budget = IterationBudget::starting_now(Some(task.config.iteration_timeout()));
    let options = task.config.apply_options();
    let prev = task.current_state().clone();

    let inputs =
        PromptInputs::from_state(&prev, &task.config.system_prompt, task.config.toc_ordering)
        .with_max_iterations(Some(task.config.max_iterations))
        .with_notes(task.carry_over_notes());
    let builder = PromptBuilder::new(task.config.prompt_budget_bytes);
    let mut recovery = RecoveryController::new(task.config.max_correction_attempts);
    let mut kind = PromptKind::Step;
    let mut exchanges: Vec<Exchange> = Vec::new();

    let accepted = loop {
        let prompt = builder.build(&kind, &inputs)?;
        let raw = complete_with_retries(model, &prompt, &budget, task.config.max_provider_retries)
            .map_err(|(attempts, source)| TaskError::Provider {
                attempts,
                source,
                snapshot: task.snapshot(),
            })?;
        exchanges.push(Exchange {
            prompt,
            response: raw.clone(),
        });

        let mut staged = task.bridge.stage(sandbox, budget);
        let rejection = match parse_response(&raw) {
            Err(failure) => Rejection::Parse(failure),
            Ok(parsed) => match apply(&prev, &parsed.directives, &options, &mut staged) {
                Ok(applied) => {
                    task.bridge.commit(staged);
                    break Accepted {
                        applied,
                        directives: parsed.directives,
                        warnings: parsed.warnings.into_iter().map(|w| w.message).collect(),
                        raw_response: raw,
                    };
                }
                Err(ApplyError::Fatal(violation)) => {
                    return Err(TaskError::FatalInvariant {
                        violation,
                        snapshot: task.snapshot(),
                    });
                }
                Err(err) => Rejection::Apply(err),
            },
        };

        match recovery.escalate(&rejection) {
            RecoveryTier::Normal => kind = PromptKind::Step,
            RecoveryTier::Correcting(attempt) => {
                kind = PromptKind::Correction {
                    attempt,
                    reason: rejection.describe(),
                    response: raw,
                };
            }
            RecoveryTier::Fallback => kind = PromptKind::Fallback,
            RecoveryTier::GiveUp => {
                break give_up(task, &prev, &options, raw, &rejection)?;
            }
        }
    };

    commit(task, prev, accepted, recovery.trace(), &exchanges, started)
}

/// Store the raw reply verbatim; the focus is left alone.
fn give_up(
    task: &Task,
    prev: &DocumentState,
    options: &ApplyOptions,
    raw: String,
    rejection: &Rejection,
) -> Result<Accepted, TaskError> {
    let directives = give_up_directives(prev, &raw, options.naming);
    let applied = apply(prev, &directives, options, &mut NoExecution).map_err(|err| {
        TaskError::FatalInvariant {
            violation: InvariantViolation::FallbackRejected {
                reason: err.to_string(),
            },
            snapshot: task.snapshot(),
        }
    })?;
    let stored_as = match directives.first() {
        Some(Directive::NewSection { name, .. }) => name.clone(),
        _ => String::new(),
    };
    warn!(section = %stored_as, reason = rejection.reason(), "storing unparsed response");
    Ok(Accepted {
        applied,
        warnings: vec![format!(
            "reply could not be used ({}); stored verbatim in {stored_as}",
            rejection.reason()
        )],
        directives,
        raw_response: raw,
    })
}

fn commit(
    task: &mut Task,
    prev: DocumentState,
    accepted: Accepted,
    recovery: RecoveryTrace,
    exchanges: &[Exchange],
    started: Instant,
) -> Result<StepOutcome, TaskError> {
    let Accepted {
        applied,
        directives,
        warnings,
        raw_response,
    } = accepted;

    let errors = validate_invariants(&applied.state);
    if !errors.is_empty() {
        return Err(TaskError::FatalInvariant {
            violation: InvariantViolation::Inconsistent { errors },
            snapshot: task.snapshot(),
        });
    }

    let entry = HistoryEntry {
        iteration: applied.state.iteration,
        state: applied.state,
        raw_response,
        directives,
        executions: applied.executions,
        recovery,
        warnings,
    };
    let changes = StateDiff::between(&prev, &entry.state);
    task.ledger.append(entry.clone());
    if let Some(answer) = &applied.completion {
        task.completion = Some(answer.clone());
    }

    if let Some(log_dir) = &task.log_dir {
        let meta = IterationMeta {
            iteration: entry.iteration,
            recovery,
            directives: entry.directives.iter().map(Directive::describe).collect(),
            executions: entry.executions.len(),
            warnings: entry.warnings.clone(),
            completed: applied.completion.is_some(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let written = write_iteration(&IterationWriteRequest {
            log_dir,
            meta: &meta,
            exchanges,
            state_before: &prev,
            state_after: &entry.state,
        });
        if let Err(err) = written {
            warn!(err = %format!("{err:#}"), "failed to write iteration artifacts");
        }
    }

    info!(
        iteration = entry.iteration,
        tier = %recovery.tier.label(),
        attempts = recovery.attempts,
        added = changes.added.len(),
        modified = changes.modified.len(),
        removed = changes.removed.len(),
        completed = applied.completion.is_some(),
        "iteration committed"
    );

    Ok(StepOutcome {
        entry,
        completion: applied.completion,
        changes,
    })
}

/// Call the model, retrying retryable failures up to `retries` extra times.
fn complete_with_retries<M: LanguageModel + ?Sized>(
    model: &M,
    prompt: &str,
    budget: &IterationBudget,
    retries: u32,
) -> Result<String, (u32, ProviderFailure)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let timeout = budget
            .remaining()
            .map_err(|_| (attempts, ProviderFailure::Timeout))?;
        match model.complete(prompt, timeout) {
            Ok(text) => {
                debug!(attempts, response_bytes = text.len(), "model replied");
                return Ok(text);
            }
            Err(failure) if failure.is_retryable() && attempts <= retries => {
                warn!(attempts, err = %failure, "model call failed; retrying");
            }
            Err(failure) => return Err((attempts, failure)),
        }
    }
}
