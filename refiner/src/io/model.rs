//! Language model backends.
//!
//! The [`LanguageModel`] trait decouples the orchestrator from the actual
//! provider. `CommandModel` spawns a configured command with the prompt on
//! stdin; `ScriptedModel` replays canned responses for tests and offline runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{command_from_argv, run_with_timeout};

/// A provider call that produced no usable text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderFailure {
    #[error("model call timed out")]
    Timeout,
    #[error("model command exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("scripted model has no responses left")]
    Exhausted,
}

impl ProviderFailure {
    /// Whether retrying the same call can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderFailure::Exhausted)
    }
}

/// Prompt in, text out.
pub trait LanguageModel {
    fn complete(&self, prompt: &str, timeout: Option<Duration>) -> Result<String, ProviderFailure>;
}

/// Model backed by an external command (`argv`), prompt on stdin, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandModel {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandModel {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }
}

impl LanguageModel for CommandModel {
    #[instrument(skip_all, fields(program = self.argv.first().map(String::as_str), prompt_bytes = prompt.len()))]
    fn complete(&self, prompt: &str, timeout: Option<Duration>) -> Result<String, ProviderFailure> {
        let cmd =
            command_from_argv(&self.argv).map_err(|e| ProviderFailure::Unavailable(e.to_string()))?;
        let output = run_with_timeout(cmd, prompt.as_bytes(), timeout, self.output_limit_bytes)
            .map_err(|e| ProviderFailure::Unavailable(format!("{e:#}")))?;

        if output.timed_out {
            warn!("model command timed out");
            return Err(ProviderFailure::Timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "model command failed");
            return Err(ProviderFailure::NonZeroExit {
                code: output.status.code(),
                stderr: output.stderr_text().trim().to_string(),
            });
        }
        debug!(response_bytes = output.stdout.len(), "model command completed");
        Ok(output.stdout_text())
    }
}

/// Replays canned responses in order and records every prompt it was given.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    responses: RefCell<VecDeque<Result<String, ProviderFailure>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(responses.into_iter().map(|r| Ok(r.into())))
    }

    pub fn with_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ProviderFailure>>,
    {
        Self {
            responses: RefCell::new(results.into_iter().collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Load a JSON array of response strings.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read responses {}", path.display()))?;
        let responses: Vec<String> = serde_json::from_str(&raw)
            .with_context(|| format!("parse responses {}", path.display()))?;
        info!(count = responses.len(), path = %path.display(), "loaded scripted responses");
        Ok(Self::new(responses))
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.borrow().len()
    }
}

impl LanguageModel for ScriptedModel {
    fn complete(
        &self,
        prompt: &str,
        _timeout: Option<Duration>,
    ) -> Result<String, ProviderFailure> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(ProviderFailure::Exhausted))
    }
}

/// Adapter for a plain closure.
pub struct FnModel<F>(pub F);

impl<F> LanguageModel for FnModel<F>
where
    F: Fn(&str) -> Result<String, ProviderFailure>,
{
    fn complete(
        &self,
        prompt: &str,
        _timeout: Option<Duration>,
    ) -> Result<String, ProviderFailure> {
        (self.0)(prompt)
    }
}
