//! Code execution sandboxes.
//!
//! A [`Sandbox`] runs one code block against an [`ExecutionContext`] and
//! reports the outcome as data. Nothing here isolates the executed code.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::execution::{ExecutionContext, ExecutionResult};
use crate::io::config::SandboxConfig;
use crate::io::process::{command_from_argv, run_with_timeout};

pub trait Sandbox {
    fn execute(
        &self,
        code: &str,
        context: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> ExecutionResult;
}

/// Runs code through an interpreter command (`["python3", "-"]`), source on stdin.
///
/// Each call replays the blocks that previously succeeded so definitions
/// persist, then strips the replayed output from stdout.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl ProcessSandbox {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }

    fn script(context: &ExecutionContext, code: &str) -> String {
        let mut script = String::new();
        for block in &context.blocks {
            script.push_str(block.trim_end());
            script.push('\n');
        }
        script.push_str(code.trim_end());
        script.push('\n');
        script
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(replayed = context.blocks.len(), code_bytes = code.len()))]
    fn execute(
        &self,
        code: &str,
        context: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let cmd = match command_from_argv(&self.argv) {
            Ok(cmd) => cmd,
            Err(e) => return ExecutionResult::raised(context, format!("{e:#}")),
        };
        let script = Self::script(context, code);
        let limit = self.output_limit_bytes;
        let output = match run_with_timeout(cmd, script.as_bytes(), timeout, limit) {
            Ok(output) => output,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "sandbox command failed to run");
                return ExecutionResult::raised(context, format!("{e:#}"));
            }
        };

        let full_stdout = output.stdout_text();
        let stdout = match full_stdout.strip_prefix(context.transcript.as_str()) {
            Some(rest) => rest.to_string(),
            None => {
                debug!("replayed output diverged; keeping full stdout");
                full_stdout.clone()
            }
        };
        let stderr = output.stderr_text();

        let raised_error = if output.timed_out {
            Some("execution timed out".to_string())
        } else if !output.status.success() {
            Some(match output.status.code() {
                Some(code) => format!("process exited with status {code}"),
                None => "process terminated by signal".to_string(),
            })
        } else {
            None
        };

        let updated_context = if raised_error.is_none() {
            let mut next = context.clone();
            next.blocks.push(code.to_string());
            next.transcript = full_stdout;
            next
        } else {
            context.clone()
        };

        ExecutionResult {
            stdout,
            stderr,
            raised_error,
            updated_context,
        }
    }
}

/// Sandbox for configurations without an interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSandbox;

impl Sandbox for DisabledSandbox {
    fn execute(
        &self,
        _code: &str,
        context: &ExecutionContext,
        _timeout: Option<Duration>,
    ) -> ExecutionResult {
        ExecutionResult::raised(
            context,
            "code execution is disabled (no [sandbox] command configured)",
        )
    }
}

/// Sandbox described by `[sandbox]`; an empty command disables execution.
pub fn sandbox_from_config(config: &SandboxConfig) -> Box<dyn Sandbox> {
    if config.command.is_empty() {
        Box::new(DisabledSandbox)
    } else {
        Box::new(ProcessSandbox::new(
            config.command.clone(),
            config.output_limit_bytes,
        ))
    }
}
