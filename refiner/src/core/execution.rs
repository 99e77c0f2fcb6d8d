//! Execution types shared by the document store and the execution bridge.
//!
//! The store only sees the [`CodeRunner`] seam; sandboxes and context staging
//! live in `io`.

use serde::{Deserialize, Serialize};

/// Interpreter state carried across iterations of one task.
///
/// Sandboxes that cannot keep a live interpreter replay `blocks` before new
/// code and use `transcript` to strip the replayed output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Code blocks that ran without raising, in execution order.
    pub blocks: Vec<String>,
    /// Stdout produced by replaying `blocks`.
    pub transcript: String,
}

/// Result of one sandbox call. Failures are data, never control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub raised_error: Option<String>,
    pub updated_context: ExecutionContext,
}

impl ExecutionResult {
    /// A result that raised before producing output; the context is unchanged.
    pub fn raised(context: &ExecutionContext, error: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            raised_error: Some(error.into()),
            updated_context: context.clone(),
        }
    }
}

/// What the document keeps of an execution: the code and its observable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub raised_error: Option<String>,
}

impl ExecutionRecord {
    pub fn from_result(code: &str, result: &ExecutionResult) -> Self {
        Self {
            code: code.to_string(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            raised_error: result.raised_error.clone(),
        }
    }

    /// Markdown rendering used when folding a result into a text section.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        buf.push_str("## Code Execution Result\n\n### Executed Code:\n```\n");
        buf.push_str(self.code.trim_end());
        buf.push_str("\n```\n\n### Output:\n```\n");
        buf.push_str(self.stdout.trim_end());
        buf.push_str("\n```\n");
        if !self.stderr.trim().is_empty() {
            buf.push_str("\n### Stderr:\n```\n");
            buf.push_str(self.stderr.trim_end());
            buf.push_str("\n```\n");
        }
        if let Some(err) = &self.raised_error {
            buf.push_str(&format!("\n### Error:\n{}\n", err.trim_end()));
        }
        buf
    }
}

/// Runs `Execute` directives on behalf of the document store.
pub trait CodeRunner {
    fn run(&mut self, code: &str) -> ExecutionRecord;
}

/// Runner for batches that must not execute code (e.g. synthesized fallbacks).
#[derive(Debug, Default)]
pub struct NoExecution;

impl CodeRunner for NoExecution {
    fn run(&mut self, code: &str) -> ExecutionRecord {
        ExecutionRecord {
            code: code.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            raised_error: Some("code execution is not available here".to_string()),
        }
    }
}
