//! Test-only builders and scripted collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::document::{DocumentState, Section, SectionContent};
use crate::core::execution::{CodeRunner, ExecutionContext, ExecutionRecord, ExecutionResult};
use crate::core::history::HistoryEntry;
use crate::core::naming::section_id;
use crate::io::config::{RefinerConfig, write_config};
use crate::io::sandbox::Sandbox;

/// A text section whose id is derived from `name`.
pub fn section(name: &str, text: &str, created_at_iteration: u32, seq: u64) -> Section {
    Section {
        id: section_id(name),
        name: name.to_string(),
        content: SectionContent::text(text),
        created_at_iteration,
        seq,
    }
}

/// Initial state plus `sections` created at iteration 1, in the given order.
pub fn state_with_sections(sections: &[(&str, &str)]) -> DocumentState {
    let mut state = DocumentState::initial("test request");
    state.iteration = 1;
    for (name, text) in sections {
        let section = section(name, text, 1, state.next_seq);
        state.next_seq += 1;
        state.sections.insert(section.id.clone(), section);
    }
    state
}

/// Ledger entry for `state` at its own iteration, as a normal-tier reply.
pub fn history_entry(state: DocumentState, raw_response: &str) -> HistoryEntry {
    HistoryEntry {
        iteration: state.iteration,
        state,
        raw_response: raw_response.to_string(),
        directives: Vec::new(),
        executions: Vec::new(),
        recovery: Default::default(),
        warnings: Vec::new(),
    }
}

/// Code runner that records code and answers with a fixed stdout.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub codes: Vec<String>,
    stdout: String,
}

impl RecordingRunner {
    pub fn with_stdout(stdout: &str) -> Self {
        Self {
            codes: Vec::new(),
            stdout: stdout.to_string(),
        }
    }
}

impl CodeRunner for RecordingRunner {
    fn run(&mut self, code: &str) -> ExecutionRecord {
        self.codes.push(code.to_string());
        ExecutionRecord {
            code: code.to_string(),
            stdout: self.stdout.clone(),
            stderr: String::new(),
            raised_error: None,
        }
    }
}

/// Sandbox that answers each execution with the next scripted stdout.
///
/// Successful blocks are appended to the context like a real interpreter
/// would; once the script runs out every execution raises.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    outputs: RefCell<VecDeque<String>>,
    codes: RefCell<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outputs: RefCell::new(outputs.into_iter().map(Into::into).collect()),
            codes: RefCell::new(Vec::new()),
        }
    }

    /// Code blocks executed so far.
    pub fn codes(&self) -> Vec<String> {
        self.codes.borrow().clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(
        &self,
        code: &str,
        context: &ExecutionContext,
        _timeout: Option<Duration>,
    ) -> ExecutionResult {
        self.codes.borrow_mut().push(code.to_string());
        let Some(stdout) = self.outputs.borrow_mut().pop_front() else {
            return ExecutionResult::raised(context, "scripted sandbox has no outputs left");
        };
        let mut updated_context = context.clone();
        updated_context.blocks.push(code.to_string());
        updated_context.transcript.push_str(&stdout);
        ExecutionResult {
            stdout,
            stderr: String::new(),
            raised_error: None,
            updated_context,
        }
    }
}

/// Temporary working directory for CLI and persistence tests.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create tempdir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("refiner.toml")
    }

    pub fn session_path(&self) -> PathBuf {
        self.path().join("session.json")
    }

    /// Write `config` as `refiner.toml`.
    pub fn write_config(&self, config: &RefinerConfig) -> Result<PathBuf> {
        let path = self.config_path();
        write_config(&path, config)?;
        Ok(path)
    }

    /// Write scripted model responses as a JSON array file.
    pub fn write_responses(&self, name: &str, responses: &[&str]) -> Result<PathBuf> {
        let path = self.path().join(name);
        let json = serde_json::to_string_pretty(responses).context("serialize responses")?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
