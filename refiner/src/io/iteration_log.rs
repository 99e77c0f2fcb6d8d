//! Per-iteration artifacts under `<log_dir>/<iteration>/`.
//!
//! Each prompt/response exchange of an iteration (including corrective
//! re-prompts) is kept as `prompt.N.md` / `response.N.txt`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::document::DocumentState;
use crate::core::recovery::RecoveryTrace;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub iteration: u32,
    pub recovery: RecoveryTrace,
    pub directives: Vec<String>,
    pub executions: usize,
    pub warnings: Vec<String>,
    pub completed: bool,
    pub duration_ms: u64,
}

/// One prompt sent and the reply it got.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub state_before_path: PathBuf,
    pub state_after_path: PathBuf,
}

impl IterationPaths {
    pub fn new(log_dir: &Path, iteration: u32) -> Self {
        let dir = log_dir.join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            state_before_path: dir.join("state.before.json"),
            state_after_path: dir.join("state.after.json"),
            dir,
        }
    }

    pub fn prompt_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("prompt.{n}.md"))
    }

    pub fn response_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("response.{n}.txt"))
    }
}

pub struct IterationWriteRequest<'a> {
    pub log_dir: &'a Path,
    pub meta: &'a IterationMeta,
    pub exchanges: &'a [Exchange],
    pub state_before: &'a DocumentState,
    pub state_after: &'a DocumentState,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<IterationPaths> {
    let paths = IterationPaths::new(request.log_dir, request.meta.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    for (n, exchange) in request.exchanges.iter().enumerate() {
        write_text(&paths.prompt_path(n + 1), &exchange.prompt)?;
        write_text(&paths.response_path(n + 1), &exchange.response)?;
    }
    write_json(&paths.meta_path, request.meta)?;
    write_json(&paths.state_before_path, request.state_before)?;
    write_json(&paths.state_after_path, request.state_after)?;

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
