//! Engine configuration stored as `refiner.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::naming::NamingPolicy;
use crate::core::store::{ApplyOptions, DuplicatePolicy};
use crate::core::toc::TocOrdering;

/// Engine configuration (TOML).
///
/// Edited by humans between runs; the engine never rewrites it while a task
/// is running. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefinerConfig {
    /// Prepended to every normal and corrective prompt.
    pub system_prompt: String,

    pub section_naming_policy: NamingPolicy,

    /// What a `new_section` naming an existing section does.
    pub duplicate_sections: DuplicatePolicy,

    /// Corrective re-prompts before falling back to the minimal prompt.
    pub max_correction_attempts: u32,

    /// Iterations `run` performs before stopping.
    pub max_iterations: u32,

    pub toc_ordering: TocOrdering,

    /// Extra attempts for a failing model call before the task fails.
    pub max_provider_retries: u32,

    /// Wall-clock budget per iteration in seconds (model calls + executions).
    /// Running out is terminal for the step; it is not retried like a
    /// provider timeout.
    pub iteration_timeout_secs: u64,

    /// Prompts above this many bytes drop optional sections, then truncate.
    pub prompt_budget_bytes: usize,

    pub model: ModelConfig,

    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command receiving the prompt on stdin (e.g. `["llm", "-m", "gpt-4o"]`).
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter receiving code on stdin. Empty disables execution.
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "-".to_string()],
            output_limit_bytes: 50_000,
        }
    }
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a careful analyst who builds up a structured document \
                            until the request is answered."
                .to_string(),
            section_naming_policy: NamingPolicy::default(),
            duplicate_sections: DuplicatePolicy::default(),
            max_correction_attempts: 2,
            max_iterations: 20,
            toc_ordering: TocOrdering::default(),
            max_provider_retries: 2,
            iteration_timeout_secs: 10 * 60,
            prompt_budget_bytes: 60_000,
            model: ModelConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RefinerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.prompt_budget_bytes < 1_024 {
            return Err(anyhow!("prompt_budget_bytes must be >= 1024"));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.model.command.first().is_some_and(|p| p.trim().is_empty()) {
            return Err(anyhow!("model.command must start with a program name"));
        }
        if self.sandbox.command.first().is_some_and(|p| p.trim().is_empty()) {
            return Err(anyhow!("sandbox.command must start with a program name"));
        }
        Ok(())
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            naming: self.section_naming_policy,
            duplicates: self.duplicate_sections,
        }
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RefinerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RefinerConfig> {
    if !path.exists() {
        let cfg = RefinerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RefinerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &RefinerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write via a sibling temp file and rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
