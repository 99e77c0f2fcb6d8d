//! Prompt rendering for normal, corrective and fallback iterations.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::document::{DocumentState, ROOT_SECTION_ID};
use crate::core::toc::{TocOrdering, render_toc, synthesize};

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");
const FALLBACK_TEMPLATE: &str = include_str!("prompts/fallback.md");

/// Longest slice of an offending reply quoted back to the model.
const RESPONSE_EXCERPT_CHARS: usize = 2_000;
const TRUNCATION_NOTE: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker regex")
});

/// Which prompt an iteration sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptKind {
    Step,
    Correction {
        attempt: u32,
        reason: String,
        response: String,
    },
    Fallback,
}

/// Everything a template may show, captured from one committed state.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub system_prompt: String,
    pub request: String,
    pub document: String,
    pub toc: String,
    pub focus: Option<String>,
    pub iteration: u32,
    pub max_iterations: Option<u32>,
    /// Warnings and recovery notes carried over from the previous iteration.
    pub notes: Option<String>,
}

impl PromptInputs {
    pub fn from_state(state: &DocumentState, system_prompt: &str, ordering: TocOrdering) -> Self {
        Self {
            system_prompt: system_prompt.trim().to_string(),
            request: state
                .section(ROOT_SECTION_ID)
                .map(|s| s.content.render())
                .unwrap_or_default(),
            document: state.to_text_form(),
            toc: render_toc(&synthesize(state, ordering)),
            focus: state.current_focus_id.clone(),
            iteration: state.iteration + 1,
            max_iterations: None,
            notes: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: Option<u32>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes.filter(|n| !n.trim().is_empty());
        self
    }
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("step", STEP_TEMPLATE)
            .expect("step template should be valid");
        env.add_template("correction", CORRECTION_TEMPLATE)
            .expect("correction template should be valid");
        env.add_template("fallback", FALLBACK_TEMPLATE)
            .expect("fallback template should be valid");
        Self { env }
    }

    fn render(&self, kind: &PromptKind, input: &PromptInputs) -> Result<String> {
        let rendered = match kind {
            PromptKind::Step => self.env.get_template("step")?.render(context! {
                system_prompt => input.system_prompt,
                request => input.request.trim(),
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                focus => input.focus,
                notes => input.notes.as_deref().map(str::trim),
                toc => input.toc,
                document => input.document,
            })?,
            PromptKind::Correction {
                attempt,
                reason,
                response,
            } => self.env.get_template("correction")?.render(context! {
                system_prompt => input.system_prompt,
                attempt => attempt,
                reason => reason,
                response => excerpt(response, RESPONSE_EXCERPT_CHARS),
                request => input.request.trim(),
                toc => input.toc,
                document => input.document,
            })?,
            PromptKind::Fallback => self.env.get_template("fallback")?.render(context! {
                request => input.request.trim(),
            })?,
        };
        Ok(rendered)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Drop droppable sections (notes, then toc, then document) until the prompt
/// fits, then truncate the last section.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["notes", "toc", "document"] {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let bytes_dropped = sections[idx].content.len();
            debug!(section = key, bytes_dropped, "dropped section for budget");
            sections.remove(idx);
        }
    }

    let used = total(sections);
    if used <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(used - last.content.len());
    let before_len = last.content.len();
    if allowed > TRUNCATION_NOTE.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATION_NOTE.len());
        last.content.push_str(TRUNCATION_NOTE);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{cut}{TRUNCATION_NOTE}")
}

/// Renders prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, kind: &PromptKind, input: &PromptInputs) -> Result<String> {
        let rendered = PromptEngine::new()
            .render(kind, input)
            .context("render prompt template")?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
