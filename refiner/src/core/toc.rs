//! Table-of-contents synthesis from a document state.

use serde::{Deserialize, Serialize};

use crate::core::document::{DocumentState, Section};

const PREVIEW_CHARS: usize = 50;
const EMPTY_TOC: &str = "No content sections available yet.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TocOrdering {
    #[default]
    CreationOrder,
    Alphabetical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub section_id: String,
    pub name: String,
    pub preview_text: String,
    pub has_content: bool,
}

/// Build the ToC for `state`. Pure: the same state always yields the same entries.
pub fn synthesize(state: &DocumentState, ordering: TocOrdering) -> Vec<TocEntry> {
    let mut sections: Vec<&Section> = state.sections_in_creation_order();
    if ordering == TocOrdering::Alphabetical {
        sections.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
    }
    sections.into_iter().map(entry_for).collect()
}

fn entry_for(section: &Section) -> TocEntry {
    let has_content = !section.content.is_empty();
    let preview_text = if has_content {
        preview(&section.content.render())
    } else {
        String::new()
    };
    TocEntry {
        section_id: section.id.clone(),
        name: section.name.clone(),
        preview_text,
        has_content,
    }
}

fn preview(text: &str) -> String {
    let first = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if first.chars().count() > PREVIEW_CHARS {
        let cut: String = first.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        first.to_string()
    }
}

/// Prompt rendering of a ToC: one `- [Id] Name: preview` line per entry.
pub fn render_toc(entries: &[TocEntry]) -> String {
    if entries.is_empty() {
        return EMPTY_TOC.to_string();
    }
    entries
        .iter()
        .map(|entry| {
            let mut line = format!("- [{}] {}", entry.section_id, entry.name);
            if entry.has_content {
                line.push_str(": ");
                line.push_str(&entry.preview_text);
            } else {
                line.push_str(" (empty)");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
