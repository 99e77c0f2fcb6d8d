//! Tag parser: raw model text to an ordered list of directives.
//!
//! The grammar is a fixed set of XML-like blocks. Prose between blocks is
//! ignored; anything that looks like a directive but cannot be read is
//! reported, never dropped.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::directive::{Directive, EditMode};

static OPEN_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<([A-Za-z][A-Za-z0-9_\-]*)((?:\s+[A-Za-z_][A-Za-z0-9_\-]*\s*=\s*"[^"]*")*)\s*(/?)>"#,
    )
    .expect("open tag pattern should compile")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_\-]*)\s*=\s*"([^"]*)""#)
        .expect("attribute pattern should compile")
});

const KNOWN_TAGS: &[&str] = &[
    "new_section",
    "modify_section",
    "update_section",
    "append_section",
    "set_focus",
    "execute",
    "complete",
    "status",
    "delete_section",
    "move_section",
];

const EXCERPT_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailureReason {
    /// No recognized directive block in the response.
    MissingMarker,
    /// A recognized block is unclosed or lacks a required attribute/body.
    MalformedBlock,
    /// A directive-shaped tag outside the grammar.
    UnknownTag,
    /// `complete` appeared next to other directives.
    ConflictingDirectives,
}

impl ParseFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseFailureReason::MissingMarker => "missing_marker",
            ParseFailureReason::MalformedBlock => "malformed_block",
            ParseFailureReason::UnknownTag => "unknown_tag",
            ParseFailureReason::ConflictingDirectives => "conflicting_directives",
        }
    }
}

impl fmt::Display for ParseFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response that could not be fully read.
///
/// `partial` holds the directives that did parse, in textual order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {excerpt}")]
pub struct ParseFailure {
    pub reason: ParseFailureReason,
    pub excerpt: String,
    pub partial: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub reason: ParseFailureReason,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parsed {
    pub directives: Vec<Directive>,
    pub warnings: Vec<ParseWarning>,
}

/// Parse a model response into directives.
pub fn parse_response(text: &str) -> Result<Parsed, ParseFailure> {
    let mut directives = Vec::new();
    let mut failures: Vec<(ParseFailureReason, String)> = Vec::new();
    let mut cursor = 0;

    while let Some(caps) = OPEN_TAG_RE.captures_at(text, cursor) {
        let Some(whole) = caps.get(0) else {
            break;
        };
        let raw_tag = caps.get(1).map_or("", |m| m.as_str());
        let tag = raw_tag.to_ascii_lowercase();
        let attrs = parse_attrs(caps.get(2).map_or("", |m| m.as_str()));
        let self_closing = caps.get(3).is_some_and(|m| m.as_str() == "/");

        if !KNOWN_TAGS.contains(&tag.as_str()) {
            if looks_like_directive(&tag, &attrs) {
                failures.push((ParseFailureReason::UnknownTag, excerpt(text, whole.start())));
            }
            cursor = whole.end();
            continue;
        }

        let (body, next) = if self_closing {
            (Some(""), whole.end())
        } else {
            match find_closing(text, whole.end(), &tag) {
                Some((body_end, close_end)) => (Some(&text[whole.end()..body_end]), close_end),
                None => (None, whole.end()),
            }
        };

        match build_directive(&tag, &attrs, body) {
            Ok(Some(directive)) => {
                debug!(tag = %tag, "parsed directive");
                directives.push(directive);
            }
            Ok(None) => {}
            Err(problem) => failures.push((
                ParseFailureReason::MalformedBlock,
                format!("{problem}: {}", excerpt(text, whole.start())),
            )),
        }
        cursor = next;
    }

    if let Some((reason, excerpt)) = failures.into_iter().next() {
        debug!(%reason, partial = directives.len(), "response rejected");
        return Err(ParseFailure {
            reason,
            excerpt,
            partial: directives,
        });
    }

    if directives.is_empty() {
        let excerpt = if text.trim().is_empty() {
            "(empty response)".to_string()
        } else {
            excerpt(text, 0)
        };
        return Err(ParseFailure {
            reason: ParseFailureReason::MissingMarker,
            excerpt,
            partial: Vec::new(),
        });
    }

    let mut warnings = Vec::new();
    if let Some(pos) = directives.iter().position(Directive::is_complete)
        && directives.len() > 1
    {
        let complete = directives.remove(pos);
        let discarded = directives
            .iter()
            .map(Directive::describe)
            .collect::<Vec<_>>();
        warn!(
            discarded = discarded.len(),
            "complete short-circuits co-occurring directives"
        );
        warnings.push(ParseWarning {
            reason: ParseFailureReason::ConflictingDirectives,
            message: format!(
                "complete discarded {} co-occurring directive(s): {}",
                discarded.len(),
                discarded.join(", ")
            ),
        });
        directives = vec![complete];
    }

    Ok(Parsed {
        directives,
        warnings,
    })
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2)?.as_str().to_string();
            Some((key, value))
        })
        .collect()
}

/// Unknown tags only count as directives when they look like one.
///
/// Echoed document blocks (`<Plan parent="...">`) and ordinary markup pass
/// through as prose.
fn looks_like_directive(tag: &str, attrs: &[(String, String)]) -> bool {
    tag.ends_with("_section") || attrs.iter().any(|(key, _)| key == "name" || key == "id")
}

/// Locate `</tag>` after `from`, returning (body end, close end).
///
/// A second opening of the same tag before the close means the first block
/// was never closed.
fn find_closing(text: &str, from: usize, tag: &str) -> Option<(usize, usize)> {
    let rest = text[from..].to_ascii_lowercase();
    let close = format!("</{tag}>");
    let at = rest.find(&close)?;
    if contains_open_tag(&rest[..at], tag) {
        return None;
    }
    Some((from + at, from + at + close.len()))
}

fn contains_open_tag(lowered: &str, tag: &str) -> bool {
    let open = format!("<{tag}");
    lowered.match_indices(&open).any(|(idx, _)| {
        matches!(
            lowered[idx + open.len()..].chars().next(),
            Some(c) if c.is_whitespace() || c == '>' || c == '/'
        )
    })
}

fn build_directive(
    tag: &str,
    attrs: &[(String, String)],
    body: Option<&str>,
) -> Result<Option<Directive>, String> {
    let attr = |key: &str| {
        attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    };
    let body_text = || body.map(str::trim).filter(|b| !b.is_empty());
    let require_body = || body.ok_or_else(|| format!("<{tag}> is missing </{tag}>"));

    let directive = match tag {
        "new_section" => {
            let content = require_body()?;
            let name = attr("name").ok_or("new_section requires a name attribute")?;
            Directive::NewSection {
                name: name.to_string(),
                content: content.trim().to_string(),
                parent: attr("parent").map(str::to_string),
                references: split_list(attr("refs").or(attr("references"))),
            }
        }
        "modify_section" | "update_section" | "append_section" => {
            let content = require_body()?;
            let id = attr("id")
                .or(attr("name"))
                .ok_or_else(|| format!("{tag} requires an id attribute"))?;
            let mode = if tag == "append_section" {
                EditMode::Append
            } else {
                EditMode::Replace
            };
            Directive::ModifySection {
                id: id.to_string(),
                content: content.trim().to_string(),
                mode,
            }
        }
        "set_focus" | "delete_section" => {
            let id = attr("id")
                .or(attr("name"))
                .or_else(body_text)
                .ok_or_else(|| format!("{tag} requires an id"))?
                .to_string();
            if tag == "set_focus" {
                Directive::SetFocus { id }
            } else {
                Directive::DeleteSection { id }
            }
        }
        "move_section" => {
            let id = attr("id")
                .or(attr("name"))
                .ok_or("move_section requires an id attribute")?;
            let parent = attr("parent").ok_or("move_section requires a parent attribute")?;
            Directive::MoveSection {
                id: id.to_string(),
                parent: parent.to_string(),
            }
        }
        "execute" => {
            let code = dedent(require_body()?);
            if code.trim().is_empty() {
                return Err("execute block is empty".to_string());
            }
            Directive::Execute {
                code,
                into: attr("into").or(attr("section")).map(str::to_string),
            }
        }
        "complete" => Directive::Complete {
            final_answer: require_body()?.trim().to_string(),
        },
        "status" => {
            if !require_body()?.trim().eq_ignore_ascii_case("done") {
                return Ok(None);
            }
            Directive::Complete {
                final_answer: String::new(),
            }
        }
        other => return Err(format!("unsupported tag <{other}>")),
    };
    Ok(Some(directive))
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Strip surrounding blank lines and the common indentation of code bodies.
fn dedent(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return String::new();
    };
    let last = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .unwrap_or(first);
    let lines = &lines[first..=last];
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                ""
            } else {
                l.get(indent..).unwrap_or_else(|| l.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt(text: &str, start: usize) -> String {
    let tail = &text[start..];
    let mut out: String = tail.chars().take(EXCERPT_CHARS).collect();
    if tail.chars().count() > EXCERPT_CHARS {
        out.push_str("...");
    }
    out.trim().to_string()
}
