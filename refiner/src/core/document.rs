//! Document state: sections in an id-indexed map plus a separate relation table.
//!
//! Sections never point at each other directly. Parent/child and reference
//! links live in [`RelationGraph`], keyed by section id, so snapshots are plain
//! values that clone, compare and serialize without cycles.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::execution::ExecutionRecord;
use crate::core::naming::{NamingPolicy, normalized_key};

/// Id of the root section holding the raw request.
pub const ROOT_SECTION_ID: &str = "User_Request";

/// The request a task was created for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub request: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionContent {
    Text { text: String },
    Execution(ExecutionRecord),
    Task(TaskDescriptor),
}

impl SectionContent {
    pub fn text(text: impl Into<String>) -> Self {
        SectionContent::Text { text: text.into() }
    }

    /// Plain-text rendering for prompts and previews.
    pub fn render(&self) -> String {
        match self {
            SectionContent::Text { text } => text.clone(),
            SectionContent::Execution(record) => record.render(),
            SectionContent::Task(task) => task.request.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SectionContent::Text { text } => text.trim().is_empty(),
            SectionContent::Execution(_) => false,
            SectionContent::Task(task) => task.request.trim().is_empty(),
        }
    }

    /// Append text on a new line. Non-text content is flattened to text first.
    pub fn append(&mut self, extra: &str) {
        let mut text = if self.is_empty() {
            String::new()
        } else {
            self.render()
        };
        if !text.is_empty() && !extra.is_empty() {
            text.push('\n');
        }
        text.push_str(extra);
        *self = SectionContent::Text { text };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub name: String,
    pub content: SectionContent,
    pub created_at_iteration: u32,
    /// Creation counter; breaks ties between sections created in one iteration.
    pub seq: u64,
}

/// Parent/child edges plus undirected-in-meaning cross references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationGraph {
    #[serde(default)]
    pub children: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub references: BTreeMap<String, BTreeSet<String>>,
}

impl RelationGraph {
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|(_, kids)| kids.contains(id))
            .map(|(parent, _)| parent.as_str())
    }

    pub fn children_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(id)
            .into_iter()
            .flat_map(|kids| kids.iter().map(String::as_str))
    }

    /// Attach `child` under `parent`, detaching it from any previous parent.
    pub fn set_parent(&mut self, child: &str, parent: &str) {
        self.detach(child);
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
    }

    pub fn add_reference(&mut self, from: &str, to: &str) {
        self.references
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Drop every edge that mentions `id`.
    pub fn remove_section(&mut self, id: &str) {
        self.children.remove(id);
        self.references.remove(id);
        self.detach(id);
        for targets in self.references.values_mut() {
            targets.remove(id);
        }
        self.references.retain(|_, targets| !targets.is_empty());
    }

    fn detach(&mut self, child: &str) {
        for kids in self.children.values_mut() {
            kids.remove(child);
        }
        self.children.retain(|_, kids| !kids.is_empty());
    }

    /// Return a parent/child cycle as a path of ids, if one exists.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a RelationGraph,
            id: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(id.to_string());
                    return Some(path);
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            stack.push(id);
            for child in graph.children_of(id) {
                if let Some(path) = visit(graph, child, marks, stack) {
                    return Some(path);
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for parent in self.children.keys() {
            let mut stack = Vec::new();
            if let Some(path) = visit(self, parent, &mut marks, &mut stack) {
                return Some(path);
            }
        }
        None
    }
}

/// Immutable snapshot of the document at one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub sections: BTreeMap<String, Section>,
    #[serde(default)]
    pub relations: RelationGraph,
    pub current_focus_id: Option<String>,
    pub iteration: u32,
    pub next_seq: u64,
}

impl DocumentState {
    /// Initial state: a single root section holding the raw request.
    pub fn initial(request: &str) -> Self {
        let root = Section {
            id: ROOT_SECTION_ID.to_string(),
            name: ROOT_SECTION_ID.to_string(),
            content: SectionContent::Task(TaskDescriptor {
                request: request.to_string(),
            }),
            created_at_iteration: 0,
            seq: 0,
        };
        let mut sections = BTreeMap::new();
        sections.insert(root.id.clone(), root);
        Self {
            sections,
            relations: RelationGraph::default(),
            current_focus_id: None,
            iteration: 0,
            next_seq: 1,
        }
    }

    pub fn section(&self, id: &str) -> Option<&Section> {
        self.sections.get(id)
    }

    /// Resolve a directive's section reference to an existing id.
    ///
    /// Exact ids always match. Under the normalizing policy a reference also
    /// matches a section whose name normalizes to the same key.
    pub fn resolve(&self, reference: &str, policy: NamingPolicy) -> Option<&str> {
        let reference = reference.trim();
        if let Some(section) = self.sections.get(reference) {
            return Some(section.id.as_str());
        }
        match policy {
            NamingPolicy::Strict => self
                .sections
                .values()
                .find(|s| s.name == reference)
                .map(|s| s.id.as_str()),
            NamingPolicy::CaseInsensitiveNormalize => {
                let key = normalized_key(reference);
                self.sections
                    .values()
                    .find(|s| normalized_key(&s.name) == key)
                    .map(|s| s.id.as_str())
            }
        }
    }

    /// Find a section whose name collides with `name` under `policy`.
    pub fn find_by_name(&self, name: &str, policy: NamingPolicy) -> Option<&Section> {
        let key = policy.key(name);
        self.sections.values().find(|s| policy.key(&s.name) == key)
    }

    /// Sections in creation order.
    pub fn sections_in_creation_order(&self) -> Vec<&Section> {
        let mut ordered: Vec<&Section> = self.sections.values().collect();
        ordered.sort_by_key(|s| (s.created_at_iteration, s.seq));
        ordered
    }

    /// Text form fed to the model: one `<Id>…</Id>` block per section.
    pub fn to_text_form(&self) -> String {
        self.sections_in_creation_order()
            .into_iter()
            .map(|section| {
                let mut attrs = String::new();
                if let Some(parent) = self.relations.parent_of(&section.id) {
                    attrs.push_str(&format!(" parent=\"{parent}\""));
                }
                if self.current_focus_id.as_deref() == Some(section.id.as_str()) {
                    attrs.push_str(" focus=\"true\"");
                }
                format!(
                    "<{id}{attrs}>\n{body}\n</{id}>",
                    id = section.id,
                    body = section.content.render().trim_end()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
