//! Structured edit instructions extracted from a model response.

use serde::{Deserialize, Serialize};

/// How `ModifySection` combines new content with the existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    #[default]
    Replace,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    NewSection {
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<String>,
    },
    ModifySection {
        id: String,
        content: String,
        #[serde(default)]
        mode: EditMode,
    },
    SetFocus {
        id: String,
    },
    Execute {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    Complete {
        final_answer: String,
    },
    DeleteSection {
        id: String,
    },
    MoveSection {
        id: String,
        parent: String,
    },
}

impl Directive {
    /// Tag name as it appears in the response grammar.
    pub fn tag(&self) -> &'static str {
        match self {
            Directive::NewSection { .. } => "new_section",
            Directive::ModifySection {
                mode: EditMode::Replace,
                ..
            } => "modify_section",
            Directive::ModifySection {
                mode: EditMode::Append,
                ..
            } => "append_section",
            Directive::SetFocus { .. } => "set_focus",
            Directive::Execute { .. } => "execute",
            Directive::Complete { .. } => "complete",
            Directive::DeleteSection { .. } => "delete_section",
            Directive::MoveSection { .. } => "move_section",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Directive::Complete { .. })
    }

    /// Short human-readable label for prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            Directive::NewSection { name, .. } => format!("new_section \"{name}\""),
            Directive::ModifySection { id, .. } => format!("{} \"{id}\"", self.tag()),
            Directive::SetFocus { id } => format!("set_focus \"{id}\""),
            Directive::Execute { into, .. } => match into {
                Some(target) => format!("execute into \"{target}\""),
                None => "execute".to_string(),
            },
            Directive::Complete { .. } => "complete".to_string(),
            Directive::DeleteSection { id } => format!("delete_section \"{id}\""),
            Directive::MoveSection { id, parent } => {
                format!("move_section \"{id}\" under \"{parent}\"")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_form_is_tagged_by_kind() {
        let directive = Directive::NewSection {
            name: "Plan".to_string(),
            content: "one".to_string(),
            parent: None,
            references: Vec::new(),
        };
        let json = serde_json::to_string(&directive).expect("serialize");
        assert_eq!(json, r#"{"kind":"new_section","name":"Plan","content":"one"}"#);
    }

    #[test]
    fn append_mode_reports_append_tag() {
        let directive = Directive::ModifySection {
            id: "Plan".to_string(),
            content: String::new(),
            mode: EditMode::Append,
        };
        assert_eq!(directive.tag(), "append_section");
    }
}
