//! Document store: applies a directive batch to a state, all or nothing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::directive::{Directive, EditMode};
use crate::core::document::{DocumentState, ROOT_SECTION_ID, Section, SectionContent};
use crate::core::execution::{CodeRunner, ExecutionRecord};
use crate::core::invariants::InvariantViolation;
use crate::core::naming::{NamingPolicy, section_id};

/// Section that receives a non-empty `complete` answer.
pub const FINAL_ANSWER_ID: &str = "Final_Answer";

/// What a `NewSection` does when its name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Append the new content to the existing section.
    #[default]
    Append,
    /// Replace the existing section's content.
    Replace,
    /// Reject the batch.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOptions {
    pub naming: NamingPolicy,
    pub duplicates: DuplicatePolicy,
}

/// Reasons a batch is rejected. Everything except `Fatal` is recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("section '{0}' does not exist")]
    UnknownSection(String),
    #[error("section '{name}' already exists as '{existing}'")]
    DuplicateSection { name: String, existing: String },
    #[error("section name must not be empty")]
    EmptyName,
    #[error("section '{0}' holds the request and cannot be changed")]
    ProtectedSection(String),
    #[error("section '{id}' still has children: {children}")]
    HasChildren { id: String, children: String },
    #[error(transparent)]
    Fatal(#[from] InvariantViolation),
}

impl ApplyError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplyError::Fatal(_))
    }
}

/// Result of an accepted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub state: DocumentState,
    /// Executions in appearance order.
    pub executions: Vec<ExecutionRecord>,
    /// Final answer when the batch contained `complete`.
    pub completion: Option<String>,
}

/// Apply `directives` to `prev`, producing the next state.
///
/// `prev` is never touched; any rejected directive discards the whole batch.
/// `Execute` directives are handed to `runner` in appearance order. An
/// `Execute` without `into` gets its own `Execution_*` section, and its
/// rendered record is also appended to the next section the batch creates or
/// modifies.
pub fn apply<R: CodeRunner + ?Sized>(
    prev: &DocumentState,
    directives: &[Directive],
    options: &ApplyOptions,
    runner: &mut R,
) -> Result<Applied, ApplyError> {
    let mut txn = Transaction {
        state: prev.clone(),
        options: *options,
        executions: Vec::new(),
        unfolded: Vec::new(),
        completion: None,
    };
    txn.state.iteration = prev.iteration + 1;

    for directive in directives {
        debug!(directive = %directive.describe(), "applying directive");
        txn.apply_one(directive, runner)?;
    }

    if let Some(path) = txn.state.relations.find_cycle() {
        return Err(InvariantViolation::Cycle { path }.into());
    }

    Ok(Applied {
        state: txn.state,
        executions: txn.executions,
        completion: txn.completion,
    })
}

struct Transaction {
    state: DocumentState,
    options: ApplyOptions,
    executions: Vec<ExecutionRecord>,
    /// Rendered records still waiting for a section to land in.
    unfolded: Vec<String>,
    completion: Option<String>,
}

impl Transaction {
    fn apply_one<R: CodeRunner + ?Sized>(
        &mut self,
        directive: &Directive,
        runner: &mut R,
    ) -> Result<(), ApplyError> {
        match directive {
            Directive::NewSection {
                name,
                content,
                parent,
                references,
            } => self.new_section(name, content, parent.as_deref(), references),
            Directive::ModifySection { id, content, mode } => {
                let id = self.resolve(id)?;
                self.edit(&id, content, *mode)?;
                self.fold_executions(&id);
                Ok(())
            }
            Directive::SetFocus { id } => {
                self.state.current_focus_id = Some(self.resolve(id)?);
                Ok(())
            }
            Directive::Execute { code, into } => self.execute(code, into.as_deref(), runner),
            Directive::Complete { final_answer } => {
                if !final_answer.trim().is_empty() {
                    self.upsert_final_answer(final_answer)?;
                }
                self.completion = Some(final_answer.clone());
                Ok(())
            }
            Directive::DeleteSection { id } => self.delete(id),
            Directive::MoveSection { id, parent } => {
                let id = self.resolve(id)?;
                let parent = self.resolve(parent)?;
                self.state.relations.set_parent(&id, &parent);
                Ok(())
            }
        }
    }

    fn resolve(&self, reference: &str) -> Result<String, ApplyError> {
        self.state
            .resolve(reference, self.options.naming)
            .map(str::to_string)
            .ok_or_else(|| ApplyError::UnknownSection(reference.trim().to_string()))
    }

    fn new_section(
        &mut self,
        name: &str,
        content: &str,
        parent: Option<&str>,
        references: &[String],
    ) -> Result<(), ApplyError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApplyError::EmptyName);
        }

        if let Some(existing) = self.state.find_by_name(name, self.options.naming) {
            let existing = existing.id.clone();
            return match self.options.duplicates {
                DuplicatePolicy::Reject => Err(ApplyError::DuplicateSection {
                    name: name.to_string(),
                    existing,
                }),
                DuplicatePolicy::Append => {
                    debug!(%name, %existing, "folding duplicate section by append");
                    self.edit(&existing, content, EditMode::Append)?;
                    self.link(&existing, parent, references)?;
                    self.fold_executions(&existing);
                    Ok(())
                }
                DuplicatePolicy::Replace => {
                    debug!(%name, %existing, "folding duplicate section by replace");
                    self.edit(&existing, content, EditMode::Replace)?;
                    self.link(&existing, parent, references)?;
                    self.fold_executions(&existing);
                    Ok(())
                }
            };
        }

        let id = section_id(name);
        if let Some(clash) = self.state.sections.get(&id) {
            return Err(InvariantViolation::IdCollision {
                id,
                existing: clash.name.clone(),
                incoming: name.to_string(),
            }
            .into());
        }

        // Validate links before inserting so a bad reference leaves no section behind.
        let parent = parent.map(|p| self.resolve(p)).transpose()?;
        let references = references
            .iter()
            .map(|r| self.resolve(r))
            .collect::<Result<Vec<_>, _>>()?;

        self.insert_section(&id, name, SectionContent::text(content));
        if let Some(parent) = parent {
            self.state.relations.set_parent(&id, &parent);
        }
        for target in references {
            self.state.relations.add_reference(&id, &target);
        }
        self.fold_executions(&id);
        Ok(())
    }

    fn link(
        &mut self,
        id: &str,
        parent: Option<&str>,
        references: &[String],
    ) -> Result<(), ApplyError> {
        if let Some(parent) = parent {
            let parent = self.resolve(parent)?;
            self.state.relations.set_parent(id, &parent);
        }
        for reference in references {
            let target = self.resolve(reference)?;
            self.state.relations.add_reference(id, &target);
        }
        Ok(())
    }

    fn insert_section(&mut self, id: &str, name: &str, content: SectionContent) {
        let section = Section {
            id: id.to_string(),
            name: name.to_string(),
            content,
            created_at_iteration: self.state.iteration,
            seq: self.state.next_seq,
        };
        self.state.next_seq += 1;
        self.state.sections.insert(id.to_string(), section);
    }

    fn edit(&mut self, id: &str, content: &str, mode: EditMode) -> Result<(), ApplyError> {
        if id == ROOT_SECTION_ID {
            return Err(ApplyError::ProtectedSection(id.to_string()));
        }
        let Some(section) = self.state.sections.get_mut(id) else {
            return Err(ApplyError::UnknownSection(id.to_string()));
        };
        match mode {
            EditMode::Replace => section.content = SectionContent::text(content),
            EditMode::Append => section.content.append(content),
        }
        Ok(())
    }

    fn fold_executions(&mut self, id: &str) {
        if self.unfolded.is_empty() {
            return;
        }
        let Some(section) = self.state.sections.get_mut(id) else {
            return;
        };
        debug!(section = %id, records = self.unfolded.len(), "folding execution output");
        for rendered in self.unfolded.drain(..) {
            section.content.append(&rendered);
        }
    }

    fn execute<R: CodeRunner + ?Sized>(
        &mut self,
        code: &str,
        into: Option<&str>,
        runner: &mut R,
    ) -> Result<(), ApplyError> {
        // Resolve the target first so a bad reference never runs code.
        let target = into.map(|t| self.resolve(t)).transpose()?;
        if let Some(target) = target.as_deref()
            && target == ROOT_SECTION_ID
        {
            return Err(ApplyError::ProtectedSection(target.to_string()));
        }
        let record = runner.run(code);

        match target {
            Some(target) => self.edit(&target, &record.render(), EditMode::Append)?,
            None => {
                let id = self.next_execution_id();
                self.insert_section(&id, &id, SectionContent::Execution(record.clone()));
                if let Some(focus) = self.state.current_focus_id.clone() {
                    self.state.relations.set_parent(&id, &focus);
                }
                self.unfolded.push(record.render());
            }
        }
        self.executions.push(record);
        Ok(())
    }

    fn next_execution_id(&self) -> String {
        let mut n = self.executions.len();
        loop {
            let id = format!("Execution_{}_{}", self.state.iteration, n);
            if !self.state.sections.contains_key(&id) {
                return id;
            }
            n += 1;
        }
    }

    fn upsert_final_answer(&mut self, answer: &str) -> Result<(), ApplyError> {
        if self.state.sections.contains_key(FINAL_ANSWER_ID) {
            self.edit(FINAL_ANSWER_ID, answer, EditMode::Replace)
        } else {
            self.insert_section(FINAL_ANSWER_ID, FINAL_ANSWER_ID, SectionContent::text(answer));
            Ok(())
        }
    }

    fn delete(&mut self, reference: &str) -> Result<(), ApplyError> {
        let id = self.resolve(reference)?;
        if id == ROOT_SECTION_ID {
            return Err(ApplyError::ProtectedSection(id));
        }
        let children: Vec<&str> = self.state.relations.children_of(&id).collect();
        if !children.is_empty() {
            return Err(ApplyError::HasChildren {
                children: children.join(", "),
                id,
            });
        }
        self.state.sections.remove(&id);
        self.state.relations.remove_section(&id);
        if self.state.current_focus_id.as_deref() == Some(id.as_str()) {
            self.state.current_focus_id = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execution::NoExecution;
    use crate::core::invariants::validate_invariants;
    use crate::test_support::{RecordingRunner, state_with_sections};

    fn new_section(name: &str, content: &str) -> Directive {
        Directive::NewSection {
            name: name.to_string(),
            content: content.to_string(),
            parent: None,
            references: Vec::new(),
        }
    }

    fn apply_with(
        prev: &DocumentState,
        directives: &[Directive],
        duplicates: DuplicatePolicy,
        naming: NamingPolicy,
    ) -> Result<Applied, ApplyError> {
        apply(
            prev,
            directives,
            &ApplyOptions { naming, duplicates },
            &mut NoExecution,
        )
    }

    #[test]
    fn new_section_is_created_at_next_iteration() {
        let prev = DocumentState::initial("req");
        let applied = apply_with(
            &prev,
            &[new_section("Initial Analysis Plan", "a")],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("apply");
        let section = applied
            .state
            .section("Initial_Analysis_Plan")
            .expect("section");
        assert_eq!(section.name, "Initial Analysis Plan");
        assert_eq!(section.created_at_iteration, 1);
        assert_eq!(applied.state.iteration, 1);
        assert!(validate_invariants(&applied.state).is_empty());
    }

    #[test]
    fn normalized_duplicates_fold_into_one_section() {
        let prev = DocumentState::initial("req");
        let batch = [
            new_section("Plan", "first"),
            new_section("plan", "second"),
            new_section("PLAN ", "third"),
        ];

        let appended = apply_with(
            &prev,
            &batch,
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("append");
        assert_eq!(appended.state.sections.len(), 2);
        assert_eq!(
            appended.state.section("Plan").expect("plan").content.render(),
            "first\nsecond\nthird"
        );

        let replaced = apply_with(
            &prev,
            &batch,
            DuplicatePolicy::Replace,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("replace");
        assert_eq!(replaced.state.sections.len(), 2);
        assert_eq!(
            replaced.state.section("Plan").expect("plan").content.render(),
            "third"
        );
    }

    #[test]
    fn reject_policy_rejects_duplicates() {
        let prev = state_with_sections(&[("Plan", "p")]);
        let err = apply_with(
            &prev,
            &[new_section("plan", "x")],
            DuplicatePolicy::Reject,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::DuplicateSection { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn strict_id_collision_is_fatal() {
        let prev = state_with_sections(&[("Plan A", "p")]);
        let err = apply_with(
            &prev,
            &[new_section("Plan_A", "x")],
            DuplicatePolicy::Append,
            NamingPolicy::Strict,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Fatal(InvariantViolation::IdCollision { .. })
        ));
    }

    #[test]
    fn rejected_batch_leaves_prior_state_identical() {
        let prev = state_with_sections(&[("Plan", "p")]);
        let snapshot = serde_json::to_vec(&prev).expect("serialize");
        let err = apply_with(
            &prev,
            &[
                new_section("Fresh", "ok"),
                Directive::SetFocus {
                    id: "Missing".to_string(),
                },
            ],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .unwrap_err();
        assert_eq!(err, ApplyError::UnknownSection("Missing".to_string()));
        assert_eq!(serde_json::to_vec(&prev).expect("serialize"), snapshot);
    }

    #[test]
    fn forward_reference_within_batch_is_rejected() {
        let prev = DocumentState::initial("req");
        let err = apply_with(
            &prev,
            &[
                Directive::SetFocus {
                    id: "Later".to_string(),
                },
                new_section("Later", "x"),
            ],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .unwrap_err();
        assert_eq!(err, ApplyError::UnknownSection("Later".to_string()));
    }

    #[test]
    fn execute_creates_execution_section_under_focus() {
        let prev = state_with_sections(&[("Work", "")]);
        let mut runner = RecordingRunner::with_stdout("4\n");
        let applied = apply(
            &prev,
            &[
                Directive::SetFocus {
                    id: "Work".to_string(),
                },
                Directive::Execute {
                    code: "print(2+2)".to_string(),
                    into: None,
                },
            ],
            &ApplyOptions::default(),
            &mut runner,
        )
        .expect("apply");

        assert_eq!(runner.codes, vec!["print(2+2)".to_string()]);
        assert_eq!(applied.executions.len(), 1);
        let id = format!("Execution_{}_0", applied.state.iteration);
        let section = applied.state.section(&id).expect("execution section");
        assert!(matches!(section.content, SectionContent::Execution(_)));
        assert_eq!(applied.state.relations.parent_of(&id), Some("Work"));
    }

    #[test]
    fn execute_into_appends_rendered_record() {
        let prev = state_with_sections(&[("Result", "")]);
        let mut runner = RecordingRunner::with_stdout("4\n");
        let applied = apply(
            &prev,
            &[Directive::Execute {
                code: "print(2+2)".to_string(),
                into: Some("result".to_string()),
            }],
            &ApplyOptions::default(),
            &mut runner,
        )
        .expect("apply");
        let text = applied.state.section("Result").expect("result").content.render();
        assert!(text.contains("print(2+2)"));
        assert!(text.contains('4'));
    }

    #[test]
    fn execution_output_folds_into_next_written_section() {
        let prev = DocumentState::initial("Calculate 2+2");
        let mut runner = RecordingRunner::with_stdout("4\n");
        let applied = apply(
            &prev,
            &[
                Directive::Execute {
                    code: "print(2+2)".to_string(),
                    into: None,
                },
                new_section("Result", "The sum is:"),
                new_section("Notes", "unrelated"),
            ],
            &ApplyOptions::default(),
            &mut runner,
        )
        .expect("apply");

        let result = applied.state.section("Result").expect("result").content.render();
        assert!(result.starts_with("The sum is:\n"));
        assert!(result.contains("print(2+2)"));
        assert!(result.contains('4'));
        let notes = applied.state.section("Notes").expect("notes").content.render();
        assert_eq!(notes, "unrelated");
        assert!(applied.state.section("Execution_1_0").is_some());
    }

    #[test]
    fn execution_output_folds_into_modified_section() {
        let prev = state_with_sections(&[("Work", "draft")]);
        let mut runner = RecordingRunner::with_stdout("42\n");
        let applied = apply(
            &prev,
            &[
                Directive::Execute {
                    code: "print(6*7)".to_string(),
                    into: None,
                },
                Directive::ModifySection {
                    id: "Work".to_string(),
                    content: "answer below".to_string(),
                    mode: EditMode::Replace,
                },
            ],
            &ApplyOptions::default(),
            &mut runner,
        )
        .expect("apply");
        let work = applied.state.section("Work").expect("work").content.render();
        assert!(work.starts_with("answer below\n"));
        assert!(work.contains("42"));
    }

    #[test]
    fn request_section_is_protected_from_edits() {
        let prev = DocumentState::initial("Calculate 2+2");
        let attempts = [
            new_section("User Request", "my notes"),
            Directive::ModifySection {
                id: ROOT_SECTION_ID.to_string(),
                content: "something else".to_string(),
                mode: EditMode::Replace,
            },
            Directive::ModifySection {
                id: "user request".to_string(),
                content: "more".to_string(),
                mode: EditMode::Append,
            },
            Directive::Execute {
                code: "x".to_string(),
                into: Some(ROOT_SECTION_ID.to_string()),
            },
        ];
        for directive in attempts {
            for duplicates in [DuplicatePolicy::Append, DuplicatePolicy::Replace] {
                let mut runner = RecordingRunner::with_stdout("");
                let err = apply(
                    &prev,
                    std::slice::from_ref(&directive),
                    &ApplyOptions {
                        naming: NamingPolicy::CaseInsensitiveNormalize,
                        duplicates,
                    },
                    &mut runner,
                )
                .unwrap_err();
                assert_eq!(err, ApplyError::ProtectedSection(ROOT_SECTION_ID.to_string()));
                assert!(!err.is_fatal());
                assert!(runner.codes.is_empty());
            }
        }
        let root = prev.section(ROOT_SECTION_ID).expect("root");
        assert!(matches!(root.content, SectionContent::Task(_)));
    }

    #[test]
    fn punctuated_names_get_tag_safe_ids() {
        let prev = DocumentState::initial("req");
        let applied = apply_with(
            &prev,
            &[new_section("A<B", "x"), new_section("A>B", "y")],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("apply");
        let section = applied.state.section("A_B").expect("section");
        assert_eq!(section.content.render(), "x\ny");
        assert!(!applied.state.to_text_form().contains("<A<B"));
    }

    #[test]
    fn execute_into_unknown_section_never_runs_code() {
        let prev = DocumentState::initial("req");
        let mut runner = RecordingRunner::with_stdout("");
        let err = apply(
            &prev,
            &[Directive::Execute {
                code: "x".to_string(),
                into: Some("Nowhere".to_string()),
            }],
            &ApplyOptions::default(),
            &mut runner,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::UnknownSection(_)));
        assert!(runner.codes.is_empty());
    }

    #[test]
    fn delete_clears_focus_and_protects_root_and_parents() {
        let mut prev = state_with_sections(&[("A", "a"), ("B", "b")]);
        prev.relations.set_parent("B", "A");
        prev.current_focus_id = Some("B".to_string());

        let err = apply_with(
            &prev,
            &[Directive::DeleteSection {
                id: ROOT_SECTION_ID.to_string(),
            }],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::ProtectedSection(_)));

        let err = apply_with(
            &prev,
            &[Directive::DeleteSection { id: "A".to_string() }],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::HasChildren { .. }));

        let applied = apply_with(
            &prev,
            &[Directive::DeleteSection { id: "B".to_string() }],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("delete");
        assert!(applied.state.section("B").is_none());
        assert_eq!(applied.state.current_focus_id, None);
        assert!(validate_invariants(&applied.state).is_empty());
    }

    #[test]
    fn move_creating_cycle_is_fatal() {
        let mut prev = state_with_sections(&[("A", "a"), ("B", "b")]);
        prev.relations.set_parent("B", "A");
        let err = apply_with(
            &prev,
            &[Directive::MoveSection {
                id: "A".to_string(),
                parent: "B".to_string(),
            }],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::Fatal(InvariantViolation::Cycle { .. })));
    }

    #[test]
    fn complete_records_answer_section() {
        let prev = DocumentState::initial("req");
        let applied = apply_with(
            &prev,
            &[Directive::Complete {
                final_answer: "4".to_string(),
            }],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("apply");
        assert_eq!(applied.completion.as_deref(), Some("4"));
        assert_eq!(
            applied
                .state
                .section(FINAL_ANSWER_ID)
                .expect("answer")
                .content
                .render(),
            "4"
        );
    }

    #[test]
    fn new_section_links_parent_and_references() {
        let prev = state_with_sections(&[("Plan", "p"), ("Notes", "n")]);
        let applied = apply_with(
            &prev,
            &[Directive::NewSection {
                name: "Step One".to_string(),
                content: "s".to_string(),
                parent: Some("plan".to_string()),
                references: vec!["notes".to_string()],
            }],
            DuplicatePolicy::Append,
            NamingPolicy::CaseInsensitiveNormalize,
        )
        .expect("apply");
        assert_eq!(applied.state.relations.parent_of("Step_One"), Some("Plan"));
        assert!(applied.state.relations.references["Step_One"].contains("Notes"));
    }
}
