//! Session persistence: ledger + execution context as one JSON file,
//! validated against the bundled schema and the document invariants on load.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::execution::ExecutionContext;
use crate::core::history::HistoryLedger;
use crate::core::invariants::validate_invariants;
use crate::io::config::write_atomic;

const SESSION_SCHEMA: &str = include_str!("../../schemas/session.schema.json");

static SESSION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(SESSION_SCHEMA).expect("bundled session schema is JSON");
    validator_for(&schema).expect("bundled session schema compiles")
});

/// Everything needed to resume a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    pub ledger: HistoryLedger,
    pub context: ExecutionContext,
    #[serde(default)]
    pub completion: Option<String>,
}

/// Schema errors for `value`, empty when valid.
pub fn schema_errors(value: &Value) -> Vec<String> {
    SESSION_VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect()
}

/// Semantic problems in a decoded session, empty when sound.
pub fn session_errors(session: &SessionFile) -> Vec<String> {
    let mut errors = session.ledger.validate();
    let initial = session.ledger.initial_state();
    errors.extend(
        validate_invariants(initial)
            .into_iter()
            .map(|e| format!("initial state: {e}")),
    );
    for entry in session.ledger.entries() {
        errors.extend(
            validate_invariants(&entry.state)
                .into_iter()
                .map(|e| format!("iteration {}: {e}", entry.iteration)),
        );
    }
    errors
}

/// Load a session, rejecting files that fail schema or invariant checks.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_session(path: &Path) -> Result<SessionFile> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;

    let errors = schema_errors(&value);
    if !errors.is_empty() {
        return Err(anyhow!(
            "session schema validation failed: {}",
            errors.join("; ")
        ));
    }
    let session: SessionFile = serde_json::from_value(value)
        .with_context(|| format!("deserialize session {}", path.display()))?;

    let errors = session_errors(&session);
    if !errors.is_empty() {
        return Err(anyhow!("session invariants failed: {}", errors.join("; ")));
    }
    debug!(entries = session.ledger.len(), "session loaded");
    Ok(session)
}

/// Atomically write a session.
#[instrument(skip_all, fields(path = %path.display(), entries = session.ledger.len()))]
pub fn write_session(path: &Path, session: &SessionFile) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::DocumentState;
    use crate::test_support::{history_entry, state_with_sections};

    fn session() -> SessionFile {
        let initial = DocumentState::initial("Calculate 2+2");
        let mut ledger = HistoryLedger::new(initial);
        ledger.append(history_entry(
            state_with_sections(&[("Plan", "add")]),
            "<new_section name=\"Plan\">add</new_section>",
        ));
        SessionFile {
            ledger,
            context: ExecutionContext {
                blocks: vec!["x = 2".into()],
                transcript: String::new(),
            },
            completion: None,
        }
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        let original = session();
        write_session(&path, &original).expect("write");
        let loaded = load_session(&path).expect("load");
        assert_eq!(loaded, original);
    }

    #[test]
    fn schema_rejects_missing_fields() {
        let value = serde_json::json!({
            "ledger": {"entries": []},
            "context": {"blocks": [], "transcript": ""}
        });
        let errors = schema_errors(&value);
        assert!(!errors.is_empty());
    }

    #[test]
    fn load_rejects_invariant_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        let mut broken = session();
        let mut value = serde_json::to_value(&broken).expect("to value");
        value["ledger"]["entries"][0]["state"]["current_focus_id"] = Value::from("Ghost");
        fs::write(&path, value.to_string()).expect("write");
        let err = load_session(&path).unwrap_err();
        assert!(format!("{err:#}").contains("focus 'Ghost'"), "{err:#}");

        broken.completion = Some("4".into());
        assert!(session_errors(&broken).is_empty());
    }
}
