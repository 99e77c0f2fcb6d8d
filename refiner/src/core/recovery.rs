//! Recovery controller: escalation tiers for responses that cannot be applied.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::directive::Directive;
use crate::core::document::DocumentState;
use crate::core::naming::NamingPolicy;
use crate::core::parser::ParseFailure;
use crate::core::store::ApplyError;

const UNPARSED_SECTION: &str = "Unparsed_Response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "tier", content = "attempt", rename_all = "snake_case")]
pub enum RecoveryTier {
    #[default]
    Normal,
    /// Corrective re-prompt number `n`, starting at 1.
    Correcting(u32),
    /// Maximally simplified prompt.
    Fallback,
    /// Raw response is stored verbatim.
    GiveUp,
}

impl RecoveryTier {
    pub fn label(self) -> String {
        match self {
            RecoveryTier::Normal => "normal".to_string(),
            RecoveryTier::Correcting(n) => format!("correcting({n})"),
            RecoveryTier::Fallback => "fallback".to_string(),
            RecoveryTier::GiveUp => "give_up".to_string(),
        }
    }
}

/// How an iteration got to its committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryTrace {
    /// Corrective re-prompts issued (fallback included).
    pub attempts: u32,
    /// Tier in effect when the state was committed.
    pub tier: RecoveryTier,
}

/// Why a response was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Parse(ParseFailure),
    Apply(ApplyError),
}

impl Rejection {
    /// Short reason shown to the model in corrective prompts.
    pub fn describe(&self) -> String {
        match self {
            Rejection::Parse(failure) => format!(
                "{}: the response could not be parsed ({})",
                failure.reason, failure.excerpt
            ),
            Rejection::Apply(err) => format!("the directives could not be applied: {err}"),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Parse(failure) => failure.reason.as_str(),
            Rejection::Apply(_) => "apply_error",
        }
    }
}

/// Per-iteration state machine `Normal -> Correcting(1..=max) -> Fallback -> GiveUp`.
#[derive(Debug, Clone)]
pub struct RecoveryController {
    max_corrections: u32,
    tier: RecoveryTier,
    attempts: u32,
}

impl RecoveryController {
    pub fn new(max_corrections: u32) -> Self {
        Self {
            max_corrections,
            tier: RecoveryTier::Normal,
            attempts: 0,
        }
    }

    pub fn tier(&self) -> RecoveryTier {
        self.tier
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn trace(&self) -> RecoveryTrace {
        RecoveryTrace {
            attempts: self.attempts,
            tier: self.tier,
        }
    }

    /// Move to the next tier after a rejection and return it.
    pub fn escalate(&mut self, rejection: &Rejection) -> RecoveryTier {
        let next = match self.tier {
            RecoveryTier::Normal if self.max_corrections == 0 => RecoveryTier::Fallback,
            RecoveryTier::Normal => RecoveryTier::Correcting(1),
            RecoveryTier::Correcting(n) if n >= self.max_corrections => RecoveryTier::Fallback,
            RecoveryTier::Correcting(n) => RecoveryTier::Correcting(n + 1),
            RecoveryTier::Fallback | RecoveryTier::GiveUp => RecoveryTier::GiveUp,
        };
        if matches!(next, RecoveryTier::Correcting(_) | RecoveryTier::Fallback) {
            self.attempts += 1;
        }
        warn!(
            from = %self.tier.label(),
            to = %next.label(),
            reason = rejection.reason(),
            "response rejected; escalating recovery"
        );
        self.tier = next;
        next
    }
}

/// Directives that store `raw` verbatim in the first free `Unparsed_Response` section.
pub fn give_up_directives(
    state: &DocumentState,
    raw: &str,
    naming: NamingPolicy,
) -> Vec<Directive> {
    let mut n = 1;
    let name = loop {
        let candidate = if n == 1 {
            UNPARSED_SECTION.to_string()
        } else {
            format!("{UNPARSED_SECTION}_{n}")
        };
        if state.resolve(&candidate, naming).is_none() {
            break candidate;
        }
        n += 1;
    };
    vec![Directive::NewSection {
        name,
        content: raw.to_string(),
        parent: None,
        references: Vec::new(),
    }]
}
