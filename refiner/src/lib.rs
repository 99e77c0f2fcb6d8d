//! Iterative document refinement driven by a language model.
//!
//! A task starts from a single request section. Each iteration renders the
//! document and its table of contents into a prompt, parses the model's
//! tagged directives and applies them atomically, recording every transition
//! in an append-only ledger. Replies that cannot be used are recovered by
//! corrective re-prompting, so each iteration ends in a valid state.
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, document store, ToC,
//!   ledger, recovery tiers). No I/O.
//! - **[`io`]**: Side effects (model and sandbox processes, prompt templates,
//!   configuration, session files, iteration artifacts).
//!
//! [`task`] and [`looping`] coordinate the two for the CLI and for embedders.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{TaskError, TaskSnapshot};
pub use looping::{RunOutcome, StopReason, run, solve};
pub use task::{CancelFlag, StepOutcome, Task, create_task, step};
