//! Deterministic, pure logic of the refinement engine.
//!
//! Core modules are free of I/O side effects. Code execution is reached only
//! through the [`execution::CodeRunner`] seam so the store stays testable.

pub mod budget;
pub mod directive;
pub mod document;
pub mod execution;
pub mod history;
pub mod invariants;
pub mod naming;
pub mod parser;
pub mod recovery;
pub mod store;
pub mod toc;
