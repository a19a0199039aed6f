//! docqueue: task queue execution engine for document-management automation.
//!
//! Dependency-ordered, variable-binding, verifiable. Tasks are persisted in
//! a locked store, validated and verified before they run, and dispatched
//! through an external action command. BLAKE3 fingerprints and a JSONL event
//! log record what ran.

pub mod actions;
pub mod cli;
pub mod core;
pub mod provenance;
pub mod transport;
