//! Error taxonomy for the queue engine.
//!
//! `QueueError` covers per-task failures (structural, graph, resolution,
//! execution). These are reported as data; only the store and engine errors
//! abort a command.

use super::types::{Issue, ValidationReport};
use std::path::PathBuf;
use thiserror::Error;

/// Per-task error, one variant per kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("task {index}: {message}")]
    Structural { index: u32, message: String },

    #[error("task {index}: cyclic dependency ({})", fmt_cycle(.cycle))]
    CyclicDependency { index: u32, cycle: Vec<u32> },

    #[error("task {index}: forward reference to task {target} (dependencies must point to earlier tasks)")]
    ForwardReference { index: u32, target: u32 },

    #[error("task {index}: depends on unknown task {target}")]
    UnknownTask { index: u32, target: u32 },

    #[error("task {index}: unresolved reference {reference}: {reason}")]
    UnresolvedReference {
        index: u32,
        reference: String,
        reason: String,
    },

    #[error("task {index}: {message}")]
    Execution { index: u32, message: String },
}

fn fmt_cycle(cycle: &[u32]) -> String {
    cycle
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl QueueError {
    /// Stable kind name used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Structural { .. } | Self::UnknownTask { .. } => "structural",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::ForwardReference { .. } => "forward_reference",
            Self::UnresolvedReference { .. } => "unresolved_reference",
            Self::Execution { .. } => "execution",
        }
    }

    pub fn task_index(&self) -> u32 {
        match self {
            Self::Structural { index, .. }
            | Self::CyclicDependency { index, .. }
            | Self::ForwardReference { index, .. }
            | Self::UnknownTask { index, .. }
            | Self::UnresolvedReference { index, .. }
            | Self::Execution { index, .. } => *index,
        }
    }

    /// Message without the `task N:` prefix.
    pub fn detail(&self) -> String {
        let full = self.to_string();
        let prefix = format!("task {}: ", self.task_index());
        full.strip_prefix(&prefix).map(str::to_string).unwrap_or(full)
    }

    pub fn to_issue(&self) -> Issue {
        Issue {
            task_index: Some(self.task_index()),
            kind: self.kind().to_string(),
            message: self.detail(),
        }
    }
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid queue file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("store is locked by another process ({} held for {waited_ms}ms; remove it if no docqueue process is running)", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("queue changed since the proposal was made (expected fingerprint {expected}, found {actual})")]
    Stale { expected: String, actual: String },

    #[error("proposal is structurally invalid ({0} error(s))")]
    InvalidProposal(usize),

    #[error("task {index} is {status} and cannot be reset (only failed tasks can)")]
    NotResettable { index: u32, status: String },

    #[error("task {0} does not exist")]
    NoSuchTask(u32),

    #[error("import failed: {0}")]
    Import(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures that stop a run before any task is dispatched.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("queue is invalid ({} error(s)); run `docqueue queue validate` for details", .0.errors.len())]
    Invalid(ValidationReport),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker pool failure: {0}")]
    Runtime(String),
}

/// Failures talking to the reasoning service. Never fatal to the queue.
#[derive(Error, Debug)]
pub enum AdvisorError {
    #[error("environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("empty reply from reasoning service")]
    EmptyReply,

    #[error("reply did not contain a task list: {0}")]
    Unparseable(String),
}
