//! Live verification: check that referenced records, databases and group
//! paths exist before running.
//!
//! Advisory only. Lookups go through the action executor and are cached so
//! each distinct reference is checked once. Variable references cannot be
//! checked until their source runs and are counted as skipped.

use super::parser::{is_uuid, is_var_ref_value};
use super::types::*;
use crate::actions::ActionExecutor;
use crate::provenance::fingerprint::fingerprint_tasks;
use rustc_hash::FxHashMap;
use serde_json::Value;

const ITEM_SCHEME: &str = "x-devonthink-item://";

/// What one task asks the verifier to look up.
#[derive(Debug, Default, PartialEq)]
pub struct TaskRefs {
    pub refs: Vec<ResourceRef>,
    /// Checkable params holding variable references
    pub skipped: u32,
}

fn record(value: &str) -> ResourceRef {
    let trimmed = value.trim();
    let bare = trimmed.strip_prefix(ITEM_SCHEME).unwrap_or(trimmed);
    ResourceRef {
        kind: RefKind::Record,
        value: bare.to_ascii_uppercase(),
        database: None,
    }
}

impl TaskRefs {
    fn push_record(&mut self, value: Option<&Value>) {
        match value {
            Some(v) if is_var_ref_value(v) => self.skipped += 1,
            Some(Value::String(s)) if is_uuid(s) => self.refs.push(record(s)),
            _ => {}
        }
    }

    fn push_records(&mut self, value: Option<&Value>) {
        match value {
            Some(v) if is_var_ref_value(v) => self.skipped += 1,
            Some(Value::Array(items)) => items.iter().for_each(|i| self.push_record(Some(i))),
            _ => {}
        }
    }

    /// UUID or `/group/path` inside `database`.
    fn push_location(&mut self, value: Option<&Value>, database: Option<&str>) {
        match value {
            Some(v) if is_var_ref_value(v) => self.skipped += 1,
            Some(Value::String(s)) if s.starts_with('/') => self.refs.push(ResourceRef {
                kind: RefKind::GroupPath,
                value: s.clone(),
                database: database.map(str::to_string),
            }),
            other => self.push_record(other),
        }
    }

    fn push_database(&mut self, value: Option<&Value>) {
        match value {
            Some(v) if is_var_ref_value(v) => self.skipped += 1,
            Some(Value::String(s)) if !s.trim().is_empty() => self.refs.push(ResourceRef {
                kind: RefKind::Database,
                value: s.trim().to_string(),
                database: None,
            }),
            _ => {}
        }
    }
}

/// Live references named by a task's params. Tag names are not references.
pub fn collect_refs(task: &Task) -> TaskRefs {
    let p = &task.params;
    let database = p.get("database").and_then(Value::as_str);
    let mut refs = TaskRefs::default();

    refs.push_database(p.get("database"));
    match task.action {
        Action::Create => refs.push_location(p.get("group"), database),
        Action::Delete
        | Action::Modify
        | Action::Convert
        | Action::TagAdd
        | Action::TagRemove
        | Action::Organize => refs.push_record(p.get("uuid")),
        Action::Move | Action::Replicate | Action::Duplicate => {
            refs.push_record(p.get("uuid"));
            refs.push_location(p.get("destination"), database);
        }
        Action::Link | Action::Unlink => {
            refs.push_record(p.get("source"));
            refs.push_record(p.get("target"));
        }
        Action::Summarize => refs.push_records(p.get("uuids")),
        Action::Search => refs.push_location(p.get("group"), database),
        Action::TagMerge | Action::TagRename | Action::TagDelete => {}
    }
    refs
}

/// Verify every pending task's live references.
pub fn verify_queue(queue: &Queue, executor: &dyn ActionExecutor) -> VerificationReport {
    let mut cache: FxHashMap<ResourceRef, Result<bool, String>> = FxHashMap::default();
    let mut checked = CheckedCounts::default();
    let mut skipped = 0u32;
    let mut issues = Vec::new();

    for task in queue
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
    {
        let task_refs = collect_refs(task);
        skipped += task_refs.skipped;

        for reference in task_refs.refs {
            let outcome = cache.entry(reference.clone()).or_insert_with(|| {
                match reference.kind {
                    RefKind::Record => checked.identifiers += 1,
                    RefKind::Database => checked.databases += 1,
                    RefKind::GroupPath => checked.paths += 1,
                }
                tracing::debug!(%reference, "looking up");
                executor.lookup(&reference)
            });
            let message = match outcome {
                Ok(true) => continue,
                Ok(false) => format!("{} not found", reference),
                Err(e) => format!("lookup of {} failed: {}", reference, e),
            };
            issues.push(Issue {
                task_index: Some(task.index),
                kind: "verification".to_string(),
                message,
            });
        }
    }

    VerificationReport {
        valid: issues.is_empty(),
        checked,
        skipped,
        issues,
        fingerprint: fingerprint_tasks(&queue.tasks),
    }
}
