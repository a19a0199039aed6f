//! Structural validation of a queue.
//!
//! Checks per-action required params and the dependency graph of every
//! pending or running task. Completed and failed tasks are history and are
//! not re-validated. Never mutates the queue.

use super::error::QueueError;
use super::parser::{is_uuid, is_var_ref_value, malformed_refs};
use super::resolver::DependencyGraph;
use super::types::*;
use crate::provenance::fingerprint::fingerprint_tasks;
use serde_json::Value;

pub const RECORD_TYPES: &[&str] = &[
    "markdown",
    "txt",
    "rtf",
    "html",
    "bookmark",
    "group",
    "formatted-note",
    "sheet",
];

pub const CONVERT_FORMATS: &[&str] = &["markdown", "txt", "rtf", "html", "pdf", "webarchive"];

const MODIFY_FIELDS: &[&str] = &[
    "name", "comment", "label", "rating", "flag", "aliases", "url", "unread",
];

/// Validate the whole queue.
pub fn validate_queue(queue: &Queue) -> ValidationReport {
    let mut errors: Vec<QueueError> = queue
        .tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .flat_map(validate_task)
        .collect();
    errors.extend(DependencyGraph::from_queue(queue).check(queue));
    errors.sort_by_key(|e| e.task_index());

    ValidationReport {
        valid: errors.is_empty(),
        errors: errors.iter().map(QueueError::to_issue).collect(),
        fingerprint: fingerprint_tasks(&queue.tasks),
    }
}

struct Checker<'a> {
    task: &'a Task,
    errors: Vec<QueueError>,
}

impl<'a> Checker<'a> {
    fn fail(&mut self, message: String) {
        self.errors.push(QueueError::Structural {
            index: self.task.index,
            message,
        });
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.task.params.get(key).filter(|v| !v.is_null())
    }

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Present and, unless it is a variable reference, a non-empty string.
    fn require_str(&mut self, key: &str) -> Option<&'a str> {
        match self.get(key) {
            None => {
                self.fail(format!("{} requires '{}'", self.task.action, key));
                None
            }
            Some(v) if is_var_ref_value(v) => None,
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
            Some(_) => {
                self.fail(format!("'{}' must be a non-empty string", key));
                None
            }
        }
    }

    fn require_uuid(&mut self, key: &str) {
        if let Some(s) = self.require_str(key) {
            if !is_uuid(s) {
                self.fail(format!("'{}' is not a record identifier: {}", key, s));
            }
        }
    }

    /// Record identifier or `/group/path`.
    fn require_location(&mut self, key: &str) {
        if let Some(s) = self.require_str(key) {
            if !is_uuid(s) && !s.starts_with('/') {
                self.fail(format!(
                    "'{}' must be a record identifier or a /group/path: {}",
                    key, s
                ));
            }
        }
    }

    fn require_one_of(&mut self, key: &str, allowed: &[&str]) {
        if let Some(s) = self.require_str(key) {
            if !allowed.contains(&s) {
                self.fail(format!(
                    "'{}' must be one of {}, got '{}'",
                    key,
                    allowed.join(", "),
                    s
                ));
            }
        }
    }

    fn require_list(&mut self, key: &str) {
        match self.get(key) {
            None => self.fail(format!("{} requires '{}'", self.task.action, key)),
            Some(v) if is_var_ref_value(v) => {}
            Some(Value::Array(items)) if items.is_empty() => {
                self.fail(format!("'{}' must not be empty", key))
            }
            Some(Value::Array(items)) => {
                if items
                    .iter()
                    .any(|i| !matches!(i.as_str(), Some(s) if !s.trim().is_empty()))
                {
                    self.fail(format!("'{}' must contain only non-empty strings", key));
                }
            }
            Some(_) => self.fail(format!("'{}' must be a list", key)),
        }
    }

    fn require_distinct(&mut self, a: &str, b: &str) {
        let (Some(x), Some(y)) = (self.get(a), self.get(b)) else {
            return;
        };
        if !is_var_ref_value(x) && x == y {
            self.fail(format!("'{}' and '{}' must differ", a, b));
        }
    }
}

/// Per-action parameter contract for one task.
pub fn validate_task(task: &Task) -> Vec<QueueError> {
    let mut c = Checker {
        task,
        errors: Vec::new(),
    };

    match task.action {
        Action::Create => {
            c.require_str("name");
            c.require_one_of("type", RECORD_TYPES);
            if c.has("group") {
                c.require_uuid("group");
            } else if !c.has("database") {
                c.fail("create requires 'database' or a 'group'".to_string());
            } else {
                c.require_str("database");
            }
        }
        Action::Delete | Action::Organize => c.require_uuid("uuid"),
        Action::Move | Action::Replicate | Action::Duplicate => {
            c.require_uuid("uuid");
            c.require_location("destination");
        }
        Action::Modify => {
            c.require_uuid("uuid");
            if !MODIFY_FIELDS.iter().any(|f| c.has(f)) {
                c.fail(format!(
                    "modify requires at least one of {}",
                    MODIFY_FIELDS.join(", ")
                ));
            }
        }
        Action::Convert => {
            c.require_uuid("uuid");
            c.require_one_of("format", CONVERT_FORMATS);
        }
        Action::TagAdd | Action::TagRemove => {
            c.require_uuid("uuid");
            c.require_list("tags");
        }
        Action::TagMerge => {
            c.require_str("target");
            c.require_list("sources");
        }
        Action::TagRename => {
            c.require_str("from");
            c.require_str("to");
            c.require_distinct("from", "to");
        }
        Action::TagDelete => {
            c.require_str("tag");
        }
        Action::Link | Action::Unlink => {
            c.require_uuid("source");
            c.require_uuid("target");
            c.require_distinct("source", "target");
        }
        Action::Summarize => c.require_list("uuids"),
        Action::Search => {
            c.require_str("query");
        }
    }

    for token in malformed_refs(&task.params) {
        c.fail(format!("reference {} has an out-of-range task index", token));
    }

    c.errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const U1: &str = "6A1B2C3D-0000-4E5F-8A9B-0123456789AB";
    const U2: &str = "7B1B2C3D-0000-4E5F-8A9B-0123456789AB";

    fn task(index: u32, action: Action, params: serde_json::Value) -> Task {
        Task::new(index, action, serde_json::from_value(params).unwrap(), vec![])
    }

    fn errors(action: Action, params: serde_json::Value) -> Vec<String> {
        validate_task(&task(1, action, params))
            .iter()
            .map(|e| e.detail())
            .collect()
    }

    #[test]
    fn test_validator_create_contract() {
        assert!(errors(
            Action::Create,
            json!({"name": "Note", "type": "markdown", "database": "Inbox"})
        )
        .is_empty());
        assert!(errors(
            Action::Create,
            json!({"name": "Note", "type": "txt", "group": U1})
        )
        .is_empty());
        let e = errors(Action::Create, json!({"name": "Note", "type": "markdown"}));
        assert_eq!(e, vec!["create requires 'database' or a 'group'"]);
        let e = errors(
            Action::Create,
            json!({"name": "Note", "type": "docx", "database": "Inbox"}),
        );
        assert!(e[0].contains("'type' must be one of"));
    }

    #[test]
    fn test_validator_missing_param() {
        let e = errors(Action::Delete, json!({}));
        assert_eq!(e, vec!["delete requires 'uuid'"]);
    }

    #[test]
    fn test_validator_uuid_shape() {
        let e = errors(Action::Delete, json!({"uuid": "not-a-uuid"}));
        assert!(e[0].contains("not a record identifier"));
        let linked = format!("x-devonthink-item://{}", U1);
        assert!(errors(Action::Delete, json!({ "uuid": linked })).is_empty());
    }

    #[test]
    fn test_validator_var_ref_satisfies_shape() {
        assert!(errors(Action::Delete, json!({"uuid": "$1.uuid"})).is_empty());
        assert!(errors(Action::Summarize, json!({"uuids": "$1.results"})).is_empty());
        assert!(errors(
            Action::Move,
            json!({"uuid": "$1.uuid", "destination": "$2.uuid"})
        )
        .is_empty());
    }

    #[test]
    fn test_validator_out_of_range_index() {
        let e = errors(Action::Delete, json!({"uuid": "$99999999999.uuid"}));
        assert_eq!(e, vec!["reference $99999999999.uuid has an out-of-range task index"]);
        let e = errors(
            Action::Modify,
            json!({"uuid": U1, "comment": "see $4294967296.name"}),
        );
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn test_validator_move_destination() {
        assert!(errors(
            Action::Move,
            json!({"uuid": U1, "destination": "/Archive/2024"})
        )
        .is_empty());
        let e = errors(Action::Move, json!({"uuid": U1, "destination": "Archive"}));
        assert!(e[0].contains("/group/path"));
    }

    #[test]
    fn test_validator_modify_needs_field() {
        let e = errors(Action::Modify, json!({"uuid": U1}));
        assert!(e[0].starts_with("modify requires at least one of"));
        assert!(errors(Action::Modify, json!({"uuid": U1, "rating": 3})).is_empty());
    }

    #[test]
    fn test_validator_tag_lists() {
        assert!(errors(Action::TagAdd, json!({"uuid": U1, "tags": ["a"]})).is_empty());
        let e = errors(Action::TagAdd, json!({"uuid": U1, "tags": []}));
        assert_eq!(e, vec!["'tags' must not be empty"]);
        let e = errors(Action::TagRemove, json!({"uuid": U1, "tags": "a"}));
        assert_eq!(e, vec!["'tags' must be a list"]);
        let e = errors(Action::TagMerge, json!({"target": "a", "sources": ["b", 3]}));
        assert_eq!(e, vec!["'sources' must contain only non-empty strings"]);
    }

    #[test]
    fn test_validator_distinct_pairs() {
        let e = errors(Action::TagRename, json!({"from": "x", "to": "x"}));
        assert_eq!(e, vec!["'from' and 'to' must differ"]);
        let e = errors(Action::Link, json!({"source": U1, "target": U1}));
        assert_eq!(e, vec!["'source' and 'target' must differ"]);
        assert!(errors(Action::Unlink, json!({"source": U1, "target": U2})).is_empty());
    }

    #[test]
    fn test_validator_search_and_convert() {
        let e = errors(Action::Search, json!({"query": "  "}));
        assert_eq!(e, vec!["'query' must be a non-empty string"]);
        assert!(errors(Action::Convert, json!({"uuid": U1, "format": "pdf"})).is_empty());
        assert!(!errors(Action::Convert, json!({"uuid": U1, "format": "docx"})).is_empty());
    }

    #[test]
    fn test_validator_queue_report() {
        let queue = Queue {
            next_index: 4,
            tasks: vec![
                task(1, Action::Search, json!({"query": "q"})),
                task(2, Action::Delete, json!({"uuid": "$3.uuid"})),
                task(3, Action::Delete, json!({})),
            ],
            ..Queue::default()
        };
        let report = validate_queue(&queue);
        assert!(!report.valid);
        let kinds: Vec<(Option<u32>, &str)> = report
            .errors
            .iter()
            .map(|i| (i.task_index, i.kind.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![(Some(2), "forward_reference"), (Some(3), "structural")]
        );
        assert!(report.fingerprint.starts_with("blake3:"));
    }

    #[test]
    fn test_validator_repeatable() {
        let queue = Queue {
            next_index: 5,
            tasks: vec![
                task(1, Action::Search, json!({"query": "q"})),
                task(2, Action::Delete, json!({"uuid": "$4.uuid"})),
                task(3, Action::TagAdd, json!({"uuid": U1, "tags": []})),
                task(4, Action::Link, json!({"source": U1, "target": U1})),
            ],
            ..Queue::default()
        };
        let before = queue.clone();
        let first = validate_queue(&queue);
        let second = validate_queue(&queue);
        assert!(!first.valid);
        assert_eq!(first, second);
        assert_eq!(queue, before);
    }

    #[test]
    fn test_validator_skips_history() {
        let mut bad = task(1, Action::Delete, json!({}));
        bad.status = TaskStatus::Failed;
        let queue = Queue {
            next_index: 2,
            tasks: vec![bad],
            ..Queue::default()
        };
        assert!(validate_queue(&queue).valid);
    }
}
