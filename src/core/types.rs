//! Queue data model: tasks, actions, variable references, reports, events.
//!
//! All persisted types derive Serialize/Deserialize so the queue store can be
//! written as JSON or YAML. Task keys use camelCase on the wire (`dependsOn`).

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Action-specific parameters, order-preserving.
pub type Params = IndexMap<String, serde_json::Value>;

/// Output fields of a completed task.
pub type ResultMap = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Actions
// ============================================================================

/// Operation kind dispatched to the action executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum Action {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "move")]
    Move,
    #[serde(rename = "modify")]
    Modify,
    #[serde(rename = "replicate")]
    Replicate,
    #[serde(rename = "duplicate")]
    Duplicate,
    #[serde(rename = "convert")]
    Convert,
    #[serde(rename = "tag.add")]
    TagAdd,
    #[serde(rename = "tag.remove")]
    TagRemove,
    #[serde(rename = "tag.merge")]
    TagMerge,
    #[serde(rename = "tag.rename")]
    TagRename,
    #[serde(rename = "tag.delete")]
    TagDelete,
    #[serde(rename = "link")]
    Link,
    #[serde(rename = "unlink")]
    Unlink,
    #[serde(rename = "organize")]
    Organize,
    #[serde(rename = "summarize")]
    Summarize,
    #[serde(rename = "search")]
    Search,
}

impl Action {
    pub const ALL: [Action; 17] = [
        Action::Create,
        Action::Delete,
        Action::Move,
        Action::Modify,
        Action::Replicate,
        Action::Duplicate,
        Action::Convert,
        Action::TagAdd,
        Action::TagRemove,
        Action::TagMerge,
        Action::TagRename,
        Action::TagDelete,
        Action::Link,
        Action::Unlink,
        Action::Organize,
        Action::Summarize,
        Action::Search,
    ];

    /// Wire name (`tag.merge`, `create`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Modify => "modify",
            Self::Replicate => "replicate",
            Self::Duplicate => "duplicate",
            Self::Convert => "convert",
            Self::TagAdd => "tag.add",
            Self::TagRemove => "tag.remove",
            Self::TagMerge => "tag.merge",
            Self::TagRename => "tag.rename",
            Self::TagDelete => "tag.delete",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::Organize => "organize",
            Self::Summarize => "summarize",
            Self::Search => "search",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown action '{}' (expected one of: {})",
                    s,
                    Self::ALL
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Lifecycle state of a task. Mutated only by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A parsed `$<index>.<field>[.<field>...]` token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarRef {
    /// Index of the task whose result is read
    pub task_index: u32,

    /// Path into that task's result (object keys or array positions)
    pub field_path: Vec<String>,
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{}", self.task_index, self.field_path.join("."))
    }
}

/// One queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// 1-based, stable, assigned at append time
    pub index: u32,

    /// Handler selector
    pub action: Action,

    /// Action-specific parameters; may hold variable references
    #[serde(default)]
    pub params: Params,

    /// Explicit precondition edges (strictly earlier indices)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<u32>,

    /// Lifecycle state
    #[serde(default)]
    pub status: TaskStatus,

    /// Output fields, present once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,

    /// Failure message, present once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the task was appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    /// When the task reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,

    /// Variable references found in `params`, parsed on append/load
    #[serde(skip)]
    pub refs: Vec<VarRef>,
}

impl Task {
    /// Explicit `dependsOn` edges unioned with implicit variable-reference edges.
    pub fn dependencies(&self) -> BTreeSet<u32> {
        self.depends_on
            .iter()
            .copied()
            .chain(self.refs.iter().map(|r| r.task_index))
            .collect()
    }
}

// ============================================================================
// Queue
// ============================================================================

/// How the executor schedules and reacts to failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Topological order, one at a time; failures poison dependents only
    #[default]
    Sequential,
    /// Waves of ready tasks on a bounded worker pool
    Parallel,
    /// Sequential, halting at the first failure
    Transactional,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Transactional => write!(f, "transactional"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "transactional" => Ok(Self::Transactional),
            other => Err(format!(
                "unknown mode '{}' (expected sequential, parallel or transactional)",
                other
            )),
        }
    }
}

/// Which tasks `clear` removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    #[default]
    Completed,
    Failed,
    All,
}

impl ClearScope {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            Self::Completed => status == TaskStatus::Completed,
            Self::Failed => status == TaskStatus::Failed,
            Self::All => true,
        }
    }
}

impl fmt::Display for ClearScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for ClearScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown scope '{}' (expected completed, failed or all)",
                other
            )),
        }
    }
}

/// The ordered task list plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    /// Store schema version
    #[serde(default = "default_version")]
    pub version: String,

    /// When the queue was first created
    #[serde(default)]
    pub created_at: Option<String>,

    /// Mode used when `execute` is not given one
    #[serde(default)]
    pub default_mode: ExecutionMode,

    /// Next index to hand out; retired indices are never reused
    #[serde(default = "default_next_index")]
    pub next_index: u32,

    /// Tasks in index order
    #[serde(default)]
    pub tasks: Vec<Task>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_next_index() -> u32 {
    1
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            version: default_version(),
            created_at: None,
            default_mode: ExecutionMode::default(),
            next_index: default_next_index(),
            tasks: Vec::new(),
        }
    }
}

impl Queue {
    pub fn get(&self, index: u32) -> Option<&Task> {
        self.position(index).map(|pos| &self.tasks[pos])
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Task> {
        self.position(index).map(move |pos| &mut self.tasks[pos])
    }

    /// Tasks stay sorted by index, so lookup is a binary search.
    pub fn position(&self, index: u32) -> Option<usize> {
        self.tasks.binary_search_by_key(&index, |t| t.index).ok()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

// ============================================================================
// Live references
// ============================================================================

/// Kind of external entity a parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// Record or group addressed by UUID
    Record,
    /// Database addressed by name
    Database,
    /// Group addressed by `/path`, optionally within a database
    GroupPath,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record => write!(f, "record"),
            Self::Database => write!(f, "database"),
            Self::GroupPath => write!(f, "group path"),
        }
    }
}

/// A reference to live external state, checked by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: RefKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(db) => write!(f, "{} '{}' in database '{}'", self.kind, self.value, db),
            None => write!(f, "{} '{}'", self.kind, self.value),
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// A single finding from validation or verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Task the finding belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_index: Option<u32>,

    /// Error family (structural, cyclic_dependency, verification, ...)
    pub kind: String,

    pub message: String,
}

/// Outcome of structural validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Issue>,
    /// BLAKE3 fingerprint of the validated task list
    pub fingerprint: String,
}

/// Distinct references looked up by the live verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedCounts {
    pub identifiers: u32,
    pub paths: u32,
    pub databases: u32,
}

/// Outcome of live verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub valid: bool,
    pub checked: CheckedCounts,
    /// Variable references that cannot be checked until their source runs
    pub skipped: u32,
    pub issues: Vec<Issue>,
    pub fingerprint: String,
}

/// Per-task line of a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub index: u32,
    pub action: Action,
    pub status: TaskStatus,
    /// Wave the task was (or would be) dispatched in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave: Option<usize>,
    /// Params after variable substitution (as far as resolvable)
    pub params: Params,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Failed without dispatch because a dependency did not complete
    #[serde(default)]
    pub poisoned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub completed: u32,
    pub failed: u32,
    /// Participating tasks still pending when the run ended
    pub skipped: u32,
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub dry_run: bool,
    /// True only if no task ended failed
    pub success: bool,
    /// Transactional mode: the failing task that stopped dispatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<u32>,
    pub summary: RunSummary,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    /// Every participating task reached a terminal state.
    pub fn drained(&self) -> bool {
        self.summary.skipped == 0
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    TasksAppended {
        indices: Vec<u32>,
    },
    RunStarted {
        run_id: String,
        mode: ExecutionMode,
        tasks: usize,
        docqueue_version: String,
    },
    TaskStarted {
        run_id: String,
        index: u32,
        action: Action,
    },
    TaskCompleted {
        run_id: String,
        index: u32,
        duration_ms: u64,
    },
    TaskFailed {
        run_id: String,
        index: u32,
        error: String,
    },
    TaskPoisoned {
        run_id: String,
        index: u32,
        error: String,
    },
    RunCompleted {
        run_id: String,
        completed: u32,
        failed: u32,
        skipped: u32,
        total_ms: u64,
    },
    QueueCleared {
        scope: ClearScope,
        removed: Vec<u32>,
    },
    TasksReset {
        indices: Vec<u32>,
    },
    RepairApplied {
        base_fingerprint: String,
        retired: Vec<u32>,
        appended: Vec<u32>,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: QueueEvent,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_action_wire_names() {
        let json = serde_json::to_string(&Action::TagMerge).unwrap();
        assert_eq!(json, "\"tag.merge\"");
        let a: Action = serde_json::from_str("\"tag.add\"").unwrap();
        assert_eq!(a, Action::TagAdd);
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
    }

    #[test]
    fn test_types_action_parse_unknown() {
        let err = "teleport".parse::<Action>().unwrap_err();
        assert!(err.contains("unknown action"));
        assert!(err.contains("tag.rename"));
    }

    #[test]
    fn test_types_task_camel_case() {
        let json = r#"{"index":2,"action":"modify","params":{"uuid":"$1.uuid"},"dependsOn":[1]}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.index, 2);
        assert_eq!(task.depends_on, vec![1]);
        assert_eq!(task.status, TaskStatus::Pending);
        let out = serde_json::to_string(&task).unwrap();
        assert!(out.contains("\"dependsOn\":[1]"));
        assert!(!out.contains("result"));
    }

    #[test]
    fn test_types_dependencies_union() {
        let mut task: Task = serde_json::from_str(
            r#"{"index":5,"action":"link","params":{},"dependsOn":[1,3]}"#,
        )
        .unwrap();
        task.refs = vec![
            VarRef {
                task_index: 3,
                field_path: vec!["uuid".into()],
            },
            VarRef {
                task_index: 4,
                field_path: vec!["uuid".into()],
            },
        ];
        let deps: Vec<u32> = task.dependencies().into_iter().collect();
        assert_eq!(deps, vec![1, 3, 4]);
    }

    #[test]
    fn test_types_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "PENDING");
        assert_eq!(TaskStatus::Failed.to_string(), "FAILED");
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_types_mode_and_scope_parse() {
        assert_eq!(
            "Parallel".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Parallel
        );
        assert!("eventually".parse::<ExecutionMode>().is_err());
        assert_eq!("all".parse::<ClearScope>().unwrap(), ClearScope::All);
        assert!(ClearScope::Failed.matches(TaskStatus::Failed));
        assert!(!ClearScope::Completed.matches(TaskStatus::Pending));
    }

    #[test]
    fn test_types_queue_defaults() {
        let q: Queue = serde_json::from_str("{}").unwrap();
        assert_eq!(q.version, "1.0");
        assert_eq!(q.next_index, 1);
        assert_eq!(q.default_mode, ExecutionMode::Sequential);
        assert!(q.tasks.is_empty());
    }

    #[test]
    fn test_types_var_ref_display() {
        let r = VarRef {
            task_index: 7,
            field_path: vec!["record".into(), "uuid".into()],
        };
        assert_eq!(r.to_string(), "$7.record.uuid");
    }

    #[test]
    fn test_types_event_serde() {
        let event = QueueEvent::TaskPoisoned {
            run_id: "r-abc".to_string(),
            index: 3,
            error: "dependency failed".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"task_poisoned\""));
        assert!(json.contains("\"index\":3"));
    }
}
