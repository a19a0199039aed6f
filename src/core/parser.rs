//! Task file parsing and variable-reference extraction.
//!
//! Queue files are JSON or YAML, either a bare list of tasks or an object
//! with a `tasks` key. Variable references have the form
//! `$<index>.<field>[.<field>...]` and are parsed into [`VarRef`] once, when
//! a task is appended or loaded.

use super::types::*;
use regex::{Captures, Regex};
use rustc_hash::FxHashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

pub(crate) static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+)\.([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)")
        .expect("VAR_REF pattern is valid")
});

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?i:x-devonthink-item://)?[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$",
    )
    .expect("UUID pattern is valid")
});

/// A task as written in a queue file or passed to `queue add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// File-local index, used only to remap references inside the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    pub action: Action,

    #[serde(default)]
    pub params: Params,

    #[serde(default, alias = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<u32>,
}

impl TaskSpec {
    pub fn new(action: Action, params: Params) -> Self {
        Self {
            index: None,
            action,
            params,
            depends_on: Vec::new(),
        }
    }
}

/// Top-level shape of an importable queue file.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum QueueFile {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

impl QueueFile {
    pub fn into_specs(self) -> Vec<TaskSpec> {
        match self {
            Self::List(specs) | Self::Wrapped { tasks: specs } => specs,
        }
    }
}

/// JSON Schema of an importable queue file.
pub fn queue_file_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(QueueFile)
}

/// Parse task specs from JSON, falling back to YAML.
pub fn parse_task_specs(content: &str) -> Result<Vec<TaskSpec>, String> {
    match serde_json::from_str::<QueueFile>(content) {
        Ok(file) => Ok(file.into_specs()),
        Err(json_err) => match serde_yaml_ng::from_str::<QueueFile>(content) {
            Ok(file) => Ok(file.into_specs()),
            Err(yaml_err) => {
                let trimmed = content.trim_start();
                if trimmed.starts_with('[') || trimmed.starts_with('{') {
                    Err(format!("JSON parse error: {}", json_err))
                } else {
                    Err(format!("YAML parse error: {}", yaml_err))
                }
            }
        },
    }
}

/// Parse a queue file from disk.
pub fn parse_queue_file(path: &Path) -> Result<Vec<TaskSpec>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_task_specs(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

// ============================================================================
// Variable references
// ============================================================================

pub(crate) fn var_ref_from(caps: &Captures<'_>) -> Option<VarRef> {
    let task_index = caps.get(1)?.as_str().parse().ok()?;
    let field_path = caps
        .get(2)?
        .as_str()
        .split('.')
        .map(str::to_string)
        .collect();
    Some(VarRef {
        task_index,
        field_path,
    })
}

/// All references inside a string, in order of appearance.
pub fn refs_in_str(s: &str) -> Vec<VarRef> {
    VAR_REF
        .captures_iter(s)
        .filter_map(|c| var_ref_from(&c))
        .collect()
}

/// The reference if `s` consists of exactly one token.
pub fn whole_token(s: &str) -> Option<VarRef> {
    let caps = VAR_REF.captures(s)?;
    let m = caps.get(0)?;
    if m.start() == 0 && m.end() == s.len() {
        var_ref_from(&caps)
    } else {
        None
    }
}

/// True if the value is a string containing at least one reference.
pub fn is_var_ref_value(value: &serde_json::Value) -> bool {
    value.as_str().is_some_and(|s| VAR_REF.is_match(s))
}

fn collect_refs(value: &serde_json::Value, out: &mut BTreeSet<VarRef>) {
    match value {
        serde_json::Value::String(s) => out.extend(refs_in_str(s)),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// Every distinct reference in a parameter map, recursing into arrays and objects.
pub fn parse_var_refs(params: &Params) -> Vec<VarRef> {
    let mut refs = BTreeSet::new();
    for value in params.values() {
        collect_refs(value, &mut refs);
    }
    refs.into_iter().collect()
}

fn collect_malformed(value: &serde_json::Value, out: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::String(s) => out.extend(
            VAR_REF
                .captures_iter(s)
                .filter(|c| var_ref_from(c).is_none())
                .map(|c| c[0].to_string()),
        ),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_malformed(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_malformed(v, out)),
        _ => {}
    }
}

/// Tokens shaped like references whose task index is out of range.
pub fn malformed_refs(params: &Params) -> Vec<String> {
    let mut tokens = BTreeSet::new();
    for value in params.values() {
        collect_malformed(value, &mut tokens);
    }
    tokens.into_iter().collect()
}

impl Task {
    /// A pending task with its variable references parsed.
    pub fn new(index: u32, action: Action, params: Params, depends_on: Vec<u32>) -> Self {
        let refs = parse_var_refs(&params);
        Self {
            index,
            action,
            params,
            depends_on,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: None,
            finished_at: None,
            refs,
        }
    }

    /// Re-parse references after deserialization.
    pub fn index_refs(&mut self) {
        self.refs = parse_var_refs(&self.params);
    }
}

/// Canonical record identifier, optionally with the item-link scheme.
pub fn is_uuid(s: &str) -> bool {
    UUID.is_match(s.trim())
}

// ============================================================================
// Index remapping
// ============================================================================

fn rewrite_refs(value: &mut serde_json::Value, map: &FxHashMap<u32, u32>) {
    match value {
        serde_json::Value::String(s) if VAR_REF.is_match(s.as_str()) => {
            let rewritten = VAR_REF
                .replace_all(s.as_str(), |caps: &Captures<'_>| {
                    let original = caps[1].parse::<u32>().ok();
                    match original.and_then(|i| map.get(&i)) {
                        Some(mapped) => format!("${}.{}", mapped, &caps[2]),
                        None => caps[0].to_string(),
                    }
                })
                .into_owned();
            *s = rewritten;
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(|v| rewrite_refs(v, map)),
        serde_json::Value::Object(obj) => obj.values_mut().for_each(|v| rewrite_refs(v, map)),
        _ => {}
    }
}

/// Rewrite file-local indices to the indices the tasks will receive.
///
/// A spec's file index is its explicit `index`, else its 1-based position.
/// References to indices not defined in the file are left untouched and
/// refer to tasks already in the queue.
pub fn remap_specs(specs: Vec<TaskSpec>, first_index: u32) -> Result<Vec<TaskSpec>, String> {
    let mut map: FxHashMap<u32, u32> = FxHashMap::default();
    for (pos, spec) in specs.iter().enumerate() {
        let offset = u32::try_from(pos).map_err(|_| "too many tasks in one file".to_string())?;
        let file_index = spec.index.unwrap_or(offset + 1);
        if map.insert(file_index, first_index + offset).is_some() {
            return Err(format!("duplicate task index {} in file", file_index));
        }
    }

    Ok(specs
        .into_iter()
        .map(|mut spec| {
            spec.index = None;
            spec.depends_on = spec
                .depends_on
                .iter()
                .map(|d| map.get(d).copied().unwrap_or(*d))
                .collect();
            for value in spec.params.values_mut() {
                rewrite_refs(value, &map);
            }
            spec
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parser_refs_nested() {
        let p = params(&[
            ("uuid", json!("$1.uuid")),
            ("comment", json!("from $2.name and $1.uuid")),
            ("extra", json!({"inner": ["$3.record.0.id"]})),
            ("count", json!(4)),
        ]);
        let refs = parse_var_refs(&p);
        let shown: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        assert_eq!(shown, vec!["$1.uuid", "$2.name", "$3.record.0.id"]);
    }

    #[test]
    fn test_parser_no_refs_in_prices() {
        let p = params(&[("name", json!("costs $5 each")), ("q", json!("$.x"))]);
        assert!(parse_var_refs(&p).is_empty());
    }

    #[test]
    fn test_parser_malformed_index() {
        let p = params(&[
            ("uuid", json!("$99999999999.uuid")),
            ("comment", json!("copy of $01.name")),
        ]);
        assert_eq!(malformed_refs(&p), vec!["$99999999999.uuid"]);
        let shown: Vec<String> = parse_var_refs(&p).iter().map(|r| r.to_string()).collect();
        assert_eq!(shown, vec!["$1.name"]);
    }

    #[test]
    fn test_parser_whole_token() {
        assert_eq!(
            whole_token("$12.uuid"),
            Some(VarRef {
                task_index: 12,
                field_path: vec!["uuid".into()]
            })
        );
        assert!(whole_token("see $12.uuid").is_none());
        assert!(whole_token("$12.uuid!").is_none());
    }

    #[test]
    fn test_parser_is_uuid() {
        assert!(is_uuid("6A1B2C3D-0000-4E5F-8A9B-0123456789AB"));
        assert!(is_uuid("x-devonthink-item://6a1b2c3d-0000-4e5f-8a9b-0123456789ab"));
        assert!(!is_uuid("6A1B2C3D-0000-4E5F-8A9B"));
        assert!(!is_uuid("Inbox"));
    }

    #[test]
    fn test_parser_list_json() {
        let specs = parse_task_specs(
            r#"[{"action":"create","params":{"name":"A","type":"markdown","database":"Inbox"}},
                {"action":"modify","params":{"uuid":"$1.uuid","comment":"x"},"dependsOn":[1]}]"#,
        )
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].action, Action::Modify);
        assert_eq!(specs[1].depends_on, vec![1]);
    }

    #[test]
    fn test_parser_wrapped_yaml() {
        let yaml = r#"
tasks:
  - action: tag.add
    params:
      uuid: "$1.uuid"
      tags: [inbox, review]
    depends_on: [1]
"#;
        let specs = parse_task_specs(yaml).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].action, Action::TagAdd);
        assert_eq!(specs[0].params["tags"], json!(["inbox", "review"]));
        assert_eq!(specs[0].depends_on, vec![1]);
    }

    #[test]
    fn test_parser_unknown_action_rejected() {
        let err = parse_task_specs(r#"[{"action":"explode"}]"#).unwrap_err();
        assert!(err.contains("JSON parse error"), "{}", err);
    }

    #[test]
    fn test_parser_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.yaml");
        std::fs::write(&path, "- action: search\n  params: {query: invoices}\n").unwrap();
        let specs = parse_queue_file(&path).unwrap();
        assert_eq!(specs[0].action, Action::Search);
        assert!(parse_queue_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_parser_remap_positions() {
        let specs = parse_task_specs(
            r#"[{"action":"create","params":{"name":"A","type":"txt","database":"Inbox"}},
                {"action":"tag.add","params":{"uuid":"$1.uuid","tags":["t"]},"dependsOn":[1]},
                {"action":"link","params":{"source":"$1.uuid","target":"$7.uuid"}}]"#,
        )
        .unwrap();
        let remapped = remap_specs(specs, 10).unwrap();
        assert_eq!(remapped[1].params["uuid"], json!("$10.uuid"));
        assert_eq!(remapped[1].depends_on, vec![10]);
        assert_eq!(remapped[2].params["source"], json!("$10.uuid"));
        // not defined in the file: refers to an existing task
        assert_eq!(remapped[2].params["target"], json!("$7.uuid"));
    }

    #[test]
    fn test_parser_remap_explicit_indices() {
        let specs = parse_task_specs(
            r#"[{"index":5,"action":"create","params":{"name":"A","type":"txt","database":"D"}},
                {"index":9,"action":"delete","params":{"uuid":"$5.uuid"},"dependsOn":[5]}]"#,
        )
        .unwrap();
        let remapped = remap_specs(specs, 3).unwrap();
        assert_eq!(remapped[1].params["uuid"], json!("$3.uuid"));
        assert_eq!(remapped[1].depends_on, vec![3]);
        assert!(remapped.iter().all(|s| s.index.is_none()));
    }

    #[test]
    fn test_parser_remap_duplicate_index() {
        let specs = vec![
            TaskSpec {
                index: Some(2),
                ..TaskSpec::new(Action::Search, Params::new())
            },
            TaskSpec {
                index: Some(2),
                ..TaskSpec::new(Action::Search, Params::new())
            },
        ];
        assert!(remap_specs(specs, 1).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_parser_schema_mentions_actions() {
        let schema = serde_json::to_string(&queue_file_schema()).unwrap();
        assert!(schema.contains("tag.merge"));
        assert!(schema.contains("dependsOn"));
    }
}
