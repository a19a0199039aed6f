//! Action executor backed by an external command.
//!
//! `<command> <action>` receives the resolved params as JSON on stdin and
//! prints `{"success": bool, "result": {...}, "error": "..."}` on stdout.
//! `<command> lookup` receives `{"kind", "value", "database"}` and prints
//! `{"exists": bool}`.

use super::ActionOutcome;
use crate::core::types::{Action, Params, ResourceRef};
use crate::transport::{self, ExecOutput};
use serde::Deserialize;

/// Runs actions through the configured command.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    command: String,
}

#[derive(Deserialize)]
struct LookupReply {
    exists: bool,
}

impl ScriptExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Invoke one action. Never errors: transport problems become a failed outcome.
    pub fn run(&self, action: Action, params: &Params) -> ActionOutcome {
        let input = match serde_json::to_string(params) {
            Ok(s) => s,
            Err(e) => return ActionOutcome::failed(format!("cannot encode params: {}", e)),
        };
        tracing::debug!(command = %self.command, %action, "invoking action command");
        match transport::run_command(&self.command, &[action.as_str()], &input) {
            Ok(out) => parse_outcome(&out),
            Err(e) => ActionOutcome::failed(e),
        }
    }

    pub fn lookup(&self, reference: &ResourceRef) -> Result<bool, String> {
        let input = serde_json::to_string(reference)
            .map_err(|e| format!("cannot encode lookup: {}", e))?;
        let out = transport::run_command(&self.command, &["lookup"], &input)?;
        if !out.success() {
            return Err(out.failure_summary());
        }
        let reply: LookupReply = serde_json::from_str(out.stdout.trim())
            .map_err(|e| format!("invalid lookup reply: {}", e))?;
        Ok(reply.exists)
    }
}

/// Interpret the command's exit status and stdout.
fn parse_outcome(out: &ExecOutput) -> ActionOutcome {
    let stdout = out.stdout.trim();
    if stdout.is_empty() {
        return if out.success() {
            ActionOutcome::ok(Default::default())
        } else {
            ActionOutcome::failed(out.failure_summary())
        };
    }

    match serde_json::from_str::<ActionOutcome>(stdout) {
        Ok(reply) if out.success() && reply.success => ActionOutcome {
            result: Some(reply.result.unwrap_or_default()),
            ..reply
        },
        Ok(reply) => ActionOutcome::failed(
            reply
                .error
                .unwrap_or_else(|| out.failure_summary()),
        ),
        Err(e) if out.success() => {
            ActionOutcome::failed(format!("invalid JSON from action command: {}", e))
        }
        Err(_) => ActionOutcome::failed(out.failure_summary()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RefKind;
    use serde_json::json;

    const SCRIPT: &str = r#"
input=$(cat)
case "$1" in
  create) echo '{"success":true,"result":{"uuid":"U-1","echo":'"$input"'}}' ;;
  delete) echo '{"success":false,"error":"record is locked"}' ;;
  search) echo 'garbage' ;;
  organize) echo "oops" >&2; exit 3 ;;
  lookup) case "$input" in *Inbox*) echo '{"exists":true}' ;; *) echo '{"exists":false}' ;; esac ;;
  *) exit 0 ;;
esac
"#;

    fn executor(dir: &tempfile::TempDir) -> ScriptExecutor {
        let path = dir.path().join("action.sh");
        std::fs::write(&path, SCRIPT).unwrap();
        ScriptExecutor::new(format!("bash {}", path.display()))
    }

    fn params(v: serde_json::Value) -> Params {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_script_success_with_result() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor(&dir).run(Action::Create, &params(json!({"name": "N"})));
        assert!(out.success);
        let result = out.result.unwrap();
        assert_eq!(result["uuid"], json!("U-1"));
        assert_eq!(result["echo"], json!({"name": "N"}));
    }

    #[test]
    fn test_script_reported_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor(&dir).run(Action::Delete, &Params::new());
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("record is locked"));
    }

    #[test]
    fn test_script_bad_json_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);
        let bad = exec.run(Action::Search, &Params::new());
        assert!(bad.error.unwrap().contains("invalid JSON"));
        let crashed = exec.run(Action::Organize, &Params::new());
        assert_eq!(crashed.error.as_deref(), Some("oops"));
    }

    #[test]
    fn test_script_empty_output_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor(&dir).run(Action::Link, &Params::new());
        assert!(out.success);
        assert!(out.result.unwrap().is_empty());
    }

    #[test]
    fn test_script_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);
        let inbox = ResourceRef {
            kind: RefKind::Database,
            value: "Inbox".into(),
            database: None,
        };
        let other = ResourceRef {
            value: "Archive".into(),
            ..inbox.clone()
        };
        assert_eq!(exec.lookup(&inbox), Ok(true));
        assert_eq!(exec.lookup(&other), Ok(false));
    }

    #[test]
    fn test_script_missing_command() {
        let out =
            ScriptExecutor::new("no-such-docqueue-action").run(Action::Search, &Params::new());
        assert!(out.error.unwrap().contains("failed to spawn"));
    }
}
