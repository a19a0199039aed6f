//! Process transport: runs the external action command.

pub mod local;

/// Output from running a command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, else the exit code.
    pub fn failure_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("exited with code {}", self.exit_code))
    }
}

/// Split a configured command line into program and leading arguments.
/// Whitespace-separated; no shell quoting.
pub fn split_command(command: &str) -> Result<(String, Vec<String>), String> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| "action command is empty".to_string())?;
    Ok((program, parts.collect()))
}

/// Run `command` (program plus configured args) with `extra` args, feeding `input` on stdin.
pub fn run_command(command: &str, extra: &[&str], input: &str) -> Result<ExecOutput, String> {
    let (program, mut args) = split_command(command)?;
    args.extend(extra.iter().map(|a| a.to_string()));
    local::exec_local(&program, &args, input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_split_command() {
        let (program, args) = split_command("python3  actions.py --quiet").unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["actions.py", "--quiet"]);
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn test_transport_run_command_args() {
        let out = run_command("echo", &["create"], "").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "create");
    }

    #[test]
    fn test_transport_failure_summary() {
        let out = ExecOutput {
            exit_code: 3,
            stdout: String::new(),
            stderr: "warning\nrecord not found\n\n".to_string(),
        };
        assert_eq!(out.failure_summary(), "record not found");
        let silent = ExecOutput {
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(silent.failure_summary(), "exited with code 3");
    }
}
