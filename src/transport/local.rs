//! Local process execution.

use super::ExecOutput;
use std::io::Write;
use std::process::{Command, Stdio};

/// Run `program` with `args`, writing `input` to its stdin.
pub fn exec_local(program: &str, args: &[String], input: &str) -> Result<ExecOutput, String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

    // Feed stdin from its own thread while stdout drains, so a command that
    // writes before reading cannot deadlock. A command that exits without
    // reading its input closes the pipe; that is not a failure.
    let writer = child.stdin.take().map(|mut stdin| {
        let input = input.to_owned();
        std::thread::spawn(move || match stdin.write_all(input.as_bytes()) {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
            _ => Ok(()),
        })
    });

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;

    if let Some(handle) = writer {
        handle
            .join()
            .map_err(|_| "stdin writer panicked".to_string())?
            .map_err(|e| format!("stdin write error: {}", e))?;
    }

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
