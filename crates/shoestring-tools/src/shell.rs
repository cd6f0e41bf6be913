//! Shell capability. Commands run through the platform shell with a hard
//! timeout; a hung command is killed and reported, never waited on forever.

use crate::Capability;
use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const OUTPUT_MAX_CHARS: usize = 4_000;
const TIMEOUT_CAP_SECS: u64 = 300;

#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Run `cmd` through the first shell that spawns, killing it at `timeout`.
pub fn run_shell(cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellOutput> {
    let mut child = spawn_in_shell(cmd, cwd)?;
    let timed_out = child.wait_timeout(timeout)?.is_none();
    if timed_out {
        child.kill()?;
    }
    let output = child.wait_with_output()?;
    Ok(ShellOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        timed_out,
    })
}

fn spawn_in_shell(cmd: &str, cwd: &Path) -> Result<Child> {
    let mut failures = Vec::new();
    for (program, args) in shell_candidates() {
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(cmd)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(e) => failures.push(format!("{program}: {e}")),
        }
    }
    Err(anyhow!(
        "no usable shell for '{cmd}': {}",
        failures.join(" | ")
    ))
}

#[cfg(target_os = "windows")]
fn shell_candidates() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        ("cmd", vec!["/C"]),
        ("powershell", vec!["-NoLogo", "-NoProfile", "-Command"]),
    ]
}

#[cfg(not(target_os = "windows"))]
fn shell_candidates() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![("sh", vec!["-c"]), ("bash", vec!["-c"])]
}

pub struct RunCommand {
    workspace: PathBuf,
    default_timeout: Duration,
}

impl RunCommand {
    pub fn new(workspace: PathBuf, default_timeout: Duration) -> Self {
        Self {
            workspace,
            default_timeout,
        }
    }

    fn timeout_for(&self, args: &Value) -> Duration {
        args.get("timeout_secs")
            .and_then(Value::as_u64)
            .map(|s| Duration::from_secs(s.min(TIMEOUT_CAP_SECS)))
            .unwrap_or(self.default_timeout)
    }
}

impl Capability for RunCommand {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace and capture its output"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {"type": "string", "description": "Shell command line to run"},
                "timeout_secs": {
                    "type": "integer",
                    "description": "Optional timeout override in seconds"
                }
            },
            "required": ["cmd"]
        })
    }

    fn invoke(&self, args: &Value) -> String {
        let cmd = match crate::required_str(args, "cmd") {
            Ok(c) => c,
            Err(e) => return e,
        };
        let timeout = self.timeout_for(args);
        let out = match run_shell(cmd, &self.workspace, timeout) {
            Ok(out) => out,
            Err(e) => return format!("ERROR: {e}"),
        };
        if out.timed_out {
            return format!("ERROR: command timed out after {}s: {cmd}", timeout.as_secs());
        }
        let code = out.exit_code.unwrap_or(-1);
        let stdout = shoestring_core::truncate_chars(out.stdout.trim_end(), OUTPUT_MAX_CHARS);
        let stderr = shoestring_core::truncate_chars(out.stderr.trim_end(), OUTPUT_MAX_CHARS);
        let prefix = if code == 0 { "OK" } else { "ERROR" };
        let mut report = format!("{prefix}: exit code {code}");
        if !stdout.is_empty() {
            report.push_str("\nstdout:\n");
            report.push_str(stdout);
        }
        if !stderr.is_empty() {
            report.push_str("\nstderr:\n");
            report.push_str(stderr);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_output_is_captured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cap = RunCommand::new(dir.path().to_path_buf(), Duration::from_secs(5));
        let out = cap.invoke(&json!({"cmd": "echo shoestring"}));
        assert!(out.starts_with("OK: exit code 0"), "{out}");
        assert!(out.contains("shoestring"), "{out}");
    }

    #[test]
    fn nonzero_exit_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cap = RunCommand::new(dir.path().to_path_buf(), Duration::from_secs(5));
        let out = cap.invoke(&json!({"cmd": "exit 3"}));
        assert!(out.starts_with("ERROR: exit code 3"), "{out}");
    }

    #[test]
    fn hung_command_is_killed_at_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cap = RunCommand::new(dir.path().to_path_buf(), Duration::from_secs(30));
        let out = cap.invoke(&json!({"cmd": "sleep 10", "timeout_secs": 1}));
        assert!(out.contains("timed out after 1s"), "{out}");
    }

    #[test]
    fn commands_run_in_the_workspace_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "here").expect("write");
        let cap = RunCommand::new(dir.path().to_path_buf(), Duration::from_secs(5));
        let out = cap.invoke(&json!({"cmd": "ls"}));
        assert!(out.contains("marker.txt"), "{out}");
    }
}
