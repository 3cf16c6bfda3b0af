//! Process tools. `system.run` executes an argv vector under the command
//! guard; `system.shell` accepts a raw shell string with a stricter gate.
//! Both always require approval.

use crate::errors::{CodedError, ErrorCode};
use crate::safety::command::CommandGuard;
use crate::safety::path::contain;
use crate::tools::{Tool, ToolContext};
use crate::utils::truncate_at_utf8_boundary;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

fn resolve_cwd(input: &Value, ctx: &ToolContext) -> Result<PathBuf, CodedError> {
    match input["cwd"].as_str() {
        Some(cwd) => contain(cwd, &ctx.workspace),
        None => Ok(ctx.workspace.clone()),
    }
}

fn combined_output(output: &std::process::Output, max_bytes: usize) -> (String, String, bool) {
    let combined_len = output.stdout.len() + output.stderr.len();
    let truncated = combined_len > max_bytes;

    // Reserve a quarter of the budget for stderr so error text survives a
    // chatty stdout.
    let stderr_reserve = (max_bytes / 4).min(output.stderr.len());
    let stdout_max = max_bytes - stderr_reserve;
    let stdout_bytes = truncate_at_utf8_boundary(&output.stdout, stdout_max);
    let remaining = max_bytes.saturating_sub(stdout_bytes.len());
    let stderr_bytes = truncate_at_utf8_boundary(&output.stderr, remaining);

    (
        String::from_utf8_lossy(stdout_bytes).into_owned(),
        String::from_utf8_lossy(stderr_bytes).into_owned(),
        truncated,
    )
}

pub struct SystemRunTool;

#[async_trait]
impl Tool for SystemRunTool {
    fn id(&self) -> &str {
        "system.run"
    }

    fn description(&self) -> &str {
        "Run an allowlisted program with explicit arguments inside the workspace."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "argv": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1
                },
                "cwd": { "type": "string" }
            },
            "required": ["argv"]
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError> {
        let argv: Vec<String> = input["argv"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let cwd = resolve_cwd(&input, ctx)?;

        let guard = CommandGuard::new(ctx.policy.allowed_commands.clone());
        guard.check_argv(&argv, &cwd, &ctx.workspace)?;

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(&cwd);
        cmd.kill_on_drop(true);
        let output = cmd.output().await.map_err(|e| {
            CodedError::new(
                ErrorCode::NotFound,
                format!("failed to execute '{}'", argv[0]),
            )
            .with_internal(e.to_string())
        })?;

        let (stdout, stderr, truncated) = combined_output(&output, ctx.policy.max_bytes);
        Ok(serde_json::json!({
            "exitCode": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
            "truncated": truncated,
        }))
    }
}

pub struct SystemShellTool;

#[async_trait]
impl Tool for SystemShellTool {
    fn id(&self) -> &str {
        "system.shell"
    }

    fn description(&self) -> &str {
        "Run a raw shell command. Metacharacters outside quotes are rejected."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "cwd": { "type": "string" }
            },
            "required": ["command"]
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError> {
        let command = input["command"].as_str().unwrap_or_default();
        let cwd = resolve_cwd(&input, ctx)?;

        let guard = CommandGuard::new(ctx.policy.allowed_commands.clone());
        guard.check_shell(command)?;
        // The shell form still honours the allowlist for its first word.
        let words = shlex::split(command)
            .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
        guard.check_argv(&words, &cwd, &ctx.workspace)?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&cwd);
        cmd.kill_on_drop(true);
        let output = cmd.output().await.map_err(|e| {
            CodedError::new(ErrorCode::Unknown, "failed to spawn shell")
                .with_internal(e.to_string())
        })?;

        let (stdout, stderr, truncated) = combined_output(&output, ctx.policy.max_bytes);
        Ok(serde_json::json!({
            "exitCode": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
            "truncated": truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Policy;

    fn ctx(workspace: &std::path::Path) -> ToolContext {
        ToolContext {
            session_id: "s".into(),
            agent_id: "a".into(),
            user_id: "u".into(),
            workspace: workspace.to_path_buf(),
            policy: Policy {
                allowed_commands: vec!["echo".into(), "ls".into(), "sh".into(), "false".into()],
                ..Policy::default()
            },
        }
    }

    #[tokio::test]
    async fn runs_allowlisted_argv() {
        let ws = tempfile::tempdir().unwrap();
        let out = SystemRunTool
            .run(
                serde_json::json!({"argv": ["echo", "hello"]}),
                &ctx(ws.path()),
            )
            .await
            .unwrap();
        assert_eq!(out["exitCode"], 0);
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let ws = tempfile::tempdir().unwrap();
        let out = SystemRunTool
            .run(serde_json::json!({"argv": ["false"]}), &ctx(ws.path()))
            .await
            .unwrap();
        assert_eq!(out["exitCode"], 1);
    }

    #[tokio::test]
    async fn blocks_unlisted_program() {
        let ws = tempfile::tempdir().unwrap();
        let err = SystemRunTool
            .run(
                serde_json::json!({"argv": ["python3", "-c", "1"]}),
                &ctx(ws.path()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandBlocked);
    }

    #[tokio::test]
    async fn blocks_cwd_escape() {
        let ws = tempfile::tempdir().unwrap();
        let err = SystemRunTool
            .run(
                serde_json::json!({"argv": ["echo", "x"], "cwd": "/etc"}),
                &ctx(ws.path()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPath);
    }

    #[tokio::test]
    async fn shell_blocks_pipes() {
        let ws = tempfile::tempdir().unwrap();
        let err = SystemShellTool
            .run(
                serde_json::json!({"command": "echo hi | cat"}),
                &ctx(ws.path()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandBlocked);
    }

    #[tokio::test]
    async fn shell_runs_plain_command() {
        let ws = tempfile::tempdir().unwrap();
        let out = SystemShellTool
            .run(
                serde_json::json!({"command": "echo 'a; b'"}),
                &ctx(ws.path()),
            )
            .await
            .unwrap();
        assert_eq!(out["exitCode"], 0);
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "a; b");
    }

    #[cfg(unix)]
    #[test]
    fn output_truncation_reserves_stderr() {
        use std::os::unix::process::ExitStatusExt;
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: vec![b'a'; 2000],
            stderr: vec![b'e'; 500],
        };
        let (stdout, stderr, truncated) = combined_output(&output, 1000);
        assert!(truncated);
        assert!(stdout.len() <= 1000);
        assert!(!stderr.is_empty());
        assert!(stdout.len() + stderr.len() <= 1000);
    }
}
