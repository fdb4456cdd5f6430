use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// The result of running a single shell command to completion (or timeout).
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the process exited with status 0 and was not killed by a
    /// timeout.
    pub passed: bool,
    /// The actual exit code returned by the process, or `None` if the
    /// process was terminated by a signal or by our own timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

/// Run a shell command string (e.g. a project's configured test command)
/// in `working_dir`, with a wall-clock `timeout`.
///
/// The command is executed via `sh -c` so it may contain pipes, globs, and
/// multiple arguments as a single string, matching how subproject configs
/// express `testCommand`/`buildCommand`.
pub async fn run_command(command: &str, working_dir: &Path, timeout: Duration) -> Result<CommandResult> {
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute command: {command}"))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        let (wait_result, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        (wait_result, stdout, stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => {
            let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            let exit_code = status.code();
            let passed = exit_code == Some(0);

            Ok(CommandResult {
                passed,
                exit_code,
                stdout,
                stderr,
                duration_ms,
            })
        }
        Ok((Err(e), _, _)) => {
            Err(e).with_context(|| format!("failed to wait on command: {command}"))
        }
        Err(_) => {
            let _ = child.kill().await;
            let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);

            Ok(CommandResult {
                passed: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("command timed out after {}s: {command}", timeout.as_secs()),
                duration_ms,
            })
        }
    }
}
