//! External program invocation shared by the command-backed capabilities.
//!
//! The program receives the action as its last argument and a JSON payload
//! on stdin; stdout and the exit code come back to the caller.

use std::process::Stdio;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// How to launch an external capability program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Raw result of one program run.
#[derive(Debug, Clone)]
pub struct ProgramOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProgramOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `spec` with `action` appended to its arguments and `payload` on stdin.
pub async fn run_program(
    spec: &ProgramSpec,
    action: &str,
    payload: &Value,
) -> anyhow::Result<ProgramOutput> {
    let input = serde_json::to_vec(payload)?;
    debug!(program = %spec.program, action, "invoking capability program");

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .arg(action)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program))?;

    // Feed stdin while draining stdout and stderr, so a program that writes
    // before it finishes reading cannot stall on a full pipe.
    let stdin = child.stdin.take();
    let feed = async move {
        let Some(mut stdin) = stdin else {
            return Ok(());
        };
        // stdin drops at the end of this block, closing the pipe.
        match stdin.write_all(&input).await {
            // A program that ignores its payload may exit before reading it.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            result => result,
        }
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    fed.with_context(|| format!("failed to write payload to {}", spec.program))?;

    Ok(ProgramOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Run `spec` and fail unless it exits zero.
pub async fn run_checked(
    spec: &ProgramSpec,
    action: &str,
    payload: &Value,
) -> anyhow::Result<ProgramOutput> {
    let output = run_program(spec, action, payload).await?;
    if !output.success() {
        anyhow::bail!(
            "{} {action} exited with {}: {}",
            spec.program,
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(output)
}
