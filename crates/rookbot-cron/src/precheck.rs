//! Pre-check gate — an optional go/no-go command run before a job's real
//! payload, whose output can be merged into the job message.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use rookbot_types::{PreCheckMode, PreCheckSpec};

/// Default timeout when the spec does not set one.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How much of stderr is kept in failure reasons.
const STDERR_TAIL_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct PreCheckOutcome {
    pub passed: bool,
    /// Captured stdout (trimmed) when the gate passed.
    pub output: String,
    /// Why the gate failed, when it did.
    pub reason: Option<String>,
}

impl PreCheckOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: String::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Run the gate command. Exit 0 with non-empty stdout passes; everything
/// else (non-zero exit, empty output, timeout, spawn failure) is a no-go.
pub async fn run_pre_check(spec: &PreCheckSpec) -> PreCheckOutcome {
    let timeout_secs = spec.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return PreCheckOutcome::failed(format!("failed to spawn pre-check: {e}")),
        Err(_) => {
            return PreCheckOutcome::failed(format!("pre-check timed out after {timeout_secs}s"));
        }
    };

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return PreCheckOutcome::failed(format!(
            "exit {code}: {}",
            tail(stderr.trim(), STDERR_TAIL_CHARS)
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        return PreCheckOutcome::failed("empty output");
    }
    debug!(bytes = stdout.len(), "pre-check passed");
    PreCheckOutcome {
        passed: true,
        output: stdout,
        reason: None,
    }
}

/// Merge gate output into the job message.
pub fn apply_pre_check(mode: PreCheckMode, gate_output: &str, message: &str) -> String {
    match mode {
        PreCheckMode::Prepend => format!("{gate_output}\n\n{message}"),
        PreCheckMode::Replace => gate_output.to_string(),
        PreCheckMode::Ignore => message.to_string(),
    }
}

/// Last `max_chars` characters of `s`.
pub(crate) fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}
