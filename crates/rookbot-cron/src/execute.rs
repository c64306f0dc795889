//! Execution core — pure decision logic turning one job plus the injected
//! collaborators into an outcome. No store writes and no event emission
//! happen here; that is the execution wrapper's business (see
//! `service::CronWorker::execute_job`).

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rookbot_types::{
    CommandOutputMode, CronJob, CronPayload, RunStatus, SessionTarget, WakeMode,
};

use crate::precheck::tail;
use crate::runtime::CronRuntime;

/// Upper bound on captured stdout/stderr.
const MAX_CAPTURE_CHARS: usize = 200_000;

/// How much stdout ends up in the finished event.
const PREVIEW_CHARS: usize = 2_000;

/// Stderr excerpt kept in error messages.
const STDERR_EXCERPT_CHARS: usize = 400;

/// Raw outcome of a single execution attempt.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub summary: Option<String>,
    pub timed_out: bool,
    pub stdout_preview: Option<String>,
    /// Why a skipped outcome was skipped; feeds the failure classifier.
    pub skip_reason: Option<String>,
    /// Bounded full capture, for `outputMode: full` posting.
    pub(crate) stdout_full: Option<String>,
}

impl JobOutcome {
    pub fn ok() -> Self {
        Self {
            status: RunStatus::Ok,
            error: None,
            summary: None,
            timed_out: false,
            stdout_preview: None,
            skip_reason: None,
            stdout_full: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            error: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            skip_reason: Some(reason.into()),
            ..Self::ok()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Decide and perform one execution attempt.
///
/// `message` is the payload message after pre-check application; `None`
/// falls back to the payload's own text.
pub async fn execute_job_core(
    job: &CronJob,
    message: Option<&str>,
    runtime: &dyn CronRuntime,
    cancel: CancellationToken,
) -> JobOutcome {
    let outcome = match (&job.session_target, &job.payload) {
        // Agent turns need an isolated session; the main session only
        // accepts command output posted as system events.
        (SessionTarget::Main, CronPayload::AgentTurn { .. }) => {
            JobOutcome::skipped("main-job-payload-invalid")
        }
        (
            _,
            CronPayload::Command {
                command,
                timeout_seconds,
                output_mode,
            },
        ) => {
            let outcome = run_command_payload(command, *timeout_seconds).await;
            if job.session_target == SessionTarget::Main && outcome.status == RunStatus::Ok {
                post_command_output(job, output_mode.unwrap_or_default(), &outcome, runtime).await;
            }
            outcome
        }
        (SessionTarget::Isolated, CronPayload::AgentTurn { message: payload_msg }) => {
            let msg = message.unwrap_or(payload_msg);
            run_agent_turn(job, msg, runtime, cancel).await
        }
    };

    if outcome.status == RunStatus::Ok {
        wake_after_run(job, runtime).await;
    }
    outcome
}

async fn run_agent_turn(
    job: &CronJob,
    message: &str,
    runtime: &dyn CronRuntime,
    cancel: CancellationToken,
) -> JobOutcome {
    // The collaborator is handed the token and expected to honor it; the
    // race is the backstop that unwedges the worker when it does not.
    let result = tokio::select! {
        res = runtime.run_isolated_agent_job(job, message, cancel.clone()) => res,
        _ = cancel.cancelled() => {
            return JobOutcome::error("agent turn cancelled");
        }
    };
    match result {
        Ok(r) => {
            let summary = r
                .summary
                .or_else(|| r.output_text.as_deref().map(first_line));
            JobOutcome {
                status: r.status,
                error: r.error,
                summary,
                ..JobOutcome::ok()
            }
        }
        Err(e) => {
            let message = e.to_string();
            let timed_out = is_timeout_message(&message);
            JobOutcome {
                timed_out,
                ..JobOutcome::error(message)
            }
        }
    }
}

async fn run_command_payload(command: &str, timeout_seconds: u64) -> JobOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output =
        match tokio::time::timeout(Duration::from_secs(timeout_seconds), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return JobOutcome::error(format!("failed to spawn command: {e}")),
            // The dropped future kills the child (kill_on_drop).
            Err(_) => {
                return JobOutcome {
                    timed_out: true,
                    ..JobOutcome::error(format!("command timed out after {timeout_seconds}s"))
                };
            }
        };

    let stdout = truncate(&String::from_utf8_lossy(&output.stdout), MAX_CAPTURE_CHARS);
    let preview = truncate(stdout.trim_end(), PREVIEW_CHARS);

    if output.status.success() {
        let summary = match stdout.trim().lines().next() {
            Some(line) if !line.is_empty() => line.to_string(),
            _ => "ok".to_string(),
        };
        JobOutcome {
            stdout_preview: Some(preview),
            stdout_full: Some(stdout),
            ..JobOutcome::ok().with_summary(summary)
        }
    } else {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        JobOutcome {
            stdout_preview: Some(preview),
            stdout_full: Some(stdout),
            ..JobOutcome::error(format!(
                "exit {code}: {}",
                tail(stderr.trim(), STDERR_EXCERPT_CHARS)
            ))
        }
    }
}

/// Forward a main-target command's output into the main session.
async fn post_command_output(
    job: &CronJob,
    mode: CommandOutputMode,
    outcome: &JobOutcome,
    runtime: &dyn CronRuntime,
) {
    let body = match mode {
        CommandOutputMode::Silent => return,
        CommandOutputMode::Preview => outcome.stdout_preview.clone().unwrap_or_default(),
        CommandOutputMode::Full => outcome.stdout_full.clone().unwrap_or_default(),
    };
    let text = format!("Cron job '{}' output:\n{}", job.name, body);
    if let Err(e) = runtime.enqueue_system_event(&text, None).await {
        warn!(job_id = %job.id, error = %e, "failed to enqueue system event");
    }
}

async fn wake_after_run(job: &CronJob, runtime: &dyn CronRuntime) {
    if job.wake_mode != WakeMode::Now {
        return;
    }
    let reason = format!("cron:{}", job.id);
    let res = match job.session_target {
        // Main jobs just queued a system event; process it right away.
        SessionTarget::Main => runtime.run_heartbeat_once(Some(&reason)).await,
        SessionTarget::Isolated => runtime.request_heartbeat_now(Some(&reason)).await,
    };
    if let Err(e) = res {
        warn!(job_id = %job.id, error = %e, "heartbeat wake failed");
    }
}

pub(crate) fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("\n... [output truncated]");
        out
    }
}
