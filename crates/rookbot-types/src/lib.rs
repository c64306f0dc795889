//! rookbot-types: shared data model for the rookbot cron service.
//!
//! Defines the persisted job/store format, the event stream consumed by
//! transports (CLI, RPC, UI), and the create/patch DTOs. All timestamps are
//! epoch milliseconds; all wire names are camelCase to match the on-disk
//! store file.

use serde::{Deserialize, Serialize};

/// Version of the persisted store file format.
pub const STORE_VERSION: u32 = 1;

// ──────────────────── Schedules ────────────────────

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// A five/six-field cron expression evaluated in an IANA timezone
    /// (UTC when `tz` is absent).
    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    /// Fixed interval. Without an anchor the first occurrence is
    /// `now + everyMs`; with one, occurrences are `anchorMs + k*everyMs`.
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// A single absolute instant; fires once.
    #[serde(rename_all = "camelCase")]
    At { at: i64 },
}

// ──────────────────── Payloads ────────────────────

/// What to post when a command job's output is forwarded to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutputMode {
    /// A truncated first chunk of stdout.
    #[default]
    Preview,
    /// The whole bounded capture.
    Full,
    /// Nothing; the command is a go/no-go side effect.
    Silent,
}

/// What happens when a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronPayload {
    /// Text forwarded to the agent runtime as an agent turn.
    #[serde(rename_all = "camelCase")]
    AgentTurn { message: String },
    /// A shell command under a hard wall-clock timeout.
    #[serde(rename_all = "camelCase")]
    Command {
        command: String,
        timeout_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_mode: Option<CommandOutputMode>,
    },
}

// ──────────────────── Targeting ────────────────────

/// Which session context a job executes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    /// The main conversational session (results posted as system events).
    Main,
    /// An isolated, unattended agent session.
    #[default]
    Isolated,
}

/// Whether a finished job wakes the heartbeat immediately or waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    #[default]
    Now,
    NextHeartbeat,
}

// ──────────────────── Pre-check gate ────────────────────

/// How pre-check output merges into the job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreCheckMode {
    /// Gate output placed before the original message.
    #[default]
    Prepend,
    /// Gate output used verbatim, original discarded.
    Replace,
    /// Gate runs only as a go/no-go check.
    Ignore,
}

/// Optional command run before a job's real payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCheckSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub mode: PreCheckMode,
}

// ──────────────────── Job + state ────────────────────

/// Outcome of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

/// Mutable runtime state of a job. Mutated only by the execution wrapper
/// and schedule recomputation, never by external callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_summary: Option<String>,
}

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Unique, stable job ID.
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// Remove the job after its first execution attempt.
    #[serde(default)]
    pub delete_after_run: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: CronSchedule,
    #[serde(default)]
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    /// Start the agent turn in a fresh session rather than resuming.
    #[serde(default)]
    pub fresh_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_check: Option<PreCheckSpec>,
    #[serde(default)]
    pub state: CronJobState,
}

/// The sole persisted artifact: one file per profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStoreFile {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for CronStoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            jobs: Vec::new(),
        }
    }
}

// ──────────────────── Failure taxonomy ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    RuntimeValidation,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    InputValidation,
    Execution,
}

/// Structured reclassification of a non-ok outcome, attached to events only
/// when the failure-taxonomy feature is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    pub stage: FailureStage,
    pub root_cause: String,
    pub retriable: bool,
}

// ──────────────────── Events ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronJobAction {
    Added,
    Updated,
    Removed,
    Started,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronHealthAction {
    Unhealthy,
    Healthy,
}

/// Lifecycle event for a single job. Always carries `jobId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobEvent {
    pub job_id: String,
    pub action: CronJobAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl CronJobEvent {
    /// A bare lifecycle event (added/updated/removed/started) for a job.
    pub fn new(job_id: impl Into<String>, action: CronJobAction) -> Self {
        Self {
            job_id: job_id.into(),
            action,
            run_at_ms: None,
            duration_ms: None,
            status: None,
            error: None,
            summary: None,
            next_run_at_ms: None,
            timed_out: false,
            stdout_preview: None,
            failure: None,
        }
    }
}

/// Service health transition driven by store load failures. Never carries a
/// job ID — consumers filter job events by the presence of `jobId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronHealthEvent {
    pub action: CronHealthAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
}

/// Event stream emitted by the cron service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronEvent {
    Job(CronJobEvent),
    Health(CronHealthEvent),
}

fn is_false(v: &bool) -> bool {
    !*v
}

// ──────────────────── API DTOs ────────────────────

/// Input for creating a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobCreate {
    /// Fixed ID (e.g. for system jobs); generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default)]
    pub fresh_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_check: Option<PreCheckSpec>,
}

/// Field overlay for updating an existing job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CronSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<CronPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_target: Option<SessionTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_mode: Option<WakeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fresh_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_check: Option<PreCheckSpec>,
}

/// Summary returned by the service `status` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStatusSummary {
    pub enabled: bool,
    pub store_path: String,
    pub jobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
}

/// Result of a `run` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub ok: bool,
    pub ran: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunResult {
    pub fn ran() -> Self {
        Self {
            ok: true,
            ran: true,
            reason: None,
        }
    }

    pub fn not_due() -> Self {
        Self {
            ok: true,
            ran: false,
            reason: Some("not-due".to_string()),
        }
    }

    pub fn not_found() -> Self {
        Self {
            ok: false,
            ran: false,
            reason: Some("not-found".to_string()),
        }
    }
}

/// Result of a `remove` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResult {
    pub ok: bool,
    pub removed: usize,
}

fn default_true() -> bool {
    true
}
