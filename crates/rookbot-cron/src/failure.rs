//! Failure taxonomy — a pure, after-the-fact mapping from raw outcomes to
//! structured `{type, stage, rootCause, retriable}` records. Kept out of the
//! execution path so the feature flag can toggle without touching it.

use rookbot_types::{FailureRecord, FailureStage, FailureType, RunStatus};

use crate::execute::{JobOutcome, is_timeout_message};

const ROOT_CAUSE_CHARS: usize = 120;

/// Classify a non-ok outcome. Returns `None` for ok outcomes; the caller
/// applies this only when the taxonomy feature is enabled.
pub fn classify_failure(outcome: &JobOutcome) -> Option<FailureRecord> {
    if outcome.status == RunStatus::Ok {
        return None;
    }

    if let Some(reason) = outcome.skip_reason.as_deref() {
        if reason == "main-job-payload-invalid" {
            return Some(FailureRecord {
                failure_type: FailureType::RuntimeValidation,
                stage: FailureStage::InputValidation,
                root_cause: reason.to_string(),
                retriable: false,
            });
        }
        // Pre-check no-gos whose reason reads like a timeout are worth a
        // retry; deliberate no-gos are not.
        let timed_out = outcome
            .summary
            .as_deref()
            .is_some_and(is_timeout_message);
        return Some(FailureRecord {
            failure_type: if timed_out {
                FailureType::Timeout
            } else {
                FailureType::Unknown
            },
            stage: FailureStage::Execution,
            root_cause: reason.to_string(),
            retriable: timed_out,
        });
    }

    if outcome.timed_out || outcome.error.as_deref().is_some_and(is_timeout_message) {
        return Some(FailureRecord {
            failure_type: FailureType::Timeout,
            stage: FailureStage::Execution,
            root_cause: "timeout".to_string(),
            retriable: true,
        });
    }

    let root_cause = outcome
        .error
        .as_deref()
        .map(|e| truncate(e.lines().next().unwrap_or(e)))
        .unwrap_or_else(|| "unknown".to_string());
    Some(FailureRecord {
        failure_type: FailureType::Unknown,
        stage: FailureStage::Execution,
        root_cause,
        retriable: false,
    })
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= ROOT_CAUSE_CHARS {
        s.to_string()
    } else {
        s.chars().take(ROOT_CAUSE_CHARS).collect()
    }
}
