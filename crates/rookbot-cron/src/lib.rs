//! rookbot-cron: the gateway's scheduled job execution engine.
//!
//! Fires agent turns or shell commands on calendar, interval, or one-shot
//! schedules, persists job state to a JSON store file, and survives process
//! restarts, stuck executions, and concurrent edits from multiple callers.
//! The agent runtime, heartbeat bus, and transports plug in through the
//! [`CronRuntime`] boundary; the engine never imports them.

pub mod error;
pub mod execute;
pub mod failure;
pub mod precheck;
pub mod runtime;
pub mod schedule;
pub mod service;
pub mod store;

pub use error::{CronError, Result};
pub use execute::JobOutcome;
pub use runtime::{AgentJobResult, CronRuntime, CronServiceDeps, system_clock};
pub use service::{CronService, RunMode};
pub use store::CronStore;
