//! Collaborator boundary — everything the cron engine needs from the host
//! (agent runtime, heartbeat bus, event consumers) behind one injected
//! trait, so the scheduler never depends on their implementations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rookbot_types::{CronEvent, CronJob, RunStatus};

/// Result of an isolated agent turn, adopted verbatim into the job outcome.
#[derive(Debug, Clone)]
pub struct AgentJobResult {
    pub status: RunStatus,
    pub summary: Option<String>,
    pub output_text: Option<String>,
    pub error: Option<String>,
}

/// Host services the engine calls into. The cancellation token passed to
/// [`run_isolated_agent_job`](CronRuntime::run_isolated_agent_job) is
/// cancelled by the watchdog when an execution is stuck; honoring it is the
/// collaborator's side of the contract.
#[async_trait]
pub trait CronRuntime: Send + Sync {
    /// Post text into the main session's system-event queue.
    async fn enqueue_system_event(&self, text: &str, agent_id: Option<&str>)
    -> anyhow::Result<()>;

    /// Ask the heartbeat loop to wake as soon as possible.
    async fn request_heartbeat_now(&self, reason: Option<&str>) -> anyhow::Result<()>;

    /// Run one heartbeat pass immediately. Hosts without a synchronous
    /// heartbeat fall back to a wake request.
    async fn run_heartbeat_once(&self, reason: Option<&str>) -> anyhow::Result<()> {
        self.request_heartbeat_now(reason).await
    }

    /// Execute an agent turn in an isolated session.
    async fn run_isolated_agent_job(
        &self,
        job: &CronJob,
        message: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<AgentJobResult>;
}

/// Injected clock, epoch milliseconds. Tests freeze it.
pub type SharedClock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Sink for the service's event stream.
pub type EventSink = Arc<dyn Fn(CronEvent) + Send + Sync>;

pub fn system_clock() -> SharedClock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Everything a [`CronService`](crate::service::CronService) is constructed
/// with.
pub struct CronServiceDeps {
    pub store_path: PathBuf,
    pub cron_enabled: bool,
    pub failure_taxonomy_enabled: bool,
    pub clock: SharedClock,
    pub runtime: Arc<dyn CronRuntime>,
    pub on_event: Option<EventSink>,
    pub tick_interval: Duration,
    pub watchdog_interval: Duration,
    /// How long an execution may hold the running marker before the
    /// watchdog reclaims it.
    pub stuck_after: Duration,
}

impl CronServiceDeps {
    pub fn new(store_path: impl Into<PathBuf>, runtime: Arc<dyn CronRuntime>) -> Self {
        Self {
            store_path: store_path.into(),
            cron_enabled: true,
            failure_taxonomy_enabled: false,
            clock: system_clock(),
            runtime,
            on_event: None,
            tick_interval: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(60),
            stuck_after: Duration::from_secs(600),
        }
    }
}
