//! Orchestrator — owns the op queue, the periodic tick, and the watchdog.
//!
//! Every store-mutating operation (add/update/remove/run and the tick's
//! execute-then-persist sequence) flows through one mpsc channel with a
//! single consumer, so no two mutations ever observe overlapping
//! intermediate store states. The watchdog runs on its own interval and is
//! the only thing allowed to clear the running marker from outside an
//! execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rookbot_types::{
    CronEvent, CronHealthAction, CronHealthEvent, CronJob, CronJobAction, CronJobCreate,
    CronJobEvent, CronJobPatch, CronJobState, CronPayload, CronSchedule, CronStatusSummary,
    CronStoreFile, PreCheckSpec, RemoveResult, RunResult, RunStatus,
};

use crate::error::{CronError, Result};
use crate::execute::{JobOutcome, execute_job_core};
use crate::failure::classify_failure;
use crate::precheck::{apply_pre_check, run_pre_check};
use crate::runtime::{CronServiceDeps, SharedClock};
use crate::schedule;
use crate::store::CronStore;

/// Store load failures before an unhealthy event is emitted.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Whether a `run` request respects the due time or bypasses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Due,
    Force,
}

// ──────────────────── Running marker ────────────────────

/// The single "currently executing" marker, guarded by one timestamp so the
/// watchdog can reclaim it without a supervising thread.
struct RunningState {
    started_at_ms: AtomicI64,
    current: std::sync::Mutex<Option<(String, CancellationToken)>>,
}

impl RunningState {
    fn new() -> Self {
        Self {
            started_at_ms: AtomicI64::new(0),
            current: std::sync::Mutex::new(None),
        }
    }

    fn begin(&self, job_id: &str, now_ms: i64) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap() = Some((job_id.to_string(), token.clone()));
        self.started_at_ms.store(now_ms, Ordering::SeqCst);
        token
    }

    fn finish(&self) {
        self.started_at_ms.store(0, Ordering::SeqCst);
        self.current.lock().unwrap().take();
    }

    fn started_at_ms(&self) -> Option<i64> {
        match self.started_at_ms.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Cancel the in-flight token and clear the marker. Returns the stuck
    /// job's id when there was one.
    fn force_clear(&self) -> Option<String> {
        let current = self.current.lock().unwrap().take();
        self.started_at_ms.store(0, Ordering::SeqCst);
        current.map(|(job_id, token)| {
            token.cancel();
            job_id
        })
    }
}

// ──────────────────── Op queue ────────────────────

enum CronOp {
    Add {
        create: CronJobCreate,
        reply: oneshot::Sender<Result<CronJob>>,
    },
    Update {
        id: String,
        patch: CronJobPatch,
        reply: oneshot::Sender<Result<CronJob>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<RemoveResult>,
    },
    Run {
        id: String,
        mode: RunMode,
        reply: oneshot::Sender<RunResult>,
    },
    List {
        reply: oneshot::Sender<Vec<CronJob>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<CronJob>>,
    },
    Status {
        reply: oneshot::Sender<CronStatusSummary>,
    },
    Tick {
        reply: Option<oneshot::Sender<()>>,
    },
}

// ──────────────────── Service handle ────────────────────

/// Public handle to the cron service. Cheap to clone via `Arc` by the host;
/// all operations are serialized through the worker.
pub struct CronService {
    ops_tx: mpsc::UnboundedSender<CronOp>,
    running: Arc<RunningState>,
    shutdown: CancellationToken,
}

impl CronService {
    /// Spawn the worker (always) and, when enabled, the timer and watchdog.
    pub fn start(deps: CronServiceDeps) -> Self {
        let enabled = deps.cron_enabled;
        let tick_interval = deps.tick_interval;
        let watchdog_interval = deps.watchdog_interval;
        let stuck_after = deps.stuck_after;
        let clock = deps.clock.clone();
        let store_path = deps.store_path.clone();

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let running = Arc::new(RunningState::new());
        let shutdown = CancellationToken::new();

        let worker = CronWorker {
            store: CronStore::new(&store_path),
            running: running.clone(),
            snapshot: CronStoreFile::default(),
            unhealthy: false,
            deps,
        };
        tokio::spawn(worker.run(ops_rx, shutdown.clone()));

        if enabled {
            // Startup tick: catch up missed occurrences before the first
            // timer interval elapses.
            let _ = ops_tx.send(CronOp::Tick { reply: None });

            let timer_tx = ops_tx.clone();
            let timer_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + tick_interval;
                let mut interval = tokio::time::interval_at(start, tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = timer_shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if timer_tx.send(CronOp::Tick { reply: None }).is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            spawn_watchdog(
                running.clone(),
                clock,
                watchdog_interval,
                stuck_after,
                shutdown.clone(),
            );
            info!(store = %store_path.display(), "cron service started");
        } else {
            info!("cron service disabled; timer and watchdog not started");
        }

        Self {
            ops_tx,
            running,
            shutdown,
        }
    }

    pub async fn add(&self, create: CronJobCreate) -> Result<CronJob> {
        self.call(|reply| CronOp::Add { create, reply }).await?
    }

    pub async fn update(&self, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        let id = id.to_string();
        self.call(|reply| CronOp::Update { id, patch, reply }).await?
    }

    pub async fn remove(&self, id: &str) -> Result<RemoveResult> {
        let id = id.to_string();
        self.call(|reply| CronOp::Remove { id, reply }).await
    }

    pub async fn run(&self, id: &str, mode: RunMode) -> Result<RunResult> {
        let id = id.to_string();
        self.call(|reply| CronOp::Run { id, mode, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<CronJob>> {
        self.call(|reply| CronOp::List { reply }).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<CronJob>> {
        let id = id.to_string();
        self.call(|reply| CronOp::Get { id, reply }).await
    }

    pub async fn status(&self) -> Result<CronStatusSummary> {
        self.call(|reply| CronOp::Status { reply }).await
    }

    /// Enqueue a tick and wait for it to fully settle. The timer uses the
    /// same op, so awaiting this also guarantees no tick is mid-flight.
    pub async fn run_tick_now(&self) -> Result<()> {
        self.call(|reply| CronOp::Tick { reply: Some(reply) }).await
    }

    /// When an execution is in flight, the instant it started.
    pub fn running_since_ms(&self) -> Option<i64> {
        self.running.started_at_ms()
    }

    /// Stop the worker, timer, and watchdog.
    pub fn stop(&self) {
        self.shutdown.cancel();
        info!("cron service stopped");
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> CronOp) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.ops_tx
            .send(make(tx))
            .map_err(|_| CronError::Stopped)?;
        rx.await.map_err(|_| CronError::Stopped)
    }
}

fn spawn_watchdog(
    running: Arc<RunningState>,
    clock: SharedClock,
    interval: std::time::Duration,
    stuck_after: std::time::Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let stuck_after_ms = stuck_after.as_millis() as i64;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(started) = running.started_at_ms() else { continue };
                    let elapsed = clock() - started;
                    if elapsed > stuck_after_ms {
                        if let Some(job_id) = running.force_clear() {
                            warn!(
                                job_id = %job_id,
                                stuck_ms = elapsed,
                                "watchdog force-cleared stuck cron execution"
                            );
                        }
                    }
                }
            }
        }
    });
}

// ──────────────────── Worker ────────────────────

struct CronWorker {
    deps: CronServiceDeps,
    store: CronStore,
    running: Arc<RunningState>,
    /// Last successfully loaded or saved state; read fallback while the
    /// on-disk file is unreadable.
    snapshot: CronStoreFile,
    unhealthy: bool,
}

impl CronWorker {
    async fn run(
        mut self,
        mut ops_rx: mpsc::UnboundedReceiver<CronOp>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                op = ops_rx.recv() => match op {
                    Some(op) => self.handle(op).await,
                    None => break,
                },
            }
        }
        debug!("cron worker exited");
    }

    async fn handle(&mut self, op: CronOp) {
        match op {
            CronOp::Add { create, reply } => {
                let _ = reply.send(self.handle_add(create));
            }
            CronOp::Update { id, patch, reply } => {
                let _ = reply.send(self.handle_update(&id, patch));
            }
            CronOp::Remove { id, reply } => {
                let _ = reply.send(self.handle_remove(&id));
            }
            CronOp::Run { id, mode, reply } => {
                let _ = reply.send(self.handle_run(&id, mode).await);
            }
            CronOp::List { reply } => {
                let _ = reply.send(self.load().jobs);
            }
            CronOp::Get { id, reply } => {
                let _ = reply.send(self.load().jobs.into_iter().find(|j| j.id == id));
            }
            CronOp::Status { reply } => {
                let _ = reply.send(self.handle_status());
            }
            CronOp::Tick { reply } => {
                self.tick().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn now(&self) -> i64 {
        (self.deps.clock)()
    }

    fn emit(&self, event: CronEvent) {
        if let Some(sink) = &self.deps.on_event {
            sink(event);
        }
    }

    fn emit_job(&self, event: CronJobEvent) {
        self.emit(CronEvent::Job(event));
    }

    /// Load the store, tracking health. Store errors never surface to API
    /// callers: the last good snapshot stands in until the file is readable
    /// again.
    fn load(&mut self) -> CronStoreFile {
        match self.store.load() {
            Ok(file) => {
                if self.unhealthy {
                    self.unhealthy = false;
                    info!("cron store readable again");
                    self.emit(CronEvent::Health(CronHealthEvent {
                        action: CronHealthAction::Healthy,
                        error: None,
                        consecutive_failures: None,
                    }));
                }
                self.snapshot = file.clone();
                file
            }
            Err(e) => {
                let failures = self.store.consecutive_load_failures();
                if failures >= UNHEALTHY_AFTER_FAILURES && !self.unhealthy {
                    self.unhealthy = true;
                    self.emit(CronEvent::Health(CronHealthEvent {
                        action: CronHealthAction::Unhealthy,
                        error: Some(e.to_string()),
                        consecutive_failures: Some(failures),
                    }));
                }
                self.snapshot.clone()
            }
        }
    }

    fn persist(&mut self, file: &CronStoreFile) {
        match self.store.save(file) {
            Ok(()) => self.snapshot = file.clone(),
            Err(e) => warn!("failed to persist cron store: {e}"),
        }
    }

    // ─── Mutations ───

    fn handle_add(&mut self, create: CronJobCreate) -> Result<CronJob> {
        let mut file = self.load();
        let job = self.normalize_create(create, &file.jobs)?;
        file.jobs.push(job.clone());
        self.persist(&file);
        info!(job_id = %job.id, name = %job.name, "cron job added");
        self.emit_job(CronJobEvent {
            next_run_at_ms: job.state.next_run_at_ms,
            ..CronJobEvent::new(job.id.as_str(), CronJobAction::Added)
        });
        Ok(job)
    }

    fn handle_update(&mut self, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        let mut file = self.load();
        let now = self.now();
        let Some(job) = file.jobs.iter_mut().find(|j| j.id == id) else {
            return Err(CronError::InvalidJob(format!("no such job: {id}")));
        };
        apply_patch(job, patch, now)?;
        let updated = job.clone();
        self.persist(&file);
        info!(job_id = %updated.id, "cron job updated");
        self.emit_job(CronJobEvent {
            next_run_at_ms: updated.state.next_run_at_ms,
            ..CronJobEvent::new(updated.id.as_str(), CronJobAction::Updated)
        });
        Ok(updated)
    }

    fn handle_remove(&mut self, id: &str) -> RemoveResult {
        let mut file = self.load();
        let before = file.jobs.len();
        file.jobs.retain(|j| j.id != id);
        let removed = before - file.jobs.len();
        if removed > 0 {
            self.persist(&file);
            info!(job_id = %id, "cron job removed");
            self.emit_job(CronJobEvent::new(id, CronJobAction::Removed));
        }
        RemoveResult { ok: true, removed }
    }

    async fn handle_run(&mut self, id: &str, mode: RunMode) -> RunResult {
        let mut file = self.load();
        let Some(idx) = file.jobs.iter().position(|j| j.id == id) else {
            return RunResult::not_found();
        };
        if mode == RunMode::Due {
            let now = self.now();
            let job = &file.jobs[idx];
            let due = job.enabled && job.state.next_run_at_ms.is_some_and(|t| t <= now);
            if !due {
                return RunResult::not_due();
            }
        }
        self.execute_job(&mut file, idx, mode == RunMode::Force).await;
        RunResult::ran()
    }

    fn handle_status(&mut self) -> CronStatusSummary {
        let file = self.load();
        let next_wake_at_ms = file
            .jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min();
        CronStatusSummary {
            enabled: self.deps.cron_enabled,
            store_path: self.store.path().display().to_string(),
            jobs: file.jobs.len(),
            next_wake_at_ms,
        }
    }

    // ─── Tick ───

    async fn tick(&mut self) {
        if !self.deps.cron_enabled {
            return;
        }
        let now = self.now();
        let mut file = self.load();

        // Heal jobs whose nextRunAtMs was lost to an external edit.
        let mut healed = false;
        for job in &mut file.jobs {
            if job.enabled && job.state.next_run_at_ms.is_none() {
                job.state.next_run_at_ms = schedule::next_run_at_ms(&job.schedule, now);
                debug!(job_id = %job.id, "initialized missing nextRunAtMs");
                healed = true;
            }
        }

        let due_ids: Vec<String> = file
            .jobs
            .iter()
            .filter(|j| j.enabled && j.state.next_run_at_ms.is_some_and(|t| t <= now))
            .map(|j| j.id.clone())
            .collect();

        if healed && due_ids.is_empty() {
            self.persist(&file);
        }

        // Sequential execution: one job's runtime cannot starve the store,
        // and a failure never touches its neighbors.
        for id in due_ids {
            let Some(idx) = file.jobs.iter().position(|j| j.id == id) else {
                continue;
            };
            let job = &file.jobs[idx];
            if let Some(last) = job.state.last_run_at_ms {
                if schedule::has_missed_occurrence(&job.schedule, last, now) {
                    info!(job_id = %id, "occurrence missed while offline; catching up");
                }
            }
            self.execute_job(&mut file, idx, false).await;
        }
    }

    // ─── Execution wrapper ───

    /// The side-effecting shell around `execute_job_core`: running marker,
    /// started/finished events, duration, taxonomy, reschedule, persist.
    async fn execute_job(
        &mut self,
        file: &mut CronStoreFile,
        idx: usize,
        forced: bool,
    ) -> JobOutcome {
        let job = file.jobs[idx].clone();
        let started_at = self.now();
        if forced {
            debug!(job_id = %job.id, "forced run");
        }
        self.emit_job(CronJobEvent {
            run_at_ms: Some(started_at),
            ..CronJobEvent::new(job.id.as_str(), CronJobAction::Started)
        });
        let cancel = self.running.begin(&job.id, started_at);

        // Pre-check gate.
        let mut gate_skip: Option<JobOutcome> = None;
        let mut message_override: Option<String> = None;
        if let Some(spec) = &job.pre_check {
            let gate = run_pre_check(spec).await;
            if gate.passed {
                if let CronPayload::AgentTurn { message } = &job.payload {
                    message_override = Some(apply_pre_check(spec.mode, &gate.output, message));
                }
            } else {
                let reason = gate.reason.unwrap_or_else(|| "no-go".to_string());
                debug!(job_id = %job.id, %reason, "pre-check no-go");
                gate_skip = Some(
                    JobOutcome::skipped("pre-check-failed")
                        .with_summary(format!("pre-check failed: {reason}")),
                );
            }
        }

        let outcome = match gate_skip {
            Some(outcome) => outcome,
            None => {
                execute_job_core(
                    &job,
                    message_override.as_deref(),
                    self.deps.runtime.as_ref(),
                    cancel,
                )
                .await
            }
        };

        // Cleared unconditionally; the watchdog only ever sees executions
        // that never reached this line.
        self.running.finish();
        let finished_at = self.now();
        let duration_ms = (finished_at - started_at).max(0);

        let failure = if self.deps.failure_taxonomy_enabled {
            classify_failure(&outcome)
        } else {
            None
        };

        let mut event_next_run: Option<i64> = None;
        {
            let job = &mut file.jobs[idx];
            job.state.last_run_at_ms = Some(started_at);
            job.state.last_status = Some(outcome.status);
            job.state.last_error = outcome.error.clone();
            job.state.last_duration_ms = Some(duration_ms);
            job.state.last_summary = outcome.summary.clone();
            if !job.delete_after_run {
                if matches!(job.schedule, CronSchedule::At { .. }) {
                    // One-shots never refire; keep the record for inspection.
                    job.enabled = false;
                    job.state.next_run_at_ms = None;
                } else {
                    event_next_run = schedule::next_run_at_ms(&job.schedule, finished_at);
                    job.state.next_run_at_ms = event_next_run;
                }
            }
        }
        let delete_after_run = file.jobs[idx].delete_after_run;
        let removed_job = delete_after_run.then(|| file.jobs.remove(idx));

        self.persist(file);

        self.emit_job(CronJobEvent {
            job_id: job.id.clone(),
            action: CronJobAction::Finished,
            run_at_ms: Some(started_at),
            duration_ms: Some(duration_ms),
            status: Some(outcome.status),
            error: outcome.error.clone(),
            summary: outcome.summary.clone(),
            next_run_at_ms: event_next_run,
            timed_out: outcome.timed_out,
            stdout_preview: outcome.stdout_preview.clone(),
            failure,
        });
        if let Some(removed) = removed_job {
            info!(job_id = %removed.id, "job removed after run");
            self.emit_job(CronJobEvent::new(removed.id.as_str(), CronJobAction::Removed));
        }

        match outcome.status {
            RunStatus::Ok => {
                info!(job_id = %job.id, duration_ms, "cron job finished")
            }
            RunStatus::Error => {
                warn!(
                    job_id = %job.id,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "cron job failed"
                )
            }
            RunStatus::Skipped => debug!(job_id = %job.id, "cron job skipped"),
        }
        outcome
    }

    // ─── Validation ───

    fn normalize_create(&self, create: CronJobCreate, existing: &[CronJob]) -> Result<CronJob> {
        let now = self.now();
        let name = create.name.trim().to_string();
        if name.is_empty() {
            return Err(CronError::InvalidJob("name must not be empty".into()));
        }
        schedule::validate(&create.schedule).map_err(CronError::InvalidJob)?;
        validate_payload(&create.payload)?;
        if let Some(pre_check) = &create.pre_check {
            validate_pre_check(pre_check)?;
        }

        let id = match create.id {
            Some(id) => {
                let id = id.trim().to_string();
                if id.is_empty() {
                    return Err(CronError::InvalidJob("id must not be empty".into()));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        if existing.iter().any(|j| j.id == id) {
            return Err(CronError::InvalidJob(format!("duplicate job id: {id}")));
        }

        let next_run_at_ms = schedule::next_run_at_ms(&create.schedule, now);
        Ok(CronJob {
            id,
            name,
            enabled: create.enabled,
            delete_after_run: create.delete_after_run,
            created_at_ms: now,
            updated_at_ms: now,
            schedule: create.schedule,
            session_target: create.session_target,
            wake_mode: create.wake_mode,
            payload: create.payload,
            fresh_session: create.fresh_session,
            pre_check: create.pre_check,
            state: CronJobState {
                next_run_at_ms,
                ..Default::default()
            },
        })
    }
}

fn apply_patch(job: &mut CronJob, patch: CronJobPatch, now: i64) -> Result<()> {
    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(CronError::InvalidJob("name must not be empty".into()));
        }
        job.name = name;
    }
    let mut reschedule = false;
    if let Some(sched) = patch.schedule {
        schedule::validate(&sched).map_err(CronError::InvalidJob)?;
        job.schedule = sched;
        reschedule = true;
    }
    if let Some(payload) = patch.payload {
        validate_payload(&payload)?;
        job.payload = payload;
    }
    if let Some(pre_check) = patch.pre_check {
        validate_pre_check(&pre_check)?;
        job.pre_check = Some(pre_check);
    }
    if let Some(target) = patch.session_target {
        job.session_target = target;
    }
    if let Some(wake) = patch.wake_mode {
        job.wake_mode = wake;
    }
    if let Some(delete_after_run) = patch.delete_after_run {
        job.delete_after_run = delete_after_run;
    }
    if let Some(fresh) = patch.fresh_session {
        job.fresh_session = fresh;
    }
    if let Some(enabled) = patch.enabled {
        if enabled && !job.enabled {
            // Re-enabling restarts the clock from now.
            reschedule = true;
        }
        job.enabled = enabled;
    }
    if reschedule {
        job.state.next_run_at_ms = schedule::next_run_at_ms(&job.schedule, now);
    }
    job.updated_at_ms = now;
    Ok(())
}

fn validate_payload(payload: &CronPayload) -> Result<()> {
    match payload {
        CronPayload::Command {
            command,
            timeout_seconds,
            ..
        } => {
            if command.trim().is_empty() {
                return Err(CronError::InvalidJob("command must not be empty".into()));
            }
            if *timeout_seconds == 0 {
                return Err(CronError::InvalidJob(
                    "timeoutSeconds must be positive".into(),
                ));
            }
            Ok(())
        }
        CronPayload::AgentTurn { message } => {
            if message.trim().is_empty() {
                return Err(CronError::InvalidJob("message must not be empty".into()));
            }
            Ok(())
        }
    }
}

fn validate_pre_check(spec: &PreCheckSpec) -> Result<()> {
    if spec.command.trim().is_empty() {
        return Err(CronError::InvalidJob(
            "preCheck command must not be empty".into(),
        ));
    }
    Ok(())
}
