//! Claims queued work under the trigger's execution lock, runs the handler
//! inside an execution slot, and records the outcome.
//!
//! Every claimed lock is released on every path out of [`Executor::run`],
//! including handler failure, panic, timeout and cancellation.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tempo_model::{
    ErrorClass, ExecutionLock, HolderId, Job, JobError, JobId, JobOrigin, JobState,
    OutcomeSummary, RetryPolicy, Trigger, TriggerId,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::heartbeat::Heartbeat;
use super::health::EngineMetrics;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::handler::{ExecutionContext, HandlerRegistry};
use crate::lock::LockManager;
use crate::queue::{WorkItem, WorkKind};
use crate::retry;
use crate::schedule;
use crate::store::{JobStore, TriggerStore};

const OUTCOME_RETRY_MIN: Duration = Duration::from_millis(50);
const OUTCOME_RETRY_MAX: Duration = Duration::from_secs(1);

/// A job ready to run, with the lock that guards it.
#[derive(Debug)]
pub(crate) struct Claim {
    pub trigger: Trigger,
    pub job: Job,
    pub lock: ExecutionLock,
}

/// Final state of one run and the retry it produced, if any.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub job: Job,
    pub retry: Option<Job>,
}

#[derive(Debug)]
enum Outcome {
    Completed(Value),
    Failed { class: ErrorClass, message: String },
    Cancelled(String),
}

#[derive(Debug)]
struct RunningJob {
    token: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

/// Drops the running entry even if the run unwinds.
struct RunningGuard<'a> {
    running: &'a DashMap<JobId, RunningJob>,
    job_id: JobId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

pub(crate) struct Executor {
    pub(crate) triggers: Arc<dyn TriggerStore>,
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) locks: Arc<dyn LockManager>,
    handlers: HandlerRegistry,
    events: Arc<dyn EventPublisher>,
    pub(crate) metrics: Arc<EngineMetrics>,
    config: Arc<EngineConfig>,
    holder: HolderId,
    running: DashMap<JobId, RunningJob>,
    /// Parent of every job token; cancelled when shutdown gives up waiting.
    abort: CancellationToken,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("holder", &self.holder)
            .field("lock_backend", &self.locks.backend())
            .field("handlers", &self.handlers.len())
            .field("running", &self.running.len())
            .finish()
    }
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        triggers: Arc<dyn TriggerStore>,
        jobs: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        handlers: HandlerRegistry,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<EngineMetrics>,
        config: Arc<EngineConfig>,
        holder: HolderId,
        abort: CancellationToken,
    ) -> Self {
        Self {
            triggers,
            jobs,
            locks,
            handlers,
            events,
            metrics,
            config,
            holder,
            running: DashMap::new(),
            abort,
        }
    }

    pub(crate) fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub(crate) fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub(crate) fn running_jobs(&self) -> usize {
        self.running.len()
    }

    /// Interrupts a job running in this worker. Returns `false` when the job
    /// is not running here.
    pub(crate) fn cancel_running(&self, job_id: JobId) -> bool {
        match self.running.get(&job_id) {
            Some(entry) => {
                entry.cancel_requested.store(true, Ordering::SeqCst);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Takes the lock for a queued item and turns it into a runnable job.
    /// `None` means someone else holds the lock or the item went stale.
    pub(crate) async fn claim(
        &self,
        item: &WorkItem,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>> {
        let Some(lock) = self.acquire(item.trigger_id).await? else {
            return Ok(None);
        };
        match self.prepare(item, now).await {
            Ok(Some((trigger, job))) => Ok(Some(Claim { trigger, job, lock })),
            Ok(None) => {
                self.release(&lock).await;
                Ok(None)
            }
            Err(err) => {
                self.release(&lock).await;
                Err(err)
            }
        }
    }

    /// Claim for an operator-requested run. Fails with `LockDenied` instead
    /// of skipping when the trigger is already executing.
    pub(crate) async fn claim_manual(
        &self,
        trigger_id: TriggerId,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let trigger = self
            .triggers
            .get_trigger(trigger_id)
            .await?
            .ok_or(EngineError::TriggerNotFound(trigger_id))?;
        let Some(lock) = self.acquire(trigger_id).await? else {
            return Err(EngineError::LockDenied(
                trigger_id.resource_id().to_string(),
            ));
        };
        let job = self.new_job(&trigger, JobOrigin::Manual, now);
        if let Err(err) = self.jobs.insert_job(&job).await {
            self.release(&lock).await;
            return Err(err);
        }
        Ok(Claim { trigger, job, lock })
    }

    /// Runs a claimed job to a terminal state and releases its lock.
    pub(crate) async fn run(&self, claim: Claim) -> Result<RunReport> {
        let Claim {
            trigger,
            mut job,
            lock,
        } = claim;
        let token = self.abort.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.running.insert(
            job.id,
            RunningJob {
                token: token.clone(),
                cancel_requested: Arc::clone(&cancel_requested),
            },
        );
        let guard = RunningGuard {
            running: &self.running,
            job_id: job.id,
        };
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&self.locks),
            lock.clone(),
            self.config.lock,
            token.clone(),
        );

        let result = self
            .execute(&trigger, &mut job, &lock, &token, &heartbeat, &cancel_requested)
            .await;

        heartbeat.stop().await;
        drop(guard);
        self.release(&lock).await;
        result
    }

    async fn execute(
        &self,
        trigger: &Trigger,
        job: &mut Job,
        lock: &ExecutionLock,
        token: &CancellationToken,
        heartbeat: &Heartbeat,
        cancel_requested: &AtomicBool,
    ) -> Result<RunReport> {
        let started = Utc::now();
        job.start_under(lock, started)?;
        self.jobs.update_job(job).await?;
        self.metrics
            .record_dispatch(job.next_retry_at.unwrap_or(job.scheduled_for), started);
        info!(
            target: "tempo::executor",
            job = %job.id,
            trigger = %job.trigger_id,
            attempt = job.attempt,
            task_type = %trigger.execution.task_type,
            origin = job.origin.as_str(),
            "job started"
        );
        self.publish(EngineEvent::JobStarted {
            job_id: job.id,
            trigger_id: job.trigger_id,
            attempt: job.attempt,
        })
        .await;

        let outcome = self
            .invoke(trigger, job, token, heartbeat, cancel_requested)
            .await;
        self.finish(trigger, job, outcome, heartbeat).await
    }

    async fn invoke(
        &self,
        trigger: &Trigger,
        job: &Job,
        token: &CancellationToken,
        heartbeat: &Heartbeat,
        cancel_requested: &AtomicBool,
    ) -> Outcome {
        let task_type = &trigger.execution.task_type;
        let Some(handler) = self.handlers.lookup(task_type) else {
            return Outcome::Failed {
                class: ErrorClass::HandlerNotFound,
                message: EngineError::HandlerNotFound(task_type.clone()).to_string(),
            };
        };

        let max_duration = job.max_duration();
        let started = job.started_at.unwrap_or_else(Utc::now);
        let deadline = TimeDelta::from_std(max_duration)
            .ok()
            .and_then(|delta| started.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let ctx = ExecutionContext {
            job_id: job.id,
            trigger_id: job.trigger_id,
            attempt: job.attempt,
            deadline,
            cancellation: token.clone(),
        };
        let payload = trigger.execution.payload.clone();
        let call = AssertUnwindSafe(async move { handler.execute(payload, ctx).await })
            .catch_unwind();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                if cancel_requested.load(Ordering::SeqCst) {
                    Outcome::Cancelled("cancelled by request".into())
                } else if heartbeat.lost() {
                    Outcome::Failed {
                        class: ErrorClass::LockLost,
                        message: "execution lock lost while running".into(),
                    }
                } else {
                    Outcome::Failed {
                        class: ErrorClass::Execution,
                        message: "interrupted by worker shutdown".into(),
                    }
                }
            }
            result = tokio::time::timeout(max_duration, call) => match result {
                Ok(Ok(Ok(value))) => Outcome::Completed(value),
                Ok(Ok(Err(err))) if err.fatal => Outcome::Failed {
                    class: ErrorClass::Fatal,
                    message: err.message,
                },
                Ok(Ok(Err(err))) => Outcome::Failed {
                    class: ErrorClass::Execution,
                    message: err.message,
                },
                Ok(Err(panic)) => {
                    // Work the handler spawned must not outlive it.
                    token.cancel();
                    let message = format!("handler panicked: {}", panic_message(&*panic));
                    error!(
                        target: "tempo::executor",
                        job = %job.id,
                        trigger = %job.trigger_id,
                        task_type = %task_type,
                        "{message}"
                    );
                    Outcome::Failed {
                        class: ErrorClass::Fatal,
                        message,
                    }
                }
                Err(_) => {
                    // Let work the handler spawned observe the deadline too.
                    token.cancel();
                    Outcome::Failed {
                        class: ErrorClass::Timeout,
                        message: EngineError::HandlerTimeout(max_duration).to_string(),
                    }
                }
            },
        }
    }

    async fn finish(
        &self,
        trigger: &Trigger,
        job: &mut Job,
        outcome: Outcome,
        heartbeat: &Heartbeat,
    ) -> Result<RunReport> {
        let now = Utc::now();
        match outcome {
            Outcome::Completed(value) => {
                job.complete(value, now)?;
                self.persist_outcome(job, heartbeat).await?;
                self.metrics.record_completed();
                info!(
                    target: "tempo::executor",
                    job = %job.id,
                    trigger = %job.trigger_id,
                    attempt = job.attempt,
                    "job completed"
                );
                self.publish(EngineEvent::JobCompleted {
                    job_id: job.id,
                    trigger_id: job.trigger_id,
                    attempt: job.attempt,
                })
                .await;
                self.record_outcome(job, now).await;
                Ok(RunReport {
                    job: job.clone(),
                    retry: None,
                })
            }
            Outcome::Cancelled(reason) => {
                job.cancel(reason, now)?;
                self.persist_outcome(job, heartbeat).await?;
                info!(
                    target: "tempo::executor",
                    job = %job.id,
                    trigger = %job.trigger_id,
                    "job cancelled"
                );
                self.publish(EngineEvent::JobCancelled {
                    job_id: job.id,
                    trigger_id: job.trigger_id,
                })
                .await;
                self.record_outcome(job, now).await;
                Ok(RunReport {
                    job: job.clone(),
                    retry: None,
                })
            }
            Outcome::Failed { class, message } => {
                job.fail(JobError::new(class, message), now)?;
                self.persist_outcome(job, heartbeat).await?;
                let retry = self.after_failure(Some(trigger), job, now).await?;
                Ok(RunReport {
                    job: job.clone(),
                    retry,
                })
            }
        }
    }

    /// Writes the terminal state of `job`, retrying transient store errors
    /// while the lease is still ours. Gives up once the lease is lost, the
    /// engine aborts, or one lock TTL has passed.
    async fn persist_outcome(&self, job: &Job, heartbeat: &Heartbeat) -> Result<()> {
        let budget = self.config.lock.ttl();
        let started = tokio::time::Instant::now();
        let mut backoff = OUTCOME_RETRY_MIN;
        loop {
            let err = match self.jobs.update_job(job).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };
            if heartbeat.lost()
                || self.abort.is_cancelled()
                || started.elapsed() + backoff >= budget
            {
                error!(
                    target: "tempo::executor",
                    job = %job.id,
                    state = %job.state,
                    "giving up on recording job outcome: {err}"
                );
                return Err(err);
            }
            warn!(
                target: "tempo::executor",
                job = %job.id,
                state = %job.state,
                retry_in_ms = backoff.as_millis() as u64,
                "failed to record job outcome, retrying: {err}"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(OUTCOME_RETRY_MAX);
        }
    }

    /// Decides what follows a failed attempt: a new pending attempt when
    /// the error is retryable and attempts remain, otherwise final failure.
    /// `job` must already be persisted as failed.
    pub(crate) async fn after_failure(
        &self,
        trigger: Option<&Trigger>,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let (class, message) = job
            .error
            .as_ref()
            .map(|err| (err.class, err.message.clone()))
            .unwrap_or((ErrorClass::Execution, String::new()));
        let retryable = class.is_retryable();
        self.metrics.record_failed();
        warn!(
            target: "tempo::executor",
            job = %job.id,
            trigger = %job.trigger_id,
            attempt = job.attempt,
            class = %class,
            retryable,
            "job failed: {message}"
        );
        self.publish(EngineEvent::JobFailed {
            job_id: job.id,
            trigger_id: job.trigger_id,
            attempt: job.attempt,
            class,
            retryable,
        })
        .await;

        let policy = RetryPolicy {
            max_attempts: job.max_attempts,
            ..self
                .config
                .retry
                .policy_for(trigger.and_then(|t| t.execution.retry_policy.as_deref()))
        };

        if retryable && trigger.is_some() && retry::should_retry(job.attempt, &policy) {
            let delay = retry::next_delay(job.attempt.saturating_sub(1), &policy);
            let run_at = TimeDelta::from_std(delay)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let next = job.next_attempt(run_at);
            self.jobs.insert_job(&next).await?;
            self.metrics.record_retry();
            info!(
                target: "tempo::executor",
                job = %next.id,
                previous = %job.id,
                trigger = %job.trigger_id,
                attempt = next.attempt,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            );
            self.publish(EngineEvent::RetryScheduled {
                job_id: next.id,
                previous_job_id: job.id,
                trigger_id: job.trigger_id,
                attempt: next.attempt,
                next_attempt_at: run_at,
            })
            .await;
            self.record_outcome(job, now).await;
            return Ok(Some(next));
        }

        error!(
            target: "tempo::executor",
            job = %job.id,
            trigger = %job.trigger_id,
            attempts = job.attempt,
            class = %class,
            "firing failed permanently: {message}"
        );
        self.publish(EngineEvent::RetryExhausted {
            job_id: job.id,
            trigger_id: job.trigger_id,
            attempts: job.attempt,
            class,
            message,
        })
        .await;
        if trigger.is_some() {
            self.record_outcome(job, now).await;
        }
        Ok(None)
    }

    pub(crate) async fn publish(&self, event: EngineEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(target: "tempo::events", "failed to publish engine event: {err}");
        }
    }

    async fn acquire(&self, trigger_id: TriggerId) -> Result<Option<ExecutionLock>> {
        let lock = self
            .locks
            .acquire(
                &trigger_id.resource_id(),
                &self.holder,
                self.config.lock.ttl(),
            )
            .await?
            .into_lock();
        self.metrics.record_lock_attempt(lock.is_some());
        if lock.is_none() {
            debug!(
                target: "tempo::executor",
                trigger = %trigger_id,
                "execution lock held elsewhere; skipping"
            );
            self.publish(EngineEvent::LockDenied { trigger_id }).await;
        }
        Ok(lock)
    }

    async fn release(&self, lock: &ExecutionLock) {
        match self.locks.release(lock).await {
            Ok(true) => {
                trace!(target: "tempo::executor", resource = %lock.resource_id, "lock released");
            }
            Ok(false) => {
                debug!(
                    target: "tempo::executor",
                    resource = %lock.resource_id,
                    "lock already expired or taken over at release"
                );
            }
            // The TTL frees it eventually.
            Err(err) => {
                warn!(
                    target: "tempo::executor",
                    resource = %lock.resource_id,
                    "failed to release lock: {err}"
                );
            }
        }
    }

    /// Re-validates a queued item against the store while holding the lock.
    async fn prepare(
        &self,
        item: &WorkItem,
        now: DateTime<Utc>,
    ) -> Result<Option<(Trigger, Job)>> {
        let Some(trigger) = self.triggers.get_trigger(item.trigger_id).await? else {
            debug!(target: "tempo::executor", trigger = %item.trigger_id, "trigger vanished before execution");
            return Ok(None);
        };

        match item.kind {
            WorkKind::Scheduled => {
                if !trigger.active || trigger.next_due_at != Some(item.due_at) {
                    return Ok(None);
                }
                let next = match schedule::next_due_after(&trigger.schedule, item.due_at, now) {
                    Ok(next) => next,
                    Err(err) => {
                        error!(
                            target: "tempo::executor",
                            trigger = %trigger.id,
                            "cannot compute next due time, firing once more and parking: {err}"
                        );
                        None
                    }
                };
                if !self
                    .triggers
                    .advance_next_due(trigger.id, item.due_at, next)
                    .await?
                {
                    debug!(target: "tempo::executor", trigger = %trigger.id, "firing already claimed");
                    return Ok(None);
                }
                let job = self.new_job(&trigger, JobOrigin::Schedule, item.due_at);
                if let Err(err) = self.jobs.insert_job(&job).await {
                    // Put the firing back so a later poll picks it up again.
                    if let Err(restore) = self
                        .triggers
                        .reschedule_trigger(trigger.id, Some(item.due_at))
                        .await
                    {
                        error!(
                            target: "tempo::executor",
                            trigger = %trigger.id,
                            due = %item.due_at,
                            "firing lost, could not restore due time: {restore}"
                        );
                    }
                    return Err(err);
                }
                Ok(Some((trigger, job)))
            }
            WorkKind::Signal => {
                if !trigger.active {
                    return Ok(None);
                }
                let job = self.new_job(&trigger, JobOrigin::Event, item.due_at);
                self.jobs.insert_job(&job).await?;
                Ok(Some((trigger, job)))
            }
            WorkKind::Attempt(job_id) => {
                let Some(mut job) = self.jobs.get_job(job_id).await? else {
                    return Ok(None);
                };
                if job.state != JobState::Pending {
                    return Ok(None);
                }
                if !trigger.active && job.origin != JobOrigin::Manual {
                    job.cancel("trigger deactivated", now)?;
                    self.jobs.update_job(&job).await?;
                    return Ok(None);
                }
                Ok(Some((trigger, job)))
            }
        }
    }

    fn new_job(&self, trigger: &Trigger, origin: JobOrigin, scheduled_for: DateTime<Utc>) -> Job {
        let policy = self
            .config
            .retry
            .policy_for(trigger.execution.retry_policy.as_deref());
        Job::new(
            trigger.id,
            origin,
            scheduled_for,
            policy.max_attempts,
            trigger.execution.max_duration(),
        )
        .with_priority(trigger.priority)
    }

    async fn record_outcome(&self, job: &Job, now: DateTime<Utc>) {
        let summary = OutcomeSummary {
            state: job.state,
            attempt: job.attempt,
            message: job.error.as_ref().map(|err| err.message.clone()),
        };
        if let Err(err) = self
            .triggers
            .update_trigger_schedule_state(job.trigger_id, None, now, summary)
            .await
        {
            warn!(
                target: "tempo::executor",
                trigger = %job.trigger_id,
                "failed to record trigger outcome: {err}"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else {
        "unknown panic"
    }
}
