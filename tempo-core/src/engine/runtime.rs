use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tempo_model::{HolderId, Job, JobId, TriggerId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::executor::{Claim, Executor};
use super::health::{EngineHealth, EngineMetrics};
use super::reconciler::{Reconciler, SweepReport};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventPublisher, InProcEventBus};
use crate::handler::HandlerRegistry;
use crate::lock::LockManager;
use crate::queue::{PollSummary, SchedulingQueue, WorkItem};
use crate::slots::{ExecutionSlots, SlotToken};
use crate::store::{JobStore, TriggerStore};

/// Largest page `get_job_history` returns.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Everything a dispatched item needs, cloned into each job task.
#[derive(Clone, Debug)]
struct Dispatch {
    queue: Arc<SchedulingQueue>,
    executor: Arc<Executor>,
    slots: ExecutionSlots,
    tasks: TaskTracker,
}

impl Dispatch {
    /// Starts as many ready items as there are free slots. Items stay in
    /// the heap while the pool is saturated.
    async fn dispatch_ready(&self) -> usize {
        let mut started = 0usize;
        loop {
            let Some(slot) = self.slots.try_acquire() else {
                break;
            };
            let Some(item) = self.queue.dequeue_ready(Utc::now()).await else {
                break;
            };
            self.spawn_item(item, slot);
            started += 1;
        }
        started
    }

    fn spawn_item(&self, item: WorkItem, slot: SlotToken) {
        let ctx = self.clone();
        self.tasks.spawn(async move {
            let _slot = slot;
            let key = item.key();
            match ctx.executor.claim(&item, Utc::now()).await {
                Ok(Some(claim)) => ctx.run_claim(claim).await,
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    warn!(
                        target: "tempo::engine",
                        trigger = %item.trigger_id,
                        "skipping item, store unavailable: {err}"
                    );
                }
                Err(err) => {
                    error!(
                        target: "tempo::engine",
                        trigger = %item.trigger_id,
                        kind = ?item.kind,
                        "failed to claim work item: {err}"
                    );
                }
            }
            ctx.queue.mark_done(key).await;
        });
    }

    async fn run_claim(&self, claim: Claim) {
        let job_id = claim.job.id;
        match self.executor.run(claim).await {
            Ok(report) => {
                if let Some(retry) = report.retry {
                    self.queue.push(WorkItem::attempt(&retry)).await;
                }
            }
            Err(err) => {
                warn!(
                    target: "tempo::engine",
                    job = %job_id,
                    "job run did not record an outcome: {err}"
                );
            }
        }
    }
}

/// A running engine instance: the poller, dispatcher and reconciler loops
/// plus the operational API.
pub struct EngineRuntime {
    config: Arc<EngineConfig>,
    dispatch: Dispatch,
    reconciler: Arc<Reconciler>,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EngineRuntime");
        debug
            .field("worker", self.dispatch.executor.holder())
            .field("slots", &self.dispatch.slots)
            .field("queue", &self.dispatch.queue)
            .field("shutting_down", &self.shutdown.is_cancelled());
        match self.loops.try_lock() {
            Ok(loops) => {
                debug.field("loops", &loops.len());
            }
            Err(_) => {
                debug.field("loops", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl EngineRuntime {
    pub fn builder(config: EngineConfig) -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &HolderId {
        self.dispatch.executor.holder()
    }

    /// Shared handler registry; handlers may be added while running.
    pub fn handlers(&self) -> &HandlerRegistry {
        self.dispatch.executor.handlers()
    }

    /// Rebuilds the queue from the store and starts the background loops.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Internal("engine already started".into()));
        }

        match self.dispatch.queue.recover(Utc::now()).await {
            Ok(summary) => info!(
                target: "tempo::engine",
                fetched = summary.fetched,
                enqueued = summary.enqueued,
                "recovered queue from store"
            ),
            Err(err) if err.is_transient() => warn!(
                target: "tempo::engine",
                "store unavailable during recovery, next poll retries: {err}"
            ),
            Err(err) => return Err(err),
        }

        let mut loops = self.loops.lock().await;
        loops.push(self.spawn_poller());
        loops.push(self.spawn_dispatcher());
        loops.push(self.spawn_reconciler());

        info!(
            target: "tempo::engine",
            worker = %self.worker_id(),
            slots = self.dispatch.slots.capacity(),
            lock_backend = self.dispatch.executor.locks.backend(),
            handlers = self.handlers().len(),
            "engine started"
        );
        Ok(())
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.dispatch.queue);
        let shutdown = self.shutdown.clone();
        let period = self.config.queue.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Recovery already polled once.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match queue.poll(Utc::now()).await {
                    Ok(summary) => trace!(
                        target: "tempo::engine",
                        fetched = summary.fetched,
                        enqueued = summary.enqueued,
                        "poll cycle"
                    ),
                    Err(err) if err.is_transient() => warn!(
                        target: "tempo::engine",
                        "store unavailable, skipping poll cycle: {err}"
                    ),
                    Err(err) => error!(target: "tempo::engine", "poll cycle failed: {err}"),
                }
            }
            debug!(target: "tempo::engine", "poller stopped");
        })
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let dispatch = self.dispatch.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.queue.dispatch_tick();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let started = dispatch.dispatch_ready().await;
                if started > 0 {
                    trace!(target: "tempo::engine", started, "dispatched work");
                }
            }
            debug!(target: "tempo::engine", "dispatcher stopped");
        })
    }

    fn spawn_reconciler(&self) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let queue = Arc::clone(&self.dispatch.queue);
        let shutdown = self.shutdown.clone();
        let period = self.config.reconcile.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match reconciler.sweep(Utc::now()).await {
                    Ok(report) => {
                        for retry in &report.retries {
                            queue.push(WorkItem::attempt(retry)).await;
                        }
                    }
                    Err(err) if err.is_transient() => warn!(
                        target: "tempo::reconcile",
                        "store unavailable, skipping sweep: {err}"
                    ),
                    Err(err) => error!(target: "tempo::reconcile", "sweep failed: {err}"),
                }
            }
            debug!(target: "tempo::engine", "reconciler stopped");
        })
    }

    /// Runs one poll cycle now instead of waiting for the next tick.
    pub async fn poll_now(&self) -> Result<PollSummary> {
        self.dispatch.queue.poll(Utc::now()).await
    }

    /// Runs one reconciliation sweep now.
    pub async fn reconcile_now(&self) -> Result<SweepReport> {
        let report = self.reconciler.sweep(Utc::now()).await?;
        for retry in &report.retries {
            self.dispatch.queue.push(WorkItem::attempt(retry)).await;
        }
        Ok(report)
    }

    /// Runs a trigger immediately, outside its schedule. Waits for a free
    /// slot, then fails with `LockDenied` if the trigger is already
    /// executing. `next_due_at` is left alone.
    pub async fn trigger_manual_execution(&self, trigger_id: TriggerId) -> Result<JobId> {
        self.ensure_accepting()?;
        let slot = tokio::select! {
            slot = self.dispatch.slots.acquire() => slot?,
            _ = self.shutdown.cancelled() => {
                return Err(EngineError::ShuttingDown);
            }
        };
        let claim = self
            .dispatch
            .executor
            .claim_manual(trigger_id, Utc::now())
            .await?;
        let job_id = claim.job.id;
        info!(
            target: "tempo::engine",
            trigger = %trigger_id,
            job = %job_id,
            "manual execution requested"
        );

        let dispatch = self.dispatch.clone();
        self.dispatch.tasks.spawn(async move {
            let _slot = slot;
            dispatch.run_claim(claim).await;
        });
        Ok(job_id)
    }

    /// Queues an immediate firing of an active trigger. Returns `false`
    /// when the trigger is inactive or a firing is already queued here.
    pub async fn signal_trigger(&self, trigger_id: TriggerId) -> Result<bool> {
        self.ensure_accepting()?;
        let trigger = self
            .dispatch
            .executor
            .triggers
            .get_trigger(trigger_id)
            .await?
            .ok_or(EngineError::TriggerNotFound(trigger_id))?;
        if !trigger.active {
            return Ok(false);
        }
        Ok(self
            .dispatch
            .queue
            .push(WorkItem::signal(&trigger, Utc::now()))
            .await)
    }

    /// Cancels a pending or running job. Jobs running in this worker are
    /// interrupted; jobs running elsewhere are marked cancelled and their
    /// late result is discarded. Returns `false` for terminal jobs.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        let executor = &self.dispatch.executor;
        if executor.cancel_running(job_id) {
            info!(target: "tempo::engine", job = %job_id, "cancellation requested");
            return Ok(true);
        }

        let mut job = executor
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        if job.is_terminal() {
            return Ok(false);
        }
        job.cancel("cancelled by request", Utc::now())?;
        match executor.jobs.update_job(&job).await {
            Ok(()) => {}
            Err(EngineError::InvalidTransition(_)) => return Ok(false),
            Err(err) => return Err(err),
        }
        info!(target: "tempo::engine", job = %job_id, "job cancelled");
        executor
            .publish(EngineEvent::JobCancelled {
                job_id,
                trigger_id: job.trigger_id,
            })
            .await;
        Ok(true)
    }

    /// A trigger's jobs, newest first. `page` is zero-based; `page_size` is
    /// clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn get_job_history(
        &self,
        trigger_id: TriggerId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Job>> {
        self.dispatch
            .executor
            .jobs
            .list_jobs_for_trigger(trigger_id, page, page_size.clamp(1, MAX_PAGE_SIZE))
            .await
    }

    pub async fn health(&self) -> EngineHealth {
        let executor = &self.dispatch.executor;
        let (active_workers, slot_capacity) = self.dispatch.slots.utilization();
        EngineHealth {
            worker_id: executor.holder().to_string(),
            lock_backend: executor.locks.backend().to_string(),
            active_workers,
            slot_capacity,
            queue_depth: self.dispatch.queue.depth().await,
            in_flight: self.dispatch.queue.in_flight().await,
            running_jobs: executor.running_jobs(),
            lock_contention_rate: self.metrics.lock_contention_rate(),
            avg_dispatch_latency_ms: self.metrics.avg_dispatch_latency_ms(),
            handlers: executor.handlers().len(),
            accepting_work: self.started.load(Ordering::SeqCst)
                && !self.shutdown.is_cancelled(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Stops the loops, waits up to the shutdown grace for running jobs,
    /// then interrupts what is left. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(target: "tempo::engine", "engine shutting down");
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.loops.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target: "tempo::engine", "engine loop exited abnormally: {err}");
            }
        }

        let tasks = &self.dispatch.tasks;
        tasks.close();
        let grace = self.config.executor.shutdown_grace();
        if tokio::time::timeout(grace, tasks.wait()).await.is_err() {
            warn!(
                target: "tempo::engine",
                running = self.dispatch.executor.running_jobs(),
                "shutdown grace elapsed, interrupting running jobs"
            );
            self.abort.cancel();
            if tokio::time::timeout(grace, tasks.wait()).await.is_err() {
                warn!(
                    target: "tempo::engine",
                    "jobs still running after interruption, their locks lapse by TTL"
                );
            }
        }
        self.dispatch.slots.close();
        info!(target: "tempo::engine", "engine stopped");
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }
}

/// Helper for constructing a runtime with explicit dependencies.
pub struct EngineRuntimeBuilder {
    config: EngineConfig,
    triggers: Option<Arc<dyn TriggerStore>>,
    jobs: Option<Arc<dyn JobStore>>,
    locks: Option<Arc<dyn LockManager>>,
    events: Option<Arc<dyn EventPublisher>>,
    handlers: HandlerRegistry,
}

impl fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("config", &self.config)
            .field("triggers_set", &self.triggers.is_some())
            .field("jobs_set", &self.jobs.is_some())
            .field("locks_set", &self.locks.is_some())
            .field("events_set", &self.events.is_some())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EngineRuntimeBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            triggers: None,
            jobs: None,
            locks: None,
            events: None,
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn with_triggers(mut self, triggers: Arc<dyn TriggerStore>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Uses one backend for both triggers and jobs.
    pub fn with_store<S>(self, store: Arc<S>) -> Self
    where
        S: TriggerStore + JobStore + 'static,
    {
        let triggers: Arc<dyn TriggerStore> = store.clone();
        let jobs: Arc<dyn JobStore> = store;
        self.with_triggers(triggers).with_jobs(jobs)
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn build(self) -> Result<EngineRuntime> {
        self.config.validate()?;
        let triggers = self
            .triggers
            .ok_or_else(|| EngineError::Internal("trigger store dependency missing".into()))?;
        let jobs = self
            .jobs
            .ok_or_else(|| EngineError::Internal("job store dependency missing".into()))?;
        let locks = self
            .locks
            .ok_or_else(|| EngineError::Internal("lock manager dependency missing".into()))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.events.capacity)));

        let config = Arc::new(self.config);
        let holder = HolderId::new(config.executor.resolve_worker_id());
        let metrics = Arc::new(EngineMetrics::default());
        let abort = CancellationToken::new();

        let queue = Arc::new(SchedulingQueue::new(
            Arc::clone(&triggers),
            Arc::clone(&jobs),
            config.queue.poll_batch_limit,
        ));
        let executor = Arc::new(Executor::new(
            triggers,
            jobs,
            locks,
            self.handlers,
            events,
            Arc::clone(&metrics),
            Arc::clone(&config),
            holder,
            abort.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&executor), config.reconcile));

        Ok(EngineRuntime {
            dispatch: Dispatch {
                queue,
                executor,
                slots: ExecutionSlots::new(config.executor.slots),
                tasks: TaskTracker::new(),
            },
            reconciler,
            metrics,
            shutdown: CancellationToken::new(),
            abort,
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            config,
        })
    }
}
