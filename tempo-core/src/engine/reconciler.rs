//! Crash-recovery sweep for jobs left running by a vanished worker.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tempo_model::{ErrorClass, Job, JobError};
use tracing::{debug, info, warn};

use super::executor::Executor;
use crate::config::ReconcileConfig;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;

/// Counts from one sweep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    /// Running jobs old enough to be inspected.
    pub examined: usize,
    pub orphaned: usize,
    /// Retry attempts created for orphaned jobs.
    pub retries: Vec<Job>,
    pub purged_locks: u64,
}

#[derive(Debug)]
pub(crate) struct Reconciler {
    executor: Arc<Executor>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub(crate) fn new(executor: Arc<Executor>, config: ReconcileConfig) -> Self {
        Self { executor, config }
    }

    /// Marks running jobs as failed (orphaned) once they are past
    /// `started_at + max_duration + grace` and the lease they started under
    /// is no longer live.
    /// Orphans go through the normal retry decision.
    pub(crate) async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let grace = TimeDelta::from_std(self.config.grace()).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let candidates = self
            .executor
            .jobs
            .list_running_started_before(cutoff)
            .await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for mut job in candidates {
            if !self.overdue(&job, grace, now) {
                continue;
            }
            let resource = job.trigger_id.resource_id();
            if let Some(lock) = self.executor.locks.inspect(&resource).await?
                && job.is_held_by(&lock)
            {
                debug!(
                    target: "tempo::reconcile",
                    job = %job.id,
                    holder = %lock.holder_id,
                    lease = %lock.lease_id,
                    "overdue job still holds a live lock; leaving it"
                );
                continue;
            }

            job.fail(
                JobError::new(
                    ErrorClass::Orphaned,
                    format!(
                        "worker {} stopped reporting",
                        job.holder_id
                            .as_ref()
                            .map(|h| h.as_str())
                            .unwrap_or("<unknown>")
                    ),
                ),
                now,
            )?;
            match self.executor.jobs.update_job(&job).await {
                Ok(()) => {}
                // Finished between listing and now.
                Err(EngineError::InvalidTransition(_)) => continue,
                Err(err) => return Err(err),
            }

            report.orphaned += 1;
            self.executor.metrics.record_orphan();
            info!(
                target: "tempo::reconcile",
                job = %job.id,
                trigger = %job.trigger_id,
                attempt = job.attempt,
                "recovered orphaned job"
            );
            self.executor
                .publish(EngineEvent::JobOrphaned {
                    job_id: job.id,
                    trigger_id: job.trigger_id,
                })
                .await;

            let trigger = self.executor.triggers.get_trigger(job.trigger_id).await?;
            if let Some(retry) = self
                .executor
                .after_failure(trigger.as_ref(), &job, now)
                .await?
            {
                report.retries.push(retry);
            }
        }

        match self.executor.locks.purge_expired().await {
            Ok(purged) => report.purged_locks = purged,
            Err(err) => {
                warn!(target: "tempo::reconcile", "failed to purge expired locks: {err}");
            }
        }

        Ok(report)
    }

    fn overdue(&self, job: &Job, grace: TimeDelta, now: DateTime<Utc>) -> bool {
        let Some(started) = job.started_at else {
            return false;
        };
        let max = TimeDelta::from_std(job.max_duration()).unwrap_or(TimeDelta::MAX);
        started
            .checked_add_signed(max)
            .and_then(|t| t.checked_add_signed(grace))
            .is_some_and(|limit| limit < now)
    }
}
