use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tempo_model::ExecutionLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::config::LockConfig;
use crate::lock::{LockManager, Renewal};

const MIN_SLEEP: Duration = Duration::from_millis(10);
const RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Background lock renewal for one running job. Dropping it stops the
/// renewals, so an unwinding run never leaves a lock alive behind it.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts renewing `lock`. If the lock is lost, `on_lost` is cancelled
    /// so the handler stops before someone else starts the same work.
    pub(crate) fn spawn(
        locks: Arc<dyn LockManager>,
        lock: ExecutionLock,
        config: LockConfig,
        on_lost: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(renew_loop(
            locks,
            lock,
            config,
            stop.clone(),
            Arc::clone(&lost),
            on_lost,
        ));
        Self { stop, lost, handle }
    }

    pub(crate) fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing and waits for the task to wind down.
    pub(crate) async fn stop(mut self) -> bool {
        self.stop.cancel();
        if let Err(err) = (&mut self.handle).await {
            warn!(target: "tempo::lock", "heartbeat task failed: {err}");
        }
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// How long to sleep before the next renewal: wake once the remaining TTL
/// drops below `renew_at_fraction` of the TTL or the minimum margin,
/// whichever is larger.
pub(crate) fn renewal_delay(remaining: Duration, config: &LockConfig) -> Duration {
    let threshold = config
        .ttl()
        .mul_f32(config.renew_at_fraction.clamp(0.0, 1.0))
        .max(config.renew_margin());
    remaining.saturating_sub(threshold).max(MIN_SLEEP)
}

async fn renew_loop(
    locks: Arc<dyn LockManager>,
    mut lock: ExecutionLock,
    config: LockConfig,
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
    on_lost: CancellationToken,
) {
    let mut sleep_for = renewal_delay(lock.remaining(Utc::now()), &config);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }

        match locks.heartbeat(&lock, config.ttl()).await {
            Ok(Renewal::Extended(renewed)) => {
                trace!(
                    target: "tempo::lock",
                    resource = %renewed.resource_id,
                    renewals = renewed.renewals,
                    "lock renewed"
                );
                lock = renewed;
                sleep_for = renewal_delay(lock.remaining(Utc::now()), &config);
            }
            Ok(Renewal::Lost) => {
                warn!(
                    target: "tempo::lock",
                    resource = %lock.resource_id,
                    holder = %lock.holder_id,
                    "execution lock lost; interrupting job"
                );
                lost.store(true, Ordering::SeqCst);
                on_lost.cancel();
                break;
            }
            Err(err) => {
                let remaining = lock.remaining(Utc::now());
                if remaining.is_zero() {
                    warn!(
                        target: "tempo::lock",
                        resource = %lock.resource_id,
                        "lock expired while renewals were failing: {err}"
                    );
                    lost.store(true, Ordering::SeqCst);
                    on_lost.cancel();
                    break;
                }
                warn!(
                    target: "tempo::lock",
                    resource = %lock.resource_id,
                    "lock renewal failed, retrying: {err}"
                );
                sleep_for = RETRY_SLEEP.min(remaining / 2).max(MIN_SLEEP);
            }
        }
    }
}
