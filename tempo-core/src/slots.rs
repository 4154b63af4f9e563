//! Fixed-size pool bounding how many jobs run at once in this worker.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, Result};

/// Held for the lifetime of one running job; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotToken {
    _permit: OwnedSemaphorePermit,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ExecutionSlots {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl fmt::Debug for ExecutionSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSlots")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl ExecutionSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&self) -> Option<SlotToken> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| SlotToken {
                _permit: permit,
                acquired_at: Utc::now(),
            })
    }

    /// Waits for a slot.
    pub async fn acquire(&self) -> Result<SlotToken> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        Ok(SlotToken {
            _permit: permit,
            acquired_at: Utc::now(),
        })
    }

    /// Stops handing out slots; pending `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// `(in_use, capacity)`
    pub fn utilization(&self) -> (usize, usize) {
        (self.in_use(), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saturation_blocks_until_release() {
        let slots = ExecutionSlots::new(2);
        let a = slots.try_acquire().expect("slot a");
        let _b = slots.try_acquire().expect("slot b");
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.utilization(), (2, 2));

        drop(a);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[tokio::test]
    async fn closed_pool_rejects_waiters() {
        let slots = ExecutionSlots::new(1);
        let _held = slots.try_acquire().expect("slot");
        slots.close();
        assert!(slots.acquire().await.is_err());
    }
}
