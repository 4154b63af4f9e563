use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tempo_model::{ErrorClass, JobId, TriggerId};
use tokio::sync::broadcast;

use crate::error::Result;

/// Job lifecycle notifications emitted by the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    JobStarted {
        job_id: JobId,
        trigger_id: TriggerId,
        attempt: u32,
    },
    JobCompleted {
        job_id: JobId,
        trigger_id: TriggerId,
        attempt: u32,
    },
    JobFailed {
        job_id: JobId,
        trigger_id: TriggerId,
        attempt: u32,
        class: ErrorClass,
        retryable: bool,
    },
    RetryScheduled {
        job_id: JobId,
        previous_job_id: JobId,
        trigger_id: TriggerId,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Final failure of a firing; the notification collaborator listens here.
    RetryExhausted {
        job_id: JobId,
        trigger_id: TriggerId,
        attempts: u32,
        class: ErrorClass,
        message: String,
    },
    JobCancelled {
        job_id: JobId,
        trigger_id: TriggerId,
    },
    LockDenied {
        trigger_id: TriggerId,
    },
    JobOrphaned {
        job_id: JobId,
        trigger_id: TriggerId,
    },
}

impl EngineEvent {
    pub fn trigger_id(&self) -> TriggerId {
        match self {
            EngineEvent::JobStarted { trigger_id, .. }
            | EngineEvent::JobCompleted { trigger_id, .. }
            | EngineEvent::JobFailed { trigger_id, .. }
            | EngineEvent::RetryScheduled { trigger_id, .. }
            | EngineEvent::RetryExhausted { trigger_id, .. }
            | EngineEvent::JobCancelled { trigger_id, .. }
            | EngineEvent::LockDenied { trigger_id }
            | EngineEvent::JobOrphaned { trigger_id, .. } => *trigger_id,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;
}

/// In-process fan-out of engine events to local observers.
pub struct InProcEventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcEventBus::new(8);
        let mut rx = bus.subscribe();
        let trigger_id = TriggerId::new();

        bus.publish(EngineEvent::LockDenied { trigger_id })
            .await
            .expect("publish");

        let event = rx.recv().await.expect("event");
        assert_eq!(event.trigger_id(), trigger_id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(1);
        bus.publish(EngineEvent::LockDenied {
            trigger_id: TriggerId::new(),
        })
        .await
        .expect("no subscriber is fine");
    }
}
