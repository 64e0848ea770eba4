//! Task distribution
//!
//! Enqueueing never waits: a full or closed queue is reported to the caller
//! immediately.

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::task::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, Task, TaskError};

/// Fire-and-forget task dispatch
pub trait TaskDistributor: Send + Sync {
    /// Enqueue a verification email for a new account owner.
    ///
    /// Returns the task id once queued.
    fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
    ) -> Result<Uuid, TaskError>;
}

/// Distributor backed by a bounded in-process queue
#[derive(Clone)]
pub struct ChannelTaskDistributor {
    tx: mpsc::Sender<Task>,
}

impl ChannelTaskDistributor {
    fn enqueue(&self, task: Task) -> Result<Uuid, TaskError> {
        let id = task.id;
        let kind = task.kind;
        match self.tx.try_send(task) {
            Ok(()) => {
                debug!(task_id = %id, kind, "Task enqueued");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task_id = %id, kind, "Task queue full, dropping task");
                Err(TaskError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(task_id = %id, kind, "Task queue closed, dropping task");
                Err(TaskError::QueueClosed)
            }
        }
    }
}

impl TaskDistributor for ChannelTaskDistributor {
    fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
    ) -> Result<Uuid, TaskError> {
        self.enqueue(Task::new(TASK_SEND_VERIFY_EMAIL, payload)?)
    }
}

/// Receiver side of the task queue (owned by the processor)
pub struct TaskReceiver {
    rx: mpsc::Receiver<Task>,
}

impl TaskReceiver {
    pub async fn recv(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Task> {
        self.rx.try_recv().ok()
    }
}

/// Create a bounded task queue
pub fn task_channel(queue_size: usize) -> (ChannelTaskDistributor, TaskReceiver) {
    let (tx, rx) = mpsc::channel(queue_size);
    (ChannelTaskDistributor { tx }, TaskReceiver { rx })
}
