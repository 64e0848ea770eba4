//! Task Processor
//!
//! Background worker that drains the task queue until shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::distributor::TaskReceiver;
use super::task::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, Task, TaskError};

pub struct TaskProcessor {
    receiver: TaskReceiver,
}

impl TaskProcessor {
    pub fn new(receiver: TaskReceiver) -> Self {
        Self { receiver }
    }

    /// Run until `shutdown` fires or every distributor is dropped.
    ///
    /// Tasks already queued when `shutdown` fires are still handled before
    /// returning. Returns the number of tasks handled successfully. A failing
    /// task is logged and skipped; it never stops the loop.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        info!("Starting task processor");
        let mut processed = 0;

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = self.receiver.recv() => task,
            };

            let Some(task) = task else {
                info!(processed, "Task queue closed, processor exiting");
                break;
            };
            processed += handle(&task);
        }

        if shutdown.is_cancelled() {
            while let Some(task) = self.receiver.try_recv() {
                processed += handle(&task);
            }
            info!(processed, "Task processor shutting down");
        }
        processed
    }
}

/// 1 if the task succeeded, 0 after logging its failure
fn handle(task: &Task) -> usize {
    match process_task(task) {
        Ok(()) => 1,
        Err(e) => {
            error!(task_id = %task.id, kind = task.kind, error = %e, "Task failed");
            0
        }
    }
}

/// Dispatch one task by kind
pub fn process_task(task: &Task) -> Result<(), TaskError> {
    debug!(task_id = %task.id, kind = task.kind, "Processing task");
    match task.kind {
        TASK_SEND_VERIFY_EMAIL => send_verify_email(task),
        other => {
            warn!(task_id = %task.id, kind = other, "No handler for task kind");
            Err(TaskError::UnknownKind(other.to_string()))
        }
    }
}

fn send_verify_email(task: &Task) -> Result<(), TaskError> {
    let payload: PayloadSendVerifyEmail = task.decode()?;
    // TODO: hand off to the mail sender once one is wired into the binary
    info!(
        task_id = %task.id,
        username = %payload.username,
        queued_ms = (chrono::Utc::now() - task.enqueued_at).num_milliseconds(),
        "Processed send_verify_email task"
    );
    Ok(())
}
