//! Task types shared by the distributor and the processor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task queue is full")]
    QueueFull,

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unknown task kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Queued unit of work. The payload is the JSON encoding of the kind's
/// payload type.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub kind: &'static str,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new<P: Serialize>(kind: &'static str, payload: &P) -> Result<Self, TaskError> {
        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            payload: serde_json::to_vec(payload)?,
            enqueued_at: Utc::now(),
        })
    }

    pub fn decode<P: for<'de> Deserialize<'de>>(&self) -> Result<P, TaskError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}
