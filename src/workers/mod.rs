//! Background tasks
//!
//! Side effects that must not hold up the request that triggered them.
//!
//! ```text
//! AccountService ──try_send──▶ [bounded queue] ──recv──▶ TaskProcessor
//! ```

pub mod distributor;
pub mod processor;
pub mod task;

pub use distributor::{ChannelTaskDistributor, TaskDistributor, TaskReceiver, task_channel};
pub use processor::TaskProcessor;
pub use task::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, Task, TaskError};
