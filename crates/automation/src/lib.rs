//! Exactly-once-per-delivery event processing: a cursor-driven watcher, a
//! transactionally-leased job queue with backoff and a dead-letter queue, and
//! a worker pool that turns events back into commands.

mod automation;
mod queue;

pub use automation::{
    load_cursor, Automation, AutomationConfig, AutomationError, AutomationHandle,
    AutomationRegistry, EffectCommand,
};
pub use queue::{
    DlqEntry, DlqIter, FailureDisposition, JobQueue, LeasedJob, QueueConfig, QueueError,
    QueueStats, WorkerId, JOB_RECORD_LEN,
};
