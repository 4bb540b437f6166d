use tokio::sync::mpsc;

use crate::tasks::Job;

/// Bounded FIFO of Jobs submitted by application threads (spec §4.1).
/// Capacity 500; a full queue blocks the producer rather than rejecting —
/// backpressure, not data loss.
pub const QUEUE_CAPACITY: usize = 500;

/// Drained in batches on the I/O thread so socket work and task work get a
/// fair shake of each `select!` iteration.
pub const MAX_TASK_BATCH: usize = 50;

pub(crate) fn channel() -> (mpsc::Sender<Job>, mpsc::Receiver<Job>) {
    mpsc::channel(QUEUE_CAPACITY)
}
