//! Splits the identifier space into batches and feeds the work queue.

use std::sync::Arc;

use tracing::debug;

use crate::export::health::HealthMetrics;
use crate::mesh::{Batch, IdentifierSpace};
use crate::queue::BoundedQueue;

/// Feeds the work queue with consecutive batches of the identifier
/// universe, then one sentinel per worker.
pub struct WorkPartitioner {
    space: Arc<IdentifierSpace>,
    batch_size: usize,
    workers: usize,
}

impl WorkPartitioner {
    pub fn new(space: Arc<IdentifierSpace>, batch_size: usize, workers: usize) -> Self {
        Self {
            space,
            batch_size: batch_size.max(1),
            workers,
        }
    }

    /// Number of batches [`WorkPartitioner::run`] will enqueue.
    pub fn batch_count(&self) -> usize {
        self.space.len().div_ceil(self.batch_size)
    }

    /// Enqueue every batch in universe order, then `workers` sentinels.
    /// Returns the number of batches enqueued.
    pub fn run(&self, work: &BoundedQueue<Batch>, metrics: &HealthMetrics) -> usize {
        let mut enqueued = 0;
        for batch in Batch::split(&self.space, self.batch_size) {
            work.put_item(batch);
            enqueued += 1;
            metrics.batches_enqueued.inc();
            metrics
                .queue_length
                .with_label_values(&["work"])
                .set(work.len() as f64);
        }

        for _ in 0..self.workers {
            work.put_sentinel();
        }

        debug!(
            batches = enqueued,
            sentinels = self.workers,
            "work partitioning complete"
        );

        enqueued
    }
}
