//! The single writer that places batch matrices into the persistent array.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::stats::{AggregateStats, DropReason};
use crate::export::health::HealthMetrics;
use crate::matrix::BatchMatrix;
use crate::mesh::IdentifierSpace;
use crate::queue::{BoundedQueue, Message};
use crate::store::{ArrayStore, StoreError};

/// Sole writer of the persistent array.
///
/// Drains the output queue, placing each batch matrix at the column offset
/// of its anchor, until it has counted one sentinel per live worker.
/// Placement is anchor-driven, so batches may arrive in any order.
pub struct Aggregator {
    space: Arc<IdentifierSpace>,
    output: BoundedQueue<BatchMatrix>,
    workers: usize,
    metrics: Arc<HealthMetrics>,
    progress_interval: Duration,
}

impl Aggregator {
    pub fn new(
        space: Arc<IdentifierSpace>,
        output: BoundedQueue<BatchMatrix>,
        workers: usize,
        metrics: Arc<HealthMetrics>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            space,
            output,
            workers,
            metrics,
            progress_interval,
        }
    }

    /// Drain until `workers` sentinels arrive, then finish the array.
    ///
    /// Only the final flush can fail; rejected window writes are counted
    /// as dropped batches.
    pub fn run<S: ArrayStore + ?Sized>(self, store: &mut S) -> Result<AggregateStats, StoreError> {
        let mut stats = AggregateStats::default();
        let total = self.space.len();
        let mut last_progress = Instant::now();

        while stats.sentinels < self.workers {
            let matrix = match self.output.take() {
                Message::Item(matrix) => matrix,
                Message::Sentinel => {
                    stats.sentinels += 1;
                    debug!(
                        sentinels = stats.sentinels,
                        workers = self.workers,
                        "producer finished"
                    );
                    continue;
                }
            };
            stats.batches_received += 1;
            self.metrics
                .queue_length
                .with_label_values(&["output"])
                .set(self.output.len() as f64);

            if let Err(reason) = self.place(&matrix, store) {
                stats.dropped.record(reason);
                self.metrics
                    .batches_dropped
                    .with_label_values(&[reason.as_str()])
                    .inc();
            } else {
                stats.batches_written += 1;
                stats.columns_written += matrix.cols() as u64;
                self.metrics.batches_written.inc();
                self.metrics.columns_written.set(stats.columns_written as f64);
            }

            if last_progress.elapsed() >= self.progress_interval {
                last_progress = Instant::now();
                info!(
                    columns = stats.columns_written,
                    total,
                    percent = percent(stats.columns_written, total),
                    "ingestion progress",
                );
            }
        }

        store.finish()?;

        info!(
            batches = stats.batches_written,
            columns = stats.columns_written,
            dropped = stats.dropped.total(),
            "array finalized",
        );

        Ok(stats)
    }

    fn place<S: ArrayStore + ?Sized>(
        &self,
        matrix: &BatchMatrix,
        store: &mut S,
    ) -> Result<(), DropReason> {
        let Some(offset) = self.space.global_index(matrix.anchor()) else {
            warn!(anchor = matrix.anchor(), "anchor not in identifier space, dropping batch");
            return Err(DropReason::UnknownAnchor);
        };

        let started = Instant::now();
        if let Err(e) = store.write_window(0, offset, matrix.view()) {
            warn!(
                anchor = matrix.anchor(),
                offset,
                cols = matrix.cols(),
                error = %e,
                "window write failed, dropping batch",
            );
            return Err(DropReason::Write);
        }
        self.metrics
            .window_write_duration
            .observe(started.elapsed().as_secs_f64());

        Ok(())
    }
}

fn percent(done: u64, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 * 1000.0 / total as f64).round() / 10.0
}
