//! Producer threads: batch in, placed matrix out.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::stats::{DropReason, SkipReason, SkipTally, WorkerStats};
use crate::export::health::HealthMetrics;
use crate::matrix::BatchMatrix;
use crate::mesh::{Batch, BatchIndex, HashError};
use crate::queue::{BoundedQueue, Message};
use crate::source::{RawRow, RowSource, SourceError};
use crate::timeline::Timeline;
use crate::wire::WireDecoder;

/// Reasons a producer discards a whole batch.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("building batch index: {0}")]
    Index(#[from] HashError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl BatchError {
    pub fn reason(&self) -> DropReason {
        match self {
            BatchError::Index(_) => DropReason::Index,
            BatchError::Source(SourceError::MissingColumn(_)) => DropReason::MissingColumn,
            BatchError::Source(_) => DropReason::Query,
        }
    }
}

/// Decodes one raw row and writes its value into a batch matrix.
#[derive(Debug, Clone, Copy)]
pub struct RowPlacer<'a> {
    decoder: WireDecoder,
    timeline: Timeline,
    index: &'a BatchIndex<'a>,
}

impl<'a> RowPlacer<'a> {
    pub fn new(decoder: WireDecoder, timeline: Timeline, index: &'a BatchIndex<'a>) -> Self {
        Self {
            decoder,
            timeline,
            index,
        }
    }

    /// Place `row` at `[bucket, local column]`, or report why it was skipped.
    #[inline]
    pub fn place(&self, row: RawRow<'_>, matrix: &mut BatchMatrix) -> Result<(), SkipReason> {
        let decoded = self
            .decoder
            .decode_row(row.identifier, row.instant, row.value)
            .map_err(|_| SkipReason::Decode)?;

        let t = self
            .timeline
            .row(decoded.instant)
            .ok_or(SkipReason::OutOfRange)?;
        let c = self
            .index
            .local_index(decoded.identifier)
            .ok_or(SkipReason::UnknownIdentifier)?;

        if matrix.set(t, c, decoded.value) {
            Ok(())
        } else {
            Err(SkipReason::OutOfRange)
        }
    }
}

/// One worker of the producer pool.
///
/// Loops take batch, build local index, query rows, decode and place,
/// emit, until it takes a sentinel. Then it emits exactly one sentinel on
/// the output queue and returns its counters.
pub struct BatchProducer<R: RowSource> {
    worker: usize,
    source: R,
    work: BoundedQueue<Batch>,
    output: BoundedQueue<BatchMatrix>,
    timeline: Timeline,
    decoder: WireDecoder,
    hash_seed: u64,
    metrics: Arc<HealthMetrics>,
}

impl<R: RowSource> BatchProducer<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker: usize,
        source: R,
        work: BoundedQueue<Batch>,
        output: BoundedQueue<BatchMatrix>,
        timeline: Timeline,
        decoder: WireDecoder,
        hash_seed: u64,
        metrics: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            worker,
            source,
            work,
            output,
            timeline,
            decoder,
            hash_seed,
            metrics,
        }
    }

    /// Run until drained.
    pub fn run(mut self) -> WorkerStats {
        let mut guard = ProducerGuard {
            worker: self.worker,
            work: self.work.clone(),
            output: self.output.clone(),
            metrics: Arc::clone(&self.metrics),
            in_flight: false,
            drained: false,
        };
        let mut stats = WorkerStats::default();
        self.metrics.workers_active.inc();

        loop {
            let batch = match self.work.take() {
                Message::Item(batch) => batch,
                Message::Sentinel => {
                    guard.drained = true;
                    break;
                }
            };
            guard.in_flight = true;
            stats.batches_taken += 1;

            match self.produce(&batch, &mut stats) {
                Ok(matrix) => {
                    self.output.put_item(matrix);
                    stats.batches_emitted += 1;
                    self.metrics.batches_emitted.inc();
                    self.metrics
                        .queue_length
                        .with_label_values(&["output"])
                        .set(self.output.len() as f64);
                }
                Err(e) => {
                    let reason = e.reason();
                    warn!(
                        worker = self.worker,
                        anchor = batch.first_identifier(),
                        cols = batch.len(),
                        reason = reason.as_str(),
                        error = %e,
                        "dropping batch",
                    );
                    stats.dropped.record(reason);
                    self.metrics
                        .batches_dropped
                        .with_label_values(&[reason.as_str()])
                        .inc();
                }
            }
            guard.in_flight = false;
        }

        info!(
            worker = self.worker,
            emitted = stats.batches_emitted,
            dropped = stats.dropped.total(),
            rows = stats.rows_placed,
            "producer drained",
        );

        stats
    }

    fn produce(
        &mut self,
        batch: &Batch,
        stats: &mut WorkerStats,
    ) -> Result<BatchMatrix, BatchError> {
        let index = BatchIndex::build(batch.ids(), self.hash_seed)?;
        let placer = RowPlacer::new(self.decoder, self.timeline, &index);

        let mut matrix =
            BatchMatrix::zeros(batch.first_identifier(), self.timeline.buckets(), batch.len());
        let mut placed = 0u64;
        let mut skipped = SkipTally::default();

        let started = Instant::now();
        let fetched = self.source.fetch(batch.ids(), &mut |row| {
            match placer.place(row, &mut matrix) {
                Ok(()) => placed += 1,
                Err(reason) => skipped.record(reason),
            }
        })?;
        self.metrics
            .batch_fetch_duration
            .observe(started.elapsed().as_secs_f64());

        stats.rows_fetched += fetched as u64;
        stats.rows_placed += placed;
        self.metrics.rows_fetched.inc_by(fetched as f64);
        self.metrics.rows_placed.inc_by(placed as f64);
        stats.skipped.merge(&skipped);
        for (reason, n) in skipped.snapshot() {
            self.metrics
                .rows_skipped
                .with_label_values(&[reason.as_str()])
                .inc_by(n as f64);
        }

        debug!(
            worker = self.worker,
            anchor = batch.first_identifier(),
            fetched,
            placed,
            "batch produced",
        );

        Ok(matrix)
    }
}

/// Emits the producer's output sentinel on every exit path.
///
/// When unwinding, it first takes from the work queue up to and including
/// one work sentinel, so the partitioner never blocks on a queue slot that
/// no producer will free. Every batch taken that way is lost.
struct ProducerGuard {
    worker: usize,
    work: BoundedQueue<Batch>,
    output: BoundedQueue<BatchMatrix>,
    metrics: Arc<HealthMetrics>,
    in_flight: bool,
    drained: bool,
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut abandoned = u64::from(self.in_flight);
            if !self.drained {
                while let Message::Item(_) = self.work.take() {
                    abandoned += 1;
                }
            }
            error!(
                worker = self.worker,
                abandoned,
                "producer panicked, abandoning its batches",
            );
            self.metrics
                .batches_dropped
                .with_label_values(&[DropReason::Abandoned.as_str()])
                .inc_by(abandoned as f64);
        }
        self.metrics.workers_active.dec();
        self.output.put_sentinel();
    }
}

/// Pin the calling thread to `core`. Failure only costs locality.
pub fn pin_to_core(worker: usize, core: usize) {
    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
        debug!(worker, core, "pinned producer thread");
    } else {
        warn!(worker, core, "failed to pin producer thread, continuing unpinned");
    }
}
