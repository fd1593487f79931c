//! Producer/consumer ingestion pipeline.
//!
//! One partitioner feeds a bounded work queue, a pool of producer threads
//! turns batches into matrices, and a single aggregator thread writes them
//! into the persistent array. Termination is by sentinel counting only.

pub mod aggregator;
pub mod partition;
pub mod stats;
pub mod worker;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

pub use aggregator::Aggregator;
pub use partition::WorkPartitioner;
pub use stats::{AggregateStats, DropReason, RunReport, SkipReason, WorkerStats};
pub use worker::{pin_to_core, BatchError, BatchProducer, RowPlacer};

use crate::export::health::HealthMetrics;
use crate::matrix::BatchMatrix;
use crate::mesh::{Batch, IdentifierSpace};
use crate::queue::BoundedQueue;
use crate::source::Connector;
use crate::store::ArrayStore;
use crate::timeline::Timeline;
use crate::wire::WireDecoder;

/// Tunables for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Producer threads (`W`).
    pub workers: usize,
    /// Identifiers per batch.
    pub batch_size: usize,
    /// Capacity of both the work and the output queue.
    pub queue_capacity: usize,
    /// Seed for per-batch hash construction.
    pub hash_seed: u64,
    /// CPU cores producers are pinned to, round-robin. Empty disables pinning.
    pub pin_cores: Vec<usize>,
    /// How often the aggregator logs progress.
    pub progress_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 32,
            batch_size: 16,
            queue_capacity: 1024,
            hash_seed: 0,
            pin_cores: Vec::new(),
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Wires the partitioner, producers, and aggregator together for one run.
pub struct Pipeline {
    space: Arc<IdentifierSpace>,
    timeline: Timeline,
    decoder: WireDecoder,
    options: PipelineOptions,
    metrics: Arc<HealthMetrics>,
}

impl Pipeline {
    pub fn new(
        space: Arc<IdentifierSpace>,
        timeline: Timeline,
        decoder: WireDecoder,
        options: PipelineOptions,
        metrics: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            space,
            timeline,
            decoder,
            options,
            metrics,
        }
    }

    pub fn space(&self) -> &Arc<IdentifierSpace> {
        &self.space
    }

    /// Ingest every batch of the identifier space into `store`.
    ///
    /// Fails only on setup errors (shape mismatch, first connection,
    /// thread creation) or when the array cannot be finalized. Batch and
    /// row failures are counted in the returned report.
    pub fn run<C, S>(&self, connector: &C, store: &mut S) -> Result<RunReport>
    where
        C: Connector,
        S: ArrayStore,
    {
        let started = Instant::now();

        // 0. Check the array matches [T, N].
        if self.options.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        let shape = store.shape();
        if shape.rows != self.timeline.buckets() || shape.cols != self.space.len() {
            bail!(
                "array shape [{}, {}] does not match [{} buckets, {} identifiers]",
                shape.rows,
                shape.cols,
                self.timeline.buckets(),
                self.space.len()
            );
        }
        self.metrics.columns_total.set(self.space.len() as f64);

        // 1. Connect every producer up front. Only the first connection is
        //    mandatory; later refusals shrink the pool.
        let connect_started = Instant::now();
        let mut sources = Vec::with_capacity(self.options.workers);
        for worker in 0..self.options.workers {
            match connector.connect(worker) {
                Ok(source) => sources.push((worker, source)),
                Err(e) if worker == 0 => {
                    return Err(e).context("connecting first producer to row store");
                }
                Err(e) => {
                    warn!(worker, error = %e, "producer could not connect, continuing without it");
                }
            }
        }
        self.metrics
            .setup_duration
            .with_label_values(&["connect"])
            .set(connect_started.elapsed().as_secs_f64());

        let planned = WorkPartitioner::new(
            Arc::clone(&self.space),
            self.options.batch_size,
            sources.len(),
        );
        info!(
            identifiers = self.space.len(),
            batches = planned.batch_count(),
            workers = sources.len(),
            buckets = self.timeline.buckets(),
            "starting ingestion",
        );

        // 2. Create the two bounded queues.
        let work: BoundedQueue<Batch> = BoundedQueue::new(self.options.queue_capacity);
        let output: BoundedQueue<BatchMatrix> = BoundedQueue::new(self.options.queue_capacity);

        let (batches, workers, producers, aggregate) = thread::scope(|s| -> Result<_> {
            // 3. Start the aggregator before any producer can emit.
            let aggregator = Aggregator::new(
                Arc::clone(&self.space),
                output.clone(),
                sources.len(),
                Arc::clone(&self.metrics),
                self.options.progress_interval,
            );
            let aggregator = thread::Builder::new()
                .name("aggregator".into())
                .spawn_scoped(s, move || aggregator.run(store))
                .context("spawning aggregator thread")?;

            // 4. Start producers. A producer that cannot be spawned still
            //    owes the aggregator its sentinel.
            let mut handles = Vec::with_capacity(sources.len());
            for (slot, (worker, source)) in sources.into_iter().enumerate() {
                let producer = BatchProducer::new(
                    worker,
                    source,
                    work.clone(),
                    output.clone(),
                    self.timeline,
                    self.decoder,
                    self.options.hash_seed,
                    Arc::clone(&self.metrics),
                );
                let core = slot
                    .checked_rem(self.options.pin_cores.len())
                    .and_then(|i| self.options.pin_cores.get(i))
                    .copied();

                let spawned = thread::Builder::new()
                    .name(format!("producer-{worker}"))
                    .spawn_scoped(s, move || {
                        if let Some(core) = core {
                            pin_to_core(worker, core);
                        }
                        producer.run()
                    });
                match spawned {
                    Ok(handle) => handles.push((worker, handle)),
                    Err(e) => {
                        error!(worker, error = %e, "failed to spawn producer thread");
                        output.put_sentinel();
                    }
                }
            }

            // 5. Partition on this thread. With no producers running nobody
            //    would drain the work queue, so skip straight to the join.
            let workers = handles.len();
            let batches = if workers > 0 {
                WorkPartitioner::new(Arc::clone(&self.space), self.options.batch_size, workers)
                    .run(&work, &self.metrics)
            } else {
                0
            };

            // 6. Join producers, then the aggregator.
            let mut producers = WorkerStats::default();
            for (worker, handle) in handles {
                match handle.join() {
                    Ok(stats) => producers.merge(&stats),
                    Err(_) => error!(worker, "producer thread panicked"),
                }
            }

            let aggregate = match aggregator.join() {
                Ok(result) => result.context("finalizing output array")?,
                Err(_) => bail!("aggregator thread panicked"),
            };

            if workers == 0 {
                bail!("no producer thread could be started");
            }

            Ok((batches, workers, producers, aggregate))
        })?;

        let report = RunReport {
            identifiers: self.space.len(),
            batches,
            workers,
            producers,
            aggregate,
            elapsed: started.elapsed(),
        };

        info!(
            batches = report.batches,
            written = report.aggregate.batches_written,
            dropped = report.batches_dropped(),
            rows = report.producers.rows_placed,
            skipped = report.producers.skipped.total(),
            elapsed = ?report.elapsed,
            "ingestion finished",
        );

        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration as ChronoDuration, FixedOffset};

    use super::*;
    use crate::source::MemoryConnector;
    use crate::store::{ArrayShape, MemoryArray};

    fn pipeline(n: u32, buckets: usize, options: PipelineOptions) -> Pipeline {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let timeline = Timeline::new("2016-01-01 00:00:00", offset, buckets).unwrap();
        let space = IdentifierSpace::build((0..n).map(|i| 1000 + i * 3).collect(), 0).unwrap();
        Pipeline::new(
            Arc::new(space),
            timeline,
            WireDecoder::new(offset),
            options,
            Arc::new(HealthMetrics::new("").unwrap()),
        )
    }

    fn options(workers: usize, batch_size: usize) -> PipelineOptions {
        PipelineOptions {
            workers,
            batch_size,
            queue_capacity: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_every_identifier_lands_in_its_column() {
        let p = pipeline(10, 6, options(3, 3));
        let r = p.timeline.reference();
        let mut connector = MemoryConnector::new(p.decoder);
        for (i, id) in p.space().ids().iter().enumerate() {
            let instant = r + ChronoDuration::hours(i as i64 % 6);
            connector = connector.with_row(*id, instant, i as i32 + 1);
        }
        let mut store = MemoryArray::new(ArrayShape::new(6, 10, 6, 4, 0).unwrap());

        let report = p.run(&connector, &mut store).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.batches, 4);
        assert_eq!(report.workers, 3);
        assert_eq!(report.producers.rows_placed, 10);
        for i in 0..10 {
            assert_eq!(store.data()[[i % 6, i]], i as i32 + 1);
        }
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let p = pipeline(4, 6, options(1, 2));
        let connector = MemoryConnector::new(p.decoder);
        let mut store = MemoryArray::new(ArrayShape::new(6, 5, 6, 4, 0).unwrap());
        let err = p.run(&connector, &mut store).unwrap_err();
        assert!(err.to_string().contains("does not match"));
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let p = pipeline(4, 6, options(0, 2));
        let connector = MemoryConnector::new(p.decoder);
        let mut store = MemoryArray::new(ArrayShape::new(6, 4, 6, 4, 0).unwrap());
        assert!(p.run(&connector, &mut store).is_err());
    }
}
