//! Drop and skip counters reported by a pipeline run.

use std::time::Duration;

/// Why a whole batch was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DropReason {
    /// The per-batch perfect hash could not be built.
    Index = 0,
    /// The row store rejected the query.
    Query = 1,
    /// The result lacked an expected column.
    MissingColumn = 2,
    /// The aggregator could not resolve the batch anchor.
    UnknownAnchor = 3,
    /// The array rejected the window write.
    Write = 4,
    /// The producer holding or draining the batch panicked.
    Abandoned = 5,
}

impl DropReason {
    pub const ALL: [DropReason; 6] = [
        DropReason::Index,
        DropReason::Query,
        DropReason::MissingColumn,
        DropReason::UnknownAnchor,
        DropReason::Write,
        DropReason::Abandoned,
    ];

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Index => "index",
            DropReason::Query => "query",
            DropReason::MissingColumn => "missing_column",
            DropReason::UnknownAnchor => "unknown_anchor",
            DropReason::Write => "write",
            DropReason::Abandoned => "abandoned",
        }
    }
}

/// Why a single row was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SkipReason {
    /// A column failed to decode.
    Decode = 0,
    /// The instant falls outside `[0, T)` buckets.
    OutOfRange = 1,
    /// The identifier is not part of the batch.
    UnknownIdentifier = 2,
}

impl SkipReason {
    pub const ALL: [SkipReason; 3] = [
        SkipReason::Decode,
        SkipReason::OutOfRange,
        SkipReason::UnknownIdentifier,
    ];

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Decode => "decode",
            SkipReason::OutOfRange => "out_of_range",
            SkipReason::UnknownIdentifier => "unknown_identifier",
        }
    }
}

/// Per-reason tallies, indexed by the reason's discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally<const N: usize> {
    counts: [u64; N],
}

impl<const N: usize> Default for Tally<N> {
    fn default() -> Self {
        Self { counts: [0; N] }
    }
}

impl<const N: usize> Tally<N> {
    #[inline]
    fn add(&mut self, slot: usize, n: u64) {
        if let Some(c) = self.counts.get_mut(slot) {
            *c += n;
        }
    }

    fn get(&self, slot: usize) -> u64 {
        self.counts.get(slot).copied().unwrap_or(0)
    }

    /// Sum over all reasons.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Add every count of `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
    }
}

pub type DropTally = Tally<6>;
pub type SkipTally = Tally<3>;

impl DropTally {
    pub fn record(&mut self, reason: DropReason) {
        self.add(reason as usize, 1);
    }

    pub fn count(&self, reason: DropReason) -> u64 {
        self.get(reason as usize)
    }

    /// Non-zero entries, for logging.
    pub fn snapshot(&self) -> Vec<(DropReason, u64)> {
        DropReason::ALL
            .iter()
            .map(|r| (*r, self.count(*r)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

impl SkipTally {
    #[inline]
    pub fn record(&mut self, reason: SkipReason) {
        self.add(reason as usize, 1);
    }

    pub fn count(&self, reason: SkipReason) -> u64 {
        self.get(reason as usize)
    }

    /// Non-zero entries, for logging.
    pub fn snapshot(&self) -> Vec<(SkipReason, u64)> {
        SkipReason::ALL
            .iter()
            .map(|r| (*r, self.count(*r)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

/// Counters owned by one producer thread and returned when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches_taken: u64,
    pub batches_emitted: u64,
    pub dropped: DropTally,
    pub rows_fetched: u64,
    pub rows_placed: u64,
    pub skipped: SkipTally,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.batches_taken += other.batches_taken;
        self.batches_emitted += other.batches_emitted;
        self.dropped.merge(&other.dropped);
        self.rows_fetched += other.rows_fetched;
        self.rows_placed += other.rows_placed;
        self.skipped.merge(&other.skipped);
    }
}

/// Counters owned by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub batches_received: u64,
    pub batches_written: u64,
    pub columns_written: u64,
    pub sentinels: usize,
    pub dropped: DropTally,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Identifiers in the universe (`N`).
    pub identifiers: usize,
    /// Batches the partitioner enqueued (`K`).
    pub batches: usize,
    /// Workers that connected and took part.
    pub workers: usize,
    pub producers: WorkerStats,
    pub aggregate: AggregateStats,
    pub elapsed: Duration,
}

impl RunReport {
    /// Batches lost anywhere in the pipeline.
    pub fn batches_dropped(&self) -> u64 {
        self.producers.dropped.total() + self.aggregate.dropped.total()
    }

    /// Whether every enqueued batch reached the array.
    pub fn is_complete(&self) -> bool {
        self.aggregate.batches_written == self.batches as u64
    }
}
