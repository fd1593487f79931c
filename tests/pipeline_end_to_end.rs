use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as Hours, FixedOffset};
use meshpop::export::health::HealthMetrics;
use meshpop::mesh::{grid, ChmHash, IdentifierSpace};
use meshpop::pipeline::{DropReason, Pipeline, PipelineOptions, RunReport, SkipReason};
use meshpop::source::{Connector, MemoryConnector, RawRow, RowSource, SourceError};
use meshpop::store::{ArrayShape, ArrayStore, ChunkedFile, MemoryArray};
use meshpop::timeline::{Timeline, DEFAULT_BUCKETS};
use meshpop::wire::WireDecoder;

fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("jst offset")
}

fn timeline(buckets: usize) -> Timeline {
    Timeline::new("2016-01-01 00:00:00", jst(), buckets).expect("timeline")
}

fn options(workers: usize, batch_size: usize, queue_capacity: usize) -> PipelineOptions {
    PipelineOptions {
        workers,
        batch_size,
        queue_capacity,
        progress_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn pipeline(space: &Arc<IdentifierSpace>, timeline: Timeline, opts: PipelineOptions) -> Pipeline {
    Pipeline::new(
        Arc::clone(space),
        timeline,
        WireDecoder::new(jst()),
        opts,
        Arc::new(HealthMetrics::new("").expect("metrics")),
    )
}

fn first_cells(n: usize) -> Arc<IdentifierSpace> {
    let mut ids = grid::first_mesh_cells(5339).expect("first mesh");
    ids.truncate(n);
    Arc::new(IdentifierSpace::build(ids, 0).expect("identifier space"))
}

fn run_memory<C: Connector>(
    space: &Arc<IdentifierSpace>,
    timeline: Timeline,
    opts: PipelineOptions,
    connector: &C,
    fill: i32,
) -> (RunReport, MemoryArray) {
    let shape = ArrayShape::new(timeline.buckets(), space.len(), 24, 16, fill).expect("shape");
    let mut store = MemoryArray::new(shape);
    let report = pipeline(space, timeline, opts)
        .run(connector, &mut store)
        .expect("pipeline run");
    (report, store)
}

#[test]
fn test_single_batch_end_to_end_on_disk() {
    let space = first_cells(16);
    let timeline = timeline(DEFAULT_BUCKETS);
    let ids = space.ids().to_vec();
    let r = timeline.reference();

    let connector = MemoryConnector::new(WireDecoder::new(jst()))
        .with_row(ids[0], r, 11)
        .with_row(ids[5], r + Hours::hours(1), 22)
        .with_row(ids[15], r + Hours::hours(2), 33);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("population.mpca");
    let shape = ArrayShape::new(DEFAULT_BUCKETS, 16, 8760, 16, 0).expect("shape");
    let mut store = ChunkedFile::create(&path, shape, &ids).expect("create array");

    let report = pipeline(&space, timeline, options(4, 16, 1024))
        .run(&connector, &mut store)
        .expect("pipeline run");
    assert_eq!(report.batches, 1);
    assert!(report.is_complete());
    assert_eq!(report.producers.rows_placed, 3);
    drop(store);

    let mut reopened = ChunkedFile::open(&path).expect("open array");
    assert_eq!(reopened.identifiers(), ids.as_slice());
    let data = reopened
        .read_window(0, 0, DEFAULT_BUCKETS, 16)
        .expect("read window");

    let mut expected = ndarray::Array2::<i32>::zeros((DEFAULT_BUCKETS, 16));
    expected[[0, 0]] = 11;
    expected[[1, 5]] = 22;
    expected[[2, 15]] = 33;
    assert_eq!(data, expected);
}

#[test]
fn test_all_queries_failing_still_terminates() {
    let space = first_cells(160);
    let connector = MemoryConnector::new(WireDecoder::new(jst())).failing_all();

    let (report, store) = run_memory(&space, timeline(48), options(4, 16, 2), &connector, 0);

    assert_eq!(report.batches, 10);
    assert_eq!(report.aggregate.sentinels, 4);
    assert_eq!(report.aggregate.batches_written, 0);
    assert_eq!(report.producers.dropped.count(DropReason::Query), 10);
    assert_eq!(report.batches_dropped(), 10);
    assert_eq!(store.writes(), 0);
    assert!(store.is_finished());
}

#[test]
fn test_missing_column_leaves_fill_value() {
    let space = first_cells(32);
    let connector = MemoryConnector::new(WireDecoder::new(jst()))
        .with_row(space.ids()[0], timeline(24).reference(), 5)
        .missing_column("population");

    let (report, store) = run_memory(&space, timeline(24), options(2, 16, 4), &connector, -1);

    assert_eq!(report.producers.dropped.count(DropReason::MissingColumn), 2);
    assert!(store.data().iter().all(|v| *v == -1));
}

#[test]
fn test_many_workers_place_by_anchor() {
    let space = first_cells(200);
    let timeline = timeline(72);
    let mut connector =
        MemoryConnector::new(WireDecoder::new(jst())).with_latency(Duration::from_millis(1));
    for (i, id) in space.ids().iter().enumerate() {
        let instant = timeline.reference() + Hours::hours(i as i64 % 72);
        connector = connector.with_row(*id, instant, i as i32 + 1);
    }

    let (report, store) = run_memory(&space, timeline, options(8, 16, 4), &connector, 0);

    // 12 full batches and a final batch of 8.
    assert_eq!(report.batches, 13);
    assert!(report.is_complete());
    assert_eq!(report.aggregate.columns_written, 200);
    for i in 0..200 {
        assert_eq!(store.data()[[i % 72, i]], i as i32 + 1, "column {i}");
    }
}

#[test]
fn test_rows_outside_timeline_are_skipped() {
    let space = first_cells(16);
    let timeline = timeline(24);
    let r = timeline.reference();
    let ids = space.ids().to_vec();
    let connector = MemoryConnector::new(WireDecoder::new(jst()))
        .with_row(ids[1], r - Hours::hours(1), 9)
        .with_row(ids[1], r + Hours::hours(24), 9)
        .with_row(ids[1], r + Hours::hours(23), 7)
        .with_raw_row(ids[2].to_be_bytes().to_vec(), vec![0; 3], 1i32.to_be_bytes().to_vec());

    let (report, store) = run_memory(&space, timeline, options(1, 16, 1), &connector, 0);

    assert!(report.is_complete());
    assert_eq!(report.producers.rows_fetched, 4);
    assert_eq!(report.producers.rows_placed, 1);
    assert_eq!(report.producers.skipped.count(SkipReason::OutOfRange), 2);
    assert_eq!(report.producers.skipped.count(SkipReason::Decode), 1);
    assert_eq!(store.data()[[23, 1]], 7);
    assert_eq!(store.data().iter().filter(|v| **v != 0).count(), 1);
}

#[test]
fn test_refused_worker_shrinks_pool() {
    let space = first_cells(64);
    let timeline = timeline(24);
    let connector = MemoryConnector::new(WireDecoder::new(jst()))
        .with_row(space.ids()[63], timeline.reference(), 4)
        .refusing_worker(2);

    let (report, store) = run_memory(&space, timeline, options(4, 16, 2), &connector, 0);

    assert_eq!(report.workers, 3);
    assert_eq!(report.aggregate.sentinels, 3);
    assert!(report.is_complete());
    assert_eq!(store.data()[[0, 63]], 4);
}

#[test]
fn test_first_worker_refused_is_fatal() {
    let space = first_cells(16);
    let timeline = timeline(24);
    let connector = MemoryConnector::new(WireDecoder::new(jst())).refusing_worker(0);
    let mut store = MemoryArray::new(ArrayShape::new(24, 16, 24, 16, 0).expect("shape"));

    let err = pipeline(&space, timeline, options(2, 16, 2))
        .run(&connector, &mut store)
        .expect_err("first connection refused");
    assert!(format!("{err:#}").contains("connecting first producer"));
    assert_eq!(store.writes(), 0);
}

#[test]
fn test_queue_capacity_one() {
    let space = first_cells(40);
    let timeline = timeline(24);
    let mut connector = MemoryConnector::new(WireDecoder::new(jst()));
    for id in space.ids() {
        connector = connector.with_row(*id, timeline.reference(), 1);
    }

    let (report, store) = run_memory(&space, timeline, options(3, 4, 1), &connector, 0);

    assert_eq!(report.batches, 10);
    assert!(report.is_complete());
    assert_eq!(store.writes(), 10);
    assert!(store.data().row(0).iter().all(|v| *v == 1));
}

#[test]
fn test_precomputed_hash_table() {
    let ids = grid::first_mesh_cells(5339).expect("first mesh");
    let dir = tempfile::tempdir().expect("tempdir");
    let hash_path = dir.path().join("ids.chm");
    ChmHash::build(&ids, 3)
        .expect("build hash")
        .save(&hash_path)
        .expect("save hash");

    let space = Arc::new(IdentifierSpace::load(ids, Some(&hash_path), 0).expect("load space"));
    let timeline = timeline(2);
    let last = *space.ids().last().expect("ids");
    let connector =
        MemoryConnector::new(WireDecoder::new(jst())).with_row(last, timeline.reference(), 8);

    let (report, store) = run_memory(&space, timeline, options(8, 16, 64), &connector, 0);

    assert_eq!(report.batches, grid::CELLS_PER_FIRST_MESH / 16);
    assert!(report.is_complete());
    assert_eq!(store.data()[[0, grid::CELLS_PER_FIRST_MESH - 1]], 8);
    assert_eq!(store.shape().cols, grid::CELLS_PER_FIRST_MESH);
}

struct PanickingSource;

impl RowSource for PanickingSource {
    #[allow(clippy::panic)]
    fn fetch(
        &mut self,
        _ids: &[u32],
        _sink: &mut dyn FnMut(RawRow<'_>),
    ) -> Result<usize, SourceError> {
        panic!("row store client state corrupted");
    }
}

struct PanickingConnector;

impl Connector for PanickingConnector {
    type Source = PanickingSource;

    fn connect(&self, _worker: usize) -> Result<PanickingSource, SourceError> {
        Ok(PanickingSource)
    }
}

#[test]
fn test_panicking_producers_do_not_stall_partitioner() {
    // More batches than workers plus queue slots, so the partitioner can
    // only finish if panicked producers keep draining the work queue.
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let space = first_cells(64);
        let outcome = run_memory(&space, timeline(24), options(2, 4, 1), &PanickingConnector, 0);
        let _ = tx.send(outcome);
    });

    let (report, store) = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("pipeline run terminated");

    assert_eq!(report.batches, 16);
    assert_eq!(report.aggregate.sentinels, 2);
    assert_eq!(report.aggregate.batches_written, 0);
    assert!(!report.is_complete());
    assert_eq!(store.writes(), 0);
    assert!(store.is_finished());
}
