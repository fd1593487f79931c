use chrono::{Duration, FixedOffset};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meshpop::matrix::BatchMatrix;
use meshpop::mesh::{grid, BatchIndex, IdentifierSpace};
use meshpop::pipeline::RowPlacer;
use meshpop::source::RawRow;
use meshpop::timeline::Timeline;
use meshpop::wire::WireDecoder;

const BUCKETS: usize = 74_160;

fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("jst offset")
}

fn timeline() -> Timeline {
    Timeline::new("2016-01-01 00:00:00", jst(), BUCKETS).expect("timeline")
}

fn encoded(
    decoder: &WireDecoder,
    timeline: &Timeline,
    id: u32,
    hour: i64,
) -> ([u8; 4], [u8; 8], [u8; 4]) {
    (
        (id as i32).to_be_bytes(),
        decoder.encode_instant(timeline.reference() + Duration::hours(hour)),
        1_234i32.to_be_bytes(),
    )
}

fn bench_decode(c: &mut Criterion) {
    let decoder = WireDecoder::new(jst());
    let timeline = timeline();
    let (id, ts, val) = encoded(&decoder, &timeline, 533_946_113, 40_000);

    c.bench_function("wire/decode_row", |b| {
        b.iter(|| {
            decoder
                .decode_row(black_box(&id), black_box(&ts), black_box(&val))
                .expect("decode row")
        })
    });

    let instant = timeline.reference() + Duration::hours(40_000);
    c.bench_function("timeline/bucket", |b| {
        b.iter(|| timeline.bucket(black_box(instant)))
    });
}

fn bench_lookup(c: &mut Criterion) {
    let ids = grid::first_mesh_cells(5339).expect("first mesh");
    let space = IdentifierSpace::build(ids.clone(), 0).expect("identifier space");

    c.bench_function("mesh/global_index_25600", |b| {
        b.iter(|| {
            ids.iter()
                .filter_map(|id| space.global_index(black_box(*id)))
                .sum::<usize>()
        })
    });

    let batch = &ids[..16];
    let index = BatchIndex::build(batch, 0).expect("batch index");
    c.bench_function("mesh/local_index_16", |b| {
        b.iter(|| {
            batch
                .iter()
                .filter_map(|id| index.local_index(black_box(*id)))
                .sum::<usize>()
        })
    });

    c.bench_function("mesh/batch_index_build_16", |b| {
        b.iter(|| BatchIndex::build(black_box(batch), 0).expect("batch index"))
    });
}

fn bench_place(c: &mut Criterion) {
    let decoder = WireDecoder::new(jst());
    let timeline = timeline();
    let ids = grid::first_mesh_cells(5339).expect("first mesh");
    let batch = &ids[..16];
    let index = BatchIndex::build(batch, 0).expect("batch index");
    let placer = RowPlacer::new(decoder, timeline, &index);
    let (id, ts, val) = encoded(&decoder, &timeline, batch[7], 12_345);
    let mut matrix = BatchMatrix::zeros(batch[0], BUCKETS, batch.len());

    c.bench_function("pipeline/place_row", |b| {
        b.iter(|| {
            let row = RawRow {
                identifier: black_box(&id),
                instant: black_box(&ts),
                value: black_box(&val),
            };
            placer.place(row, &mut matrix).expect("place row")
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_lookup(c);
    bench_place(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
