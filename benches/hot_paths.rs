use std::sync::atomic::Ordering;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use corotracer::engine::harvest::Harvester;
use corotracer::shm::layout::SLOTS_PER_STATION;
use corotracer::shm::SharedRegion;
use corotracer::sink::{marshal_slot, JsonlSink};

struct Fixture {
    _dir: tempfile::TempDir,
    region: SharedRegion,
    sink: JsonlSink,
}

fn fixture(max_stations: u32, allocated: u32) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let region =
        SharedRegion::create(&dir.path().join("region.shm"), max_stations).expect("region");
    let sink = JsonlSink::open(&dir.path().join("trace.jsonl"), 128 * 1024).expect("sink");

    region
        .header()
        .allocated_count
        .store(allocated, Ordering::Release);
    for i in 0..allocated {
        region
            .station(i)
            .header
            .probe_id
            .store(u64::from(i) + 1, Ordering::Relaxed);
    }

    Fixture {
        _dir: dir,
        region,
        sink,
    }
}

fn publish(region: &SharedRegion, station: u32, seq: u64) {
    let slot = &region.station(station).slots[(seq % SLOTS_PER_STATION as u64) as usize];
    slot.timestamp.store(seq * 100, Ordering::Relaxed);
    slot.tid.store(1337, Ordering::Relaxed);
    slot.addr.store(0x7FFF_0000_0000 + seq, Ordering::Relaxed);
    slot.is_active.store((seq % 2) as u8, Ordering::Relaxed);
    slot.seq.store(seq, Ordering::Release);
}

fn bench_marshal_slot(c: &mut Criterion) {
    let f = fixture(1, 1);
    publish(&f.region, 0, 1);
    let station = f.region.station(0);
    let mut buf = Vec::with_capacity(2048);

    c.bench_function("marshal_slot", |b| {
        b.iter(|| {
            buf.clear();
            marshal_slot(&mut buf, station, 1, black_box(1));
            black_box(buf.len());
        })
    });
}

fn bench_idle_scan(c: &mut Criterion) {
    let mut f = fixture(128, 128);
    let mut harvester = Harvester::new(128);

    // Drain the initial state so every measured pass sees no progress.
    for i in 0..128 {
        publish(&f.region, i, 1);
    }
    harvester.scan_all(&f.region, &mut f.sink);

    c.bench_function("idle_scan_128_stations", |b| {
        b.iter(|| black_box(harvester.scan_all(&f.region, &mut f.sink)))
    });
}

fn bench_harvest_emit(c: &mut Criterion) {
    let mut f = fixture(1, 1);
    let mut harvester = Harvester::new(1);
    let mut seq = 0u64;

    c.bench_function("harvest_single_event", |b| {
        b.iter(|| {
            seq += 1;
            publish(&f.region, 0, seq);
            black_box(harvester.scan_all(&f.region, &mut f.sink));
        })
    });
}

criterion_group!(
    benches,
    bench_marshal_slot,
    bench_idle_scan,
    bench_harvest_emit
);
criterion_main!(benches);
