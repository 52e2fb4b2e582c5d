//! Allocation budgets for the harvest hot path.
//!
//! The engine's scan loop runs between two blocking points and must not
//! touch the allocator: an idle pass allocates nothing at all, and
//! steady-state emission reuses the line buffer and the write buffer.

use std::alloc::System;
use std::hint::black_box;
use std::sync::atomic::Ordering;

use corotracer::engine::harvest::Harvester;
use corotracer::shm::layout::SLOTS_PER_STATION;
use corotracer::shm::SharedRegion;
use corotracer::sink::JsonlSink;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

/// (allocations, deallocations) recorded by a stats region since it was
/// created.
fn alloc_delta(probe: &Region<'_, System>) -> (usize, usize) {
    let stats = probe.change();
    (stats.allocations, stats.deallocations)
}

/// Run `f` and count the allocator traffic it caused. The test harness
/// itself produces a trickle of background churn, so an empty probe is
/// sampled first and its counts subtracted out.
fn measure<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    let (ambient_allocs, ambient_deallocs) = alloc_delta(&Region::new(&GLOBAL));

    let probe = Region::new(&GLOBAL);
    let output = f();
    let (allocs, deallocs) = alloc_delta(&probe);

    (
        output,
        allocs.saturating_sub(ambient_allocs),
        deallocs.saturating_sub(ambient_deallocs),
    )
}

struct Fixture {
    _dir: tempfile::TempDir,
    region: SharedRegion,
    sink: JsonlSink,
    harvester: Harvester,
}

fn warmed_fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let region = SharedRegion::create(&dir.path().join("region.shm"), 4).expect("create region");
    let mut sink = JsonlSink::open(&dir.path().join("trace.jsonl"), 128 * 1024).expect("sink");
    let mut harvester = Harvester::new(4);

    // One allocated station with one published event, scanned once so the
    // line buffer and writer are warm.
    region.header().allocated_count.store(1, Ordering::Release);
    region
        .station(0)
        .header
        .probe_id
        .store(1, Ordering::Relaxed);
    publish(&region, 1, 0x1000);
    assert_eq!(harvester.scan_all(&region, &mut sink), 1);

    Fixture {
        _dir: dir,
        region,
        sink,
        harvester,
    }
}

fn publish(region: &SharedRegion, seq: u64, addr: u64) {
    let slot = &region.station(0).slots[(seq % SLOTS_PER_STATION as u64) as usize];
    slot.timestamp.store(seq * 10, Ordering::Relaxed);
    slot.tid.store(7, Ordering::Relaxed);
    slot.addr.store(addr, Ordering::Relaxed);
    slot.is_active.store((seq % 2) as u8, Ordering::Relaxed);
    slot.seq.store(seq, Ordering::Release);
}

#[test]
#[serial]
fn idle_scan_allocates_zero() {
    let mut f = warmed_fixture();

    let (progress, allocations, deallocations) = measure(|| {
        let mut total = 0;
        for _ in 0..256 {
            total += f.harvester.scan_all(&f.region, &mut f.sink);
        }
        black_box(total)
    });

    assert_eq!(progress, 0, "idle scans must make no progress");
    assert_eq!(allocations, 0, "idle scan allocated {allocations} times");
    assert_eq!(deallocations, 0, "idle scan deallocated {deallocations} times");
}

#[test]
#[serial]
fn steady_state_emission_allocation_budget() {
    let mut f = warmed_fixture();

    let (emitted, allocations, deallocations) = measure(|| {
        let mut emitted = 0;
        for seq in 2..=512u64 {
            publish(&f.region, seq, 0x2000 + seq);
            emitted += f.harvester.scan_all(&f.region, &mut f.sink);
        }
        black_box(emitted)
    });

    assert_eq!(emitted, 511, "every publication must be emitted");
    assert!(
        allocations <= 8,
        "emission allocation budget exceeded: {allocations}",
    );
    assert!(
        deallocations <= 8,
        "emission deallocation budget exceeded: {deallocations}",
    );
}

#[test]
#[serial]
fn flush_allocation_budget() {
    let mut f = warmed_fixture();
    publish(&f.region, 2, 0x42);
    assert_eq!(f.harvester.scan_all(&f.region, &mut f.sink), 1);

    let (result, allocations, _deallocations) = measure(|| f.sink.flush());

    assert!(result.is_ok());
    assert!(allocations <= 2, "flush allocation budget exceeded: {allocations}");
}
