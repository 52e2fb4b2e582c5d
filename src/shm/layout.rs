//! Byte-exact layout of the shared telemetry region.
//!
//! The region is a plain file mapped read/write into both the traced
//! process and the engine: `[GlobalHeader | Station 0 | … | Station N-1]`.
//! Probes and the engine are built by different compilers (and usually in
//! different languages), so every structure here pins its size and
//! alignment explicitly; any implicit padding is a conformance bug.
//!
//! Synchronization contract: `Epoch::seq` is the only release/acquire
//! word. A writer publishes an event by storing the payload fields with
//! relaxed ordering and then storing the sequence number with release
//! ordering; a reader that acquire-loads a new sequence value is
//! guaranteed to observe the payload stores that preceded it. The
//! remaining payload fields are relaxed atomics rather than plain
//! integers: the other side may load them while a store is in flight, and
//! relaxed operations compile to ordinary loads/stores on the supported
//! targets.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8};

/// Identifies a coroTracer region. Mismatch means the file at the
/// configured path belongs to something else; refuse to attach.
pub const MAGIC: u64 = 0x434F_524F_5452_4352;

/// Protocol version written into the header at bootstrap.
pub const VERSION: u32 = 1;

/// Size in bytes of [`GlobalHeader`].
pub const HEADER_SIZE: usize = 1024;

/// Size in bytes of one [`StationData`] block.
pub const STATION_SIZE: usize = 1024;

/// Size in bytes of one [`Epoch`] slot (one cache line).
pub const SLOT_SIZE: usize = 64;

/// Number of event slots in each station's ring.
pub const SLOTS_PER_STATION: usize = 8;

/// Sequence value meaning "this slot has never been written".
pub const SEQ_NEVER_WRITTEN: u64 = 0;

/// Total region size for a capacity of `max_stations`.
pub const fn region_size(max_stations: u32) -> usize {
    HEADER_SIZE + max_stations as usize * STATION_SIZE
}

/// Region-global header, first 1024 bytes of the mapping.
///
/// `magic`, `version` and `max_stations` are written once by the engine
/// before any probe can attach and are read-only afterwards. The two
/// atomic words are the only header fields mutated while the region is
/// shared: probes reserve stations with a fetch-add on `allocated_count`,
/// and the engine flips `tracer_sleeping` around its blocking reads.
#[repr(C, align(1024))]
pub struct GlobalHeader {
    pub magic: u64,
    pub version: u32,
    pub max_stations: u32,
    pub allocated_count: AtomicU32,
    /// 0 = engine is scanning, 1 = engine is blocked waiting for a wake
    /// byte. Probes acquire-load this after publishing and send the wake
    /// byte only when it reads 1.
    pub tracer_sleeping: AtomicU32,
    _reserved: [u8; 1000],
}

/// Per-station header block, the first 64 bytes of a station.
///
/// Written by the owning probe at reservation time (and `is_dead` at
/// retirement); the engine only reads it.
#[repr(C)]
pub struct StationHeader {
    pub probe_id: AtomicU64,
    pub birth_ts: AtomicU64,
    /// Once set to 1, no further writes land on this station.
    pub is_dead: AtomicU8,
    _pad: [u8; 47],
}

/// One event record, sized and aligned to a cache line so that
/// concurrently written slots never share one.
#[repr(C, align(64))]
pub struct Epoch {
    /// Monotonic nanoseconds at the time of the write.
    pub timestamp: AtomicU64,
    /// OS thread id of the writer.
    pub tid: AtomicU64,
    /// Opaque pointer or instruction address chosen by the probe.
    pub addr: AtomicU64,
    /// Per-slot monotonic sequence number; the publication barrier.
    pub seq: AtomicU64,
    /// Probe-defined payload area; the engine never reads it.
    pub reserved: [u8; 31],
    /// 1 = resume event, 0 = suspend event.
    pub is_active: AtomicU8,
}

/// One station: exclusively owned by a single coroutine for its lifetime.
///
/// Slot `k % 8` is the write target for the owner's `k`-th event; the
/// ring overwrites under burst load by design. The flexible tail is
/// reserved for future payload and stays zeroed.
#[repr(C, align(1024))]
pub struct StationData {
    pub header: StationHeader,
    pub slots: [Epoch; SLOTS_PER_STATION],
    pub flexible: [u8; 448],
}

// The whole contract falls apart if the compiler pads anything.
const _: () = assert!(std::mem::size_of::<GlobalHeader>() == HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<StationHeader>() == 64);
const _: () = assert!(std::mem::size_of::<Epoch>() == SLOT_SIZE);
const _: () = assert!(std::mem::size_of::<StationData>() == STATION_SIZE);
const _: () = assert!(std::mem::align_of::<GlobalHeader>() == 1024);
const _: () = assert!(std::mem::align_of::<StationData>() == 1024);
const _: () = assert!(std::mem::align_of::<Epoch>() == 64);
