//! Lock-free scan of station rings.

use std::sync::atomic::Ordering;

use tracing::warn;

use crate::shm::layout::{StationData, SEQ_NEVER_WRITTEN, SLOTS_PER_STATION};
use crate::shm::SharedRegion;
use crate::sink::JsonlSink;

/// Tracks per-slot harvest progress and turns slot advances into log
/// records.
///
/// `last_seen` starts at zero everywhere — the never-written sentinel —
/// so any published sequence (first value 1) registers as progress. The
/// scan never blocks and, when nothing advanced, never allocates.
pub struct Harvester {
    last_seen: Vec<[u64; SLOTS_PER_STATION]>,
}

impl Harvester {
    /// Create a harvester for a region with the given capacity.
    pub fn new(max_stations: u32) -> Self {
        Self {
            last_seen: vec![[SEQ_NEVER_WRITTEN; SLOTS_PER_STATION]; max_stations as usize],
        }
    }

    /// Scan every allocated station once, in station order, and return
    /// the number of slots that advanced.
    ///
    /// The allocation counter is acquire-loaded per pass and clamped to
    /// the region's capacity: stations reserved after the load simply
    /// join the next pass.
    pub fn scan_all(&mut self, region: &SharedRegion, sink: &mut JsonlSink) -> usize {
        let allocated = region
            .header()
            .allocated_count
            .load(Ordering::Acquire)
            .min(region.max_stations());

        let mut advanced = 0;
        for index in 0..allocated {
            advanced += self.scan_station(region.station(index), index as usize, sink);
        }
        advanced
    }

    /// Scan one station's eight slots in slot order.
    ///
    /// For each slot: acquire-load the sequence word once; if it moved
    /// past what we last emitted, hand the snapshot to the sink and
    /// record the progress. The snapshot is authoritative — the sink must
    /// not re-read the live word (see `marshal_slot`). A failed log write
    /// is reported and the slot still advances: the ring permits
    /// overwrites, so there is nothing coherent to retry.
    fn scan_station(
        &mut self,
        station: &StationData,
        station_index: usize,
        sink: &mut JsonlSink,
    ) -> usize {
        let mut advanced = 0;

        for (slot_index, slot) in station.slots.iter().enumerate() {
            let observed = slot.seq.load(Ordering::Acquire);

            if observed > self.last_seen[station_index][slot_index] {
                if let Err(e) = sink.write_slot(station, slot_index, observed) {
                    warn!(
                        error = %e,
                        station = station_index,
                        slot = slot_index,
                        "log write failed, dropping record",
                    );
                }
                self.last_seen[station_index][slot_index] = observed;
                advanced += 1;
            }
        }

        advanced
    }
}
