//! Probe-side SDK: the in-process half of the telemetry contract.
//!
//! A scheduler embeds this to report coroutine state transitions. The
//! sequence of obligations is fixed: attach and validate the region,
//! reserve a station with an atomic fetch-add, publish events payload
//! first / sequence last, and only after publishing look at the engine's
//! sleep flag to decide whether a wake byte is needed. Wake writes are
//! nonblocking and their failures are ignored — the engine rediscovers
//! data on its next scan regardless.
//!
//! This SDK does not hook any particular coroutine runtime; callers
//! invoke [`Station::record`] from their own suspend/resume
//! instrumentation.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use tracing::warn;

use crate::shm::layout::{GlobalHeader, StationData, SLOTS_PER_STATION};
use crate::shm::SharedRegion;

/// Environment variable naming the shared region file.
pub const ENV_SHM_PATH: &str = "CTP_SHM_PATH";

/// Environment variable naming the wakeup socket.
pub const ENV_SOCK_PATH: &str = "CTP_SOCK_PATH";

/// Environment variable carrying the station capacity, for schedulers
/// that want to size their own pools to it.
pub const ENV_MAX_STATIONS: &str = "CTP_MAX_STATIONS";

/// A probe attached to an engine's region and wakeup socket.
#[derive(Debug)]
pub struct Probe {
    region: SharedRegion,
    wake_sock: UnixStream,
}

impl Probe {
    /// Attach to the region at `shm_path`, refusing on magic or version
    /// mismatch, and connect to the engine's wakeup socket.
    pub fn attach(shm_path: &Path, sock_path: &Path) -> Result<Self> {
        let region = SharedRegion::open(shm_path).context("attaching to shared region")?;

        let wake_sock = UnixStream::connect(sock_path)
            .with_context(|| format!("connecting to wakeup socket {}", sock_path.display()))?;
        wake_sock
            .set_nonblocking(true)
            .context("setting wakeup socket nonblocking")?;

        Ok(Self { region, wake_sock })
    }

    /// Attach using the `CTP_SHM_PATH` / `CTP_SOCK_PATH` environment the
    /// launcher injects into traced children.
    pub fn attach_env() -> Result<Self> {
        let shm = std::env::var(ENV_SHM_PATH)
            .with_context(|| format!("{ENV_SHM_PATH} not set"))?;
        let sock = std::env::var(ENV_SOCK_PATH)
            .with_context(|| format!("{ENV_SOCK_PATH} not set"))?;

        Self::attach(Path::new(&shm), Path::new(&sock))
    }

    /// Reserve a station for one coroutine.
    ///
    /// Returns `None` when the region is at capacity; the caller then
    /// runs untraced. The counter is monotonic by contract, so the
    /// over-subscribed increment is never undone.
    pub fn reserve(&self, probe_id: u64) -> Result<Option<Station<'_>>> {
        let header = self.region.header();
        let index = header.allocated_count.fetch_add(1, Ordering::AcqRel);

        if index >= header.max_stations {
            warn!(
                probe_id,
                capacity = header.max_stations,
                "station capacity exhausted, running untraced",
            );
            return Ok(None);
        }

        let station = self.region.station(index);
        station.header.probe_id.store(probe_id, Ordering::Relaxed);
        station
            .header
            .birth_ts
            .store(monotonic_ns(), Ordering::Relaxed);
        station.header.is_dead.store(0, Ordering::Relaxed);

        let wake_sock = self
            .wake_sock
            .try_clone()
            .context("cloning wakeup socket for station")?;

        Ok(Some(Station {
            station,
            header,
            wake_sock,
            seq: 0,
            index,
        }))
    }

    /// Capacity of the attached region.
    pub fn max_stations(&self) -> u32 {
        self.region.max_stations()
    }
}

/// One reserved station, owned by a single coroutine for its lifetime.
pub struct Station<'a> {
    station: &'a StationData,
    header: &'a GlobalHeader,
    wake_sock: UnixStream,
    seq: u64,
    index: u32,
}

impl Station<'_> {
    /// Publish one state transition.
    ///
    /// Payload fields go first with relaxed stores; the release store of
    /// the sequence number is the publication point. Only then is the
    /// engine's sleep flag consulted: the flag load must not be reordered
    /// before the publication, which the acquire on the flag together
    /// with the release on `seq` guarantees.
    pub fn record(&mut self, addr: u64, is_active: bool) {
        self.seq += 1;
        let slot = &self.station.slots[(self.seq % SLOTS_PER_STATION as u64) as usize];

        slot.timestamp.store(monotonic_ns(), Ordering::Relaxed);
        slot.tid.store(current_tid(), Ordering::Relaxed);
        slot.addr.store(addr, Ordering::Relaxed);
        slot.is_active.store(u8::from(is_active), Ordering::Relaxed);
        slot.seq.store(self.seq, Ordering::Release);

        if self.header.tracer_sleeping.load(Ordering::Acquire) == 1 {
            // Best effort; a lost wake byte only costs latency until the
            // next publication.
            let _ = self.wake_sock.write(&[1u8]);
        }
    }

    /// Mark the station dead. No further writes may land on it.
    pub fn retire(&mut self) {
        self.station.header.is_dead.store(1, Ordering::Release);
    }

    /// The station's index within the region.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The sequence number of the most recently published event.
    pub fn last_seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Station<'_> {
    fn drop(&mut self) {
        self.retire();
    }
}

/// Monotonic nanoseconds, matching the clock probes in other languages
/// use for the `ts` field.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Kernel-level thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Fallback for platforms without stable tid syscalls.
#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}
