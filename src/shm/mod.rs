//! Shared-memory region lifecycle: creation by the engine, attachment by
//! probes, and typed access into the mapping.

pub mod layout;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use memmap2::{MmapMut, MmapOptions};

use self::layout::{region_size, GlobalHeader, StationData, HEADER_SIZE, MAGIC, STATION_SIZE, VERSION};

/// A live mapping of the telemetry region.
///
/// The engine obtains one via [`SharedRegion::create`]; probes (and
/// tests) attach to an existing region with [`SharedRegion::open`], which
/// refuses files that do not carry the expected magic and version.
///
/// All mutation after bootstrap goes through the atomic fields of the
/// layout structs, so shared references returned by [`header`] and
/// [`station`] are sound even while the other process is writing.
/// Mappings are page-aligned, which satisfies the 1024-byte alignment of
/// the header and stations and the 64-byte alignment of every slot.
///
/// [`header`]: SharedRegion::header
/// [`station`]: SharedRegion::station
#[derive(Debug)]
pub struct SharedRegion {
    _file: File,
    mmap: MmapMut,
    max_stations: u32,
}

impl SharedRegion {
    /// Create the region file at `path`, replacing any stale one, size it
    /// to `1024 + max_stations * 1024` bytes and initialize the header.
    ///
    /// The file is created zero-filled by `set_len`, which doubles as the
    /// zero-initialization of `allocated_count`, `tracer_sleeping`, every
    /// station and all reserved padding.
    pub fn create(path: &Path, max_stations: u32) -> Result<Self> {
        let _ = std::fs::remove_file(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating region file {}", path.display()))?;

        let size = region_size(max_stations);
        file.set_len(size as u64)
            .with_context(|| format!("sizing region file to {size} bytes"))?;

        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("mapping region file {}", path.display()))?;

        // Exclusive access until the listener is up: no probe can have
        // attached yet, so plain writes through &mut are fine here.
        let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut GlobalHeader) };
        header.magic = MAGIC;
        header.version = VERSION;
        header.max_stations = max_stations;
        header.allocated_count.store(0, Ordering::Release);
        header.tracer_sleeping.store(0, Ordering::Release);

        Ok(Self {
            _file: file,
            mmap,
            max_stations,
        })
    }

    /// Attach to an existing region, validating magic, version and size.
    ///
    /// This is the probe-side entry point: the mapping is read/write
    /// because probes publish events through it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening region file {}", path.display()))?;

        let len = file
            .metadata()
            .context("reading region file metadata")?
            .len() as usize;

        if len < HEADER_SIZE {
            bail!("region file {} is truncated ({len} bytes)", path.display());
        }

        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("mapping region file {}", path.display()))?;

        let header = unsafe { &*(mmap.as_ptr() as *const GlobalHeader) };

        if header.magic != MAGIC {
            bail!(
                "region magic mismatch: expected {MAGIC:#018x}, found {:#018x}",
                header.magic,
            );
        }

        if header.version != VERSION {
            bail!(
                "region version mismatch: expected {VERSION}, found {}",
                header.version,
            );
        }

        let max_stations = header.max_stations;
        let expected = region_size(max_stations);
        if len != expected {
            bail!("region file is {len} bytes, expected {expected} for {max_stations} stations");
        }

        Ok(Self {
            _file: file,
            mmap,
            max_stations,
        })
    }

    /// The region-global header.
    pub fn header(&self) -> &GlobalHeader {
        unsafe { &*(self.mmap.as_ptr() as *const GlobalHeader) }
    }

    /// The station at `index`. Panics if `index >= max_stations`; callers
    /// clamp to the capacity before iterating.
    pub fn station(&self, index: u32) -> &StationData {
        assert!(
            index < self.max_stations,
            "station index {index} out of range (capacity {})",
            self.max_stations,
        );

        let offset = HEADER_SIZE + index as usize * STATION_SIZE;
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const StationData) }
    }

    /// Capacity fixed at engine start.
    pub fn max_stations(&self) -> u32 {
        self.max_stations
    }

    /// Total mapped size in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True only for a zero-capacity region.
    pub fn is_empty(&self) -> bool {
        self.max_stations == 0
    }
}
