//! Append-only JSONL sink for harvested events.
//!
//! The marshaller renders into a single reusable byte buffer and the file
//! sits behind a large write buffer, so steady-state emission performs no
//! allocation and no syscall per record. The slot being rendered is
//! concurrently mutated by its probe; every field is read exactly once,
//! and the sequence number is *never* read here at all — the caller
//! passes the value it observed during the scan.

pub mod record;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};

use crate::shm::layout::StationData;

/// Default capacity of the buffered writer in front of the log file.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 128 * 1024;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Buffered writer of one JSONL record per harvested slot.
pub struct JsonlSink {
    writer: BufWriter<File>,
    line: Vec<u8>,
}

impl JsonlSink {
    /// Open (or create) the log file in append mode behind a buffer of
    /// `buffer_size` bytes.
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            line: Vec::with_capacity(2048),
        })
    }

    /// Append one record for `station.slots[slot_index]`.
    ///
    /// `observed_seq` must be the value the caller loaded from the slot's
    /// sequence word when it decided to emit; re-reading the live word
    /// here could pair a newer sequence with older payload fields.
    pub fn write_slot(
        &mut self,
        station: &StationData,
        slot_index: usize,
        observed_seq: u64,
    ) -> io::Result<()> {
        self.line.clear();
        marshal_slot(&mut self.line, station, slot_index, observed_seq);
        self.writer.write_all(&self.line)
    }

    /// Push buffered records to the OS.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Render one slot as a JSONL line (including the trailing newline) into
/// `buf`.
///
/// Field names, ordering and formats are part of the on-disk contract:
/// `probe_id`/`tid`/`seq`/`ts` as decimal u64, `addr` as `0x` plus
/// exactly 16 lowercase hex digits, `is_active` as a JSON boolean.
pub fn marshal_slot(buf: &mut Vec<u8>, station: &StationData, slot_index: usize, observed_seq: u64) {
    let slot = &station.slots[slot_index];

    buf.extend_from_slice(b"{\"probe_id\":");
    append_u64(buf, station.header.probe_id.load(Ordering::Relaxed));

    buf.extend_from_slice(b",\"tid\":");
    append_u64(buf, slot.tid.load(Ordering::Relaxed));

    buf.extend_from_slice(b",\"addr\":\"");
    append_hex(buf, slot.addr.load(Ordering::Relaxed));
    buf.extend_from_slice(b"\"");

    buf.extend_from_slice(b",\"seq\":");
    append_u64(buf, observed_seq);

    buf.extend_from_slice(b",\"is_active\":");
    if slot.is_active.load(Ordering::Relaxed) != 0 {
        buf.extend_from_slice(b"true");
    } else {
        buf.extend_from_slice(b"false");
    }

    buf.extend_from_slice(b",\"ts\":");
    append_u64(buf, slot.timestamp.load(Ordering::Relaxed));

    buf.extend_from_slice(b"}\n");
}

/// Append `v` as `0x` plus 16 lowercase, zero-padded hex digits.
pub fn append_hex(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(b"0x");
    for i in (0..16).rev() {
        buf.push(HEX_CHARS[((v >> (i * 4)) & 0xF) as usize]);
    }
}

/// Append `v` in decimal without going through the formatting machinery.
fn append_u64(buf: &mut Vec<u8>, mut v: u64) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    buf.extend_from_slice(&digits[i..]);
}
