//! Parsed form of one trace log line.
//!
//! The hot path writes records by hand (`marshal_slot`); everything that
//! reads the log back — the analyzer, the HTML exporter, tests — goes
//! through this serde model.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One coroutine state transition as persisted in the JSONL log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Opaque identifier chosen by the probe; never dereferenced.
    pub probe_id: u64,
    /// OS thread that executed the transition.
    pub tid: u64,
    /// `0x` + 16 lowercase hex digits.
    pub addr: String,
    /// Harvester-observed sequence snapshot.
    pub seq: u64,
    /// true = resume, false = suspend.
    pub is_active: bool,
    /// Monotonic nanoseconds at the time of the write.
    pub ts: u64,
}

impl TraceRecord {
    /// Parse a single JSONL line.
    pub fn parse_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("parsing trace record")
    }

    /// The numeric address, if `addr` is well-formed.
    pub fn addr_value(&self) -> Option<u64> {
        let hex = self.addr.strip_prefix("0x")?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }
}
