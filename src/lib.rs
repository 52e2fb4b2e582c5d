//! Out-of-process observability for M:N coroutine schedulers.
//!
//! A probe embedded in the traced process publishes coroutine state
//! transitions into a shared-memory region; the harvest engine in this
//! crate maps that region, turns slot advances into an append-only JSONL
//! log, and sleeps on a Unix-domain socket when the region is quiet.
//! Offline, the same log feeds a diagnostic report and an interactive
//! per-coroutine timeline dashboard.

pub mod agent;
pub mod analyze;
pub mod config;
pub mod engine;
pub mod export;
pub mod probe;
pub mod shm;
pub mod sink;
