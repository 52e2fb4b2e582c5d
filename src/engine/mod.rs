//! The harvest engine: a single-threaded loop that turns slot advances
//! in the shared region into log records, sleeping on a Unix socket when
//! there is nothing to do.
//!
//! The loop has exactly two blocking points — `accept` while no probe is
//! connected and the socket `read` while idle — and one subtle step: the
//! re-scan between arming the sleep flag and blocking. A probe checks
//! the flag only after publishing, so the engine may arm the flag just
//! after a publication that triggered no wake byte; the re-scan is the
//! only thing standing between that interleaving and a permanent stall.

pub mod harvest;

use std::io::Read;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::harvest::Harvester;
use crate::config::Config;
use crate::shm::SharedRegion;
use crate::sink::JsonlSink;

/// Instrumentation callback invoked after the sleep flag is armed and
/// before the double-check re-scan.
pub type ArmSleepHook = Box<dyn Fn() + Send>;

/// Owns every engine-side resource: the mapped region, the harvester
/// state, the log sink and the wakeup listener.
///
/// Built with [`bootstrap`](Self::bootstrap), then moved onto a dedicated
/// thread and consumed by [`run`](Self::run). External shutdown goes
/// through the [`EngineHandle`] obtained beforehand.
pub struct HarvestEngine {
    region: SharedRegion,
    harvester: Harvester,
    sink: JsonlSink,
    listener: UnixListener,
    sock_path: PathBuf,
    conn: Arc<Mutex<Option<UnixStream>>>,
    cancel: CancellationToken,
    records_emitted: Arc<AtomicU64>,
    arm_sleep_hook: Option<ArmSleepHook>,
}

/// Cheaply cloneable handle for stopping a running engine and reading
/// its progress counter from other threads.
#[derive(Clone)]
pub struct EngineHandle {
    cancel: CancellationToken,
    conn: Arc<Mutex<Option<UnixStream>>>,
    sock_path: PathBuf,
    records_emitted: Arc<AtomicU64>,
}

impl HarvestEngine {
    /// Set up every engine resource in dependency order: shared region,
    /// wakeup socket, log sink.
    ///
    /// Any failure is fatal and unwinds whatever was already built, so an
    /// error here never leaves a mapping or a bound socket behind.
    pub fn bootstrap(cfg: &Config) -> Result<Self> {
        let region = SharedRegion::create(&cfg.shm_path, cfg.max_stations)
            .context("creating shared region")?;

        let _ = std::fs::remove_file(&cfg.sock_path);
        let listener = UnixListener::bind(&cfg.sock_path)
            .with_context(|| format!("binding wakeup socket {}", cfg.sock_path.display()))?;

        let sink = JsonlSink::open(&cfg.out_path, cfg.io_buffer_size)
            .context("opening trace log")?;

        info!(
            shm = %cfg.shm_path.display(),
            sock = %cfg.sock_path.display(),
            out = %cfg.out_path.display(),
            stations = cfg.max_stations,
            region_bytes = region.len(),
            "engine bootstrapped",
        );

        Ok(Self {
            harvester: Harvester::new(cfg.max_stations),
            region,
            sink,
            listener,
            sock_path: cfg.sock_path.clone(),
            conn: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            records_emitted: Arc::new(AtomicU64::new(0)),
            arm_sleep_hook: None,
        })
    }

    /// Handle for shutting this engine down from another thread.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            cancel: self.cancel.clone(),
            conn: Arc::clone(&self.conn),
            sock_path: self.sock_path.clone(),
            records_emitted: Arc::clone(&self.records_emitted),
        }
    }

    /// Install an instrumentation callback fired between the sleep-flag
    /// store and the double-check re-scan.
    pub fn set_arm_sleep_hook(&mut self, hook: impl Fn() + Send + 'static) {
        self.arm_sleep_hook = Some(Box::new(hook));
    }

    /// Drive the engine until shutdown: accept a probe, harvest until it
    /// disconnects, repeat.
    ///
    /// Consumes the engine; dropping it at the end unmaps the region and
    /// closes the listener, log file and region file.
    pub fn run(mut self) -> Result<()> {
        let mut wake_buf = [0u8; 1024];

        info!(sock = %self.sock_path.display(), "waiting for probe connections");

        while !self.cancel.is_cancelled() {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                break;
            }

            info!("probe connected, entering harvest loop");

            match stream.try_clone() {
                Ok(clone) => *self.conn.lock() = Some(clone),
                Err(e) => warn!(error = %e, "cloning probe socket failed"),
            }

            let mut stream = stream;
            self.harvest_loop(&mut stream, &mut wake_buf);

            self.conn.lock().take();
            // A reconnecting probe must observe an active engine.
            self.region
                .header()
                .tracer_sleeping
                .store(0, Ordering::Release);

            info!("probe disconnected, waiting for next connection");
        }

        self.sink.flush().context("flushing trace log at shutdown")?;
        info!(
            records = self.records_emitted.load(Ordering::Relaxed),
            "engine stopped",
        );

        Ok(())
    }

    /// Hot loop for one connected probe. Returns on disconnect or
    /// cancellation.
    fn harvest_loop(&mut self, stream: &mut UnixStream, wake_buf: &mut [u8]) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if self.scan() > 0 {
                continue;
            }

            // Idle: drain the write buffer before the flag flips, so log
            // readers never wait on a sleeping engine's buffer.
            if let Err(e) = self.sink.flush() {
                warn!(error = %e, "log flush failed");
            }

            let header = self.region.header();
            header.tracer_sleeping.store(1, Ordering::Release);

            if let Some(hook) = &self.arm_sleep_hook {
                hook();
            }

            // Double-check: a probe that published before it loaded the
            // flag sent no wake byte; this re-scan catches exactly that
            // window.
            if self.scan() > 0 {
                self.region
                    .header()
                    .tracer_sleeping
                    .store(0, Ordering::Release);
                continue;
            }

            match stream.read(wake_buf) {
                Ok(0) => {
                    self.region
                        .header()
                        .tracer_sleeping
                        .store(0, Ordering::Release);
                    return;
                }
                Ok(n) => {
                    // However many bytes drained, this is one wake edge.
                    debug!(bytes = n, "wake signal");
                    self.region
                        .header()
                        .tracer_sleeping
                        .store(0, Ordering::Release);
                }
                Err(e) => {
                    self.region
                        .header()
                        .tracer_sleeping
                        .store(0, Ordering::Release);
                    debug!(error = %e, "wake read failed, treating as disconnect");
                    return;
                }
            }
        }
    }

    fn scan(&mut self) -> usize {
        let advanced = self.harvester.scan_all(&self.region, &mut self.sink);
        if advanced > 0 {
            self.records_emitted
                .fetch_add(advanced as u64, Ordering::Relaxed);
        }
        advanced
    }
}

impl EngineHandle {
    /// Stop the engine, breaking whichever blocking call it is in.
    ///
    /// Safe to call from any thread, any number of times: the token is
    /// idempotent, shutting down an already-closed socket is a no-op and
    /// the listener poke is best-effort.
    pub fn shutdown(&self) {
        self.cancel.cancel();

        // Break a blocking wake read.
        if let Some(conn) = self.conn.lock().as_ref() {
            let _ = conn.shutdown(Shutdown::Both);
        }

        // Break a blocking accept.
        let _ = UnixStream::connect(&self.sock_path);
    }

    /// Total records emitted so far.
    pub fn records_emitted(&self) -> u64 {
        self.records_emitted.load(Ordering::Relaxed)
    }
}
