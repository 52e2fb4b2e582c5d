//! Agent orchestration: the harvester thread, the traced child process
//! and the background stats reporter, tied together by one cancellation
//! token.
//!
//! The harvest engine deliberately runs on a dedicated OS thread with
//! blocking sockets — its hot loop must never yield — while everything
//! around it (signals, the child process, periodic stats) lives on the
//! tokio runtime.

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{EngineHandle, HarvestEngine};
use crate::probe;

/// Agent owns the engine thread and the traced target's lifecycle.
pub struct Agent {
    cfg: Config,
    cancel: CancellationToken,
    engine: Option<EngineHandle>,
    engine_thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl Agent {
    /// Create an agent; nothing starts until [`start`](Self::start).
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
            engine: None,
            engine_thread: None,
        }
    }

    /// Token cancelled when shutdown begins; external signal handlers
    /// cancel it to stop the agent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bootstrap the engine and start the harvester thread and the stats
    /// reporter.
    pub fn start(&mut self) -> Result<()> {
        let engine = HarvestEngine::bootstrap(&self.cfg)?;
        let handle = engine.handle();

        let thread = std::thread::Builder::new()
            .name("harvester".to_string())
            .spawn(move || engine.run())
            .context("spawning harvester thread")?;

        self.spawn_stats_reporter(handle.clone());

        self.engine = Some(handle);
        self.engine_thread = Some(thread);

        info!("agent started");
        Ok(())
    }

    /// Run the target command under `sh -c` with the probe environment
    /// injected, until it exits or shutdown is requested.
    pub async fn run_target(&self, command: &str) -> Result<std::process::ExitStatus> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env(probe::ENV_SHM_PATH, &self.cfg.shm_path)
            .env(probe::ENV_SOCK_PATH, &self.cfg.sock_path)
            .env(probe::ENV_MAX_STATIONS, self.cfg.max_stations.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning target command: {command}"))?;

        info!(command, "target started");

        let finished = tokio::select! {
            status = child.wait() => Some(status.context("waiting for target")?),
            _ = self.cancel.cancelled() => None,
        };

        let status = match finished {
            Some(status) => status,
            None => {
                info!("shutdown requested, terminating target");
                child.start_kill().context("terminating target")?;
                child.wait().await.context("waiting for terminated target")?
            }
        };

        info!(%status, "target exited");
        Ok(status)
    }

    /// Stop everything: cancel background tasks, break the engine out of
    /// its blocking call and join its thread.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(engine) = &self.engine {
            engine.shutdown();
        }

        if let Some(thread) = self.engine_thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join())
                .await
                .context("joining harvester thread")?;

            match joined {
                Ok(result) => result.context("harvester exited with error")?,
                Err(_) => bail!("harvester thread panicked"),
            }
        }

        if let Some(engine) = &self.engine {
            info!(records = engine.records_emitted(), "agent stopped");
        }

        Ok(())
    }

    /// Periodically log how many records the harvester has emitted.
    fn spawn_stats_reporter(&self, engine: EngineHandle) {
        let cancel = self.cancel.clone();
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_total = 0u64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let total = engine.records_emitted();
                        let delta = total - last_total;

                        if delta == 0 {
                            continue;
                        }

                        info!(records = delta, total, "harvest stats");
                        last_total = total;
                    }
                }
            }
        });
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // Last resort if stop() was never awaited.
        if let Some(engine) = &self.engine {
            self.cancel.cancel();
            engine.shutdown();
        }

        if let Some(thread) = self.engine_thread.take() {
            if thread.join().is_err() {
                warn!("harvester thread panicked during teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            shm_path: dir.path().join("region.shm"),
            sock_path: dir.path().join("wake.sock"),
            out_path: dir.path().join("trace.jsonl"),
            max_stations: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut agent = Agent::new(test_config(&dir));

        agent.start().expect("start");
        agent.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_run_target_injects_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(&dir);
        let marker = dir.path().join("env.txt");

        let mut agent = Agent::new(cfg.clone());
        agent.start().expect("start");

        let status = agent
            .run_target(&format!(
                "echo \"$CTP_SHM_PATH:$CTP_MAX_STATIONS\" > {}",
                marker.display(),
            ))
            .await
            .expect("run target");
        assert!(status.success());

        let contents = std::fs::read_to_string(&marker).expect("read marker");
        assert_eq!(contents.trim(), format!("{}:2", cfg.shm_path.display()));

        agent.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_run_target_reports_failure_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut agent = Agent::new(test_config(&dir));
        agent.start().expect("start");

        let status = agent.run_target("exit 3").await.expect("run target");
        assert!(!status.success());

        agent.stop().await.expect("stop");
    }
}
