use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the corotracer engine.
///
/// Everything has a sensible default, so running without a config file is
/// fine; CLI flags override file values.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path of the shared telemetry region file. Default: /tmp/corotracer.shm.
    #[serde(default = "default_shm_path")]
    pub shm_path: PathBuf,

    /// Path of the Unix-domain wakeup socket. Default: /tmp/corotracer.sock.
    #[serde(default = "default_sock_path")]
    pub sock_path: PathBuf,

    /// Output JSONL trace file. Default: trace_output.jsonl.
    #[serde(default = "default_out_path")]
    pub out_path: PathBuf,

    /// Station capacity fixed at engine start. Default: 128.
    #[serde(default = "default_max_stations")]
    pub max_stations: u32,

    /// Write buffer in front of the trace log, in bytes. Default: 128 KiB.
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: usize,

    /// How often to log cumulative harvest statistics. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shm_path() -> PathBuf {
    PathBuf::from("/tmp/corotracer.shm")
}

fn default_sock_path() -> PathBuf {
    PathBuf::from("/tmp/corotracer.sock")
}

fn default_out_path() -> PathBuf {
    PathBuf::from("trace_output.jsonl")
}

fn default_max_stations() -> u32 {
    128
}

fn default_io_buffer_size() -> usize {
    128 * 1024
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            shm_path: default_shm_path(),
            sock_path: default_sock_path(),
            out_path: default_out_path(),
            max_stations: default_max_stations(),
            io_buffer_size: default_io_buffer_size(),
            stats_interval: default_stats_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_stations == 0 {
            bail!("max_stations must be positive");
        }

        if self.io_buffer_size == 0 {
            bail!("io_buffer_size must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.shm_path == self.sock_path || self.shm_path == self.out_path {
            bail!("shm_path must differ from sock_path and out_path");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.shm_path, PathBuf::from("/tmp/corotracer.shm"));
        assert_eq!(cfg.sock_path, PathBuf::from("/tmp/corotracer.sock"));
        assert_eq!(cfg.max_stations, 128);
        assert_eq!(cfg.io_buffer_size, 128 * 1024);
        assert_eq!(cfg.stats_interval, Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_stations() {
        let cfg = Config {
            max_stations: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_stations"));
    }

    #[test]
    fn test_validation_rejects_zero_buffer() {
        let cfg = Config {
            io_buffer_size: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("io_buffer_size"));
    }

    #[test]
    fn test_validation_rejects_colliding_paths() {
        let cfg = Config {
            shm_path: PathBuf::from("/tmp/same"),
            sock_path: PathBuf::from("/tmp/same"),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("shm_path"));
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "max_stations: 16\nout_path: /var/log/coro.jsonl\nstats_interval: 5s\n",
        )
        .expect("write config");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.max_stations, 16);
        assert_eq!(cfg.out_path, PathBuf::from("/var/log/coro.jsonl"));
        assert_eq!(cfg.stats_interval, Duration::from_secs(5));
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_load_rejects_invalid_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "max_stations: [oops\n").expect("write config");

        assert!(Config::load(&path).is_err());
    }
}
