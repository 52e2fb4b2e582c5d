use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use corotracer::agent::Agent;
use corotracer::config::Config;
use corotracer::{analyze, export};

/// Out-of-process coroutine scheduler tracer.
#[derive(Parser)]
#[command(name = "corotracer", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trace a target command, recording coroutine transitions to JSONL.
    Trace {
        /// Target command to execute and trace (run under `sh -c`).
        #[arg(long)]
        cmd: String,

        /// Number of stations (coroutines) to allocate.
        #[arg(short = 'n', long)]
        stations: Option<u32>,

        /// Path of the shared memory file.
        #[arg(long)]
        shm: Option<PathBuf>,

        /// Path of the Unix domain wakeup socket.
        #[arg(long)]
        sock: Option<PathBuf>,

        /// Output JSONL file path.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Run offline analysis on an existing JSONL trace file.
    Analyze {
        /// Input JSONL trace file.
        #[arg(short, long, default_value = "trace_output.jsonl")]
        input: PathBuf,

        /// Output Markdown report path.
        #[arg(short, long, default_value = "coro_report.md")]
        output: PathBuf,
    },

    /// Export a trace to an interactive HTML dashboard.
    Export {
        /// Input JSONL trace file.
        #[arg(short, long, default_value = "trace_output.jsonl")]
        input: PathBuf,

        /// Output HTML dashboard path.
        #[arg(short, long, default_value = "coro_dashboard.html")]
        output: PathBuf,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("corotracer {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Trace {
            cmd,
            stations,
            shm,
            sock,
            out,
        } => {
            if let Some(stations) = stations {
                cfg.max_stations = stations;
            }
            if let Some(shm) = shm {
                cfg.shm_path = shm;
            }
            if let Some(sock) = sock {
                cfg.sock_path = sock;
            }
            if let Some(out) = out {
                cfg.out_path = out;
            }
            cfg.validate()?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting corotracer",
            );

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;

            rt.block_on(async { trace(cfg, &cmd).await })
        }
        Command::Analyze { input, output } => {
            let report = analyze::analyze_file(&input)?;
            analyze::write_report(&report, &output)?;
            Ok(())
        }
        Command::Export { input, output } => export::generate_html(&input, &output),
        Command::Version => unreachable!("handled above"),
    }
}

async fn trace(cfg: Config, cmd: &str) -> Result<()> {
    let mut agent = Agent::new(cfg);
    agent.start()?;

    // Cancel the agent on SIGINT/SIGTERM.
    let cancel = agent.cancel_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });

    let status = agent.run_target(cmd).await?;

    // One final harvest pass happens inside stop(): the engine finishes
    // its in-flight scan and flushes before the region is torn down.
    agent.stop().await?;

    if !status.success() {
        tracing::warn!(%status, "target exited with failure");
    }

    tracing::info!("corotracer stopped");

    Ok(())
}
