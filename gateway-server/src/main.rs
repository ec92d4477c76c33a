//! Entry point: CLI parsing, logging setup, config load, and the
//! top-level run/restart loop around the axum server.
//!
//! Grounded on `ferrex-server/src/main.rs::main()` for the
//! args-then-logging-then-serve shape, and on `moonraker.py::main()` for
//! the CLI contract itself (`-c`/`-l`/`-n`, SIGTERM-clean-shutdown,
//! restart-unless-terminated-after-0.5s) — spec §6.

mod components;
mod config;
mod handlers;
mod logging;
mod routes;
mod state;
#[cfg(test)]
mod tests;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use config::Config;
use state::AppState;
use tokio::signal::unix::{signal, SignalKind};

/// `<program> [-c config-path] [-l log-path] [-n]`
#[derive(Parser, Debug)]
#[command(name = "gateway", version, about = "API gateway fronting a local 3D-printer control process")]
struct Args {
    /// Path to the TOML configuration file. Defaults to `~/gateway.conf`.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Path to the log file. Defaults to `/tmp/gateway.log`.
    #[arg(short = 'l', long = "log")]
    log: Option<PathBuf>,

    /// Disable file logging entirely (stderr logging is always on).
    #[arg(short = 'n', long = "nologfile")]
    nologfile: bool,
}

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join("gateway.conf")).unwrap_or_else(|| PathBuf::from("gateway.conf"))
}

/// Why the run loop ended one iteration.
enum RunOutcome {
    /// SIGTERM was received; shutdown completed cleanly. Process should exit 0.
    Terminated,
    /// The serve future returned on its own (listener error, no termination
    /// signal observed). Per spec §6, the outer loop restarts after 0.5s.
    Restart,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {err}", config_path.display());
            std::process::exit(1);
        }
    };

    if args.nologfile {
        config.misc.nologfile = true;
    }
    if let Some(log_path) = args.log.clone() {
        config.misc.log_path = log_path;
    }

    let log_path = if config.misc.nologfile { None } else { Some(config.misc.log_path.clone()) };
    let _logging_guard = logging::init(log_path.as_deref());

    tracing::info!(config = %config_path.display(), "starting gateway");

    loop {
        match run_once(config.clone()).await {
            Ok(RunOutcome::Terminated) => {
                tracing::info!("shutdown complete");
                std::process::exit(0);
            }
            Ok(RunOutcome::Restart) => {
                tracing::warn!("server loop exited without a termination signal, restarting in 0.5s");
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            Err(err) => {
                tracing::error!(%err, "fatal startup error");
                std::process::exit(1);
            }
        }
    }
}

/// Builds server state, binds the listening socket, and serves until
/// either SIGTERM arrives (clean shutdown, §6) or the serve future
/// returns on its own (listener-level error with no termination signal
/// observed, in which case the caller restarts after 0.5s).
///
/// TLS is out of scope for this gateway: spec §6 describes a plain TCP
/// listener carrying both HTTP and WebSocket traffic on one port, with
/// no HTTPS surface in the external-interface contract.
async fn run_once(config: Config) -> anyhow::Result<RunOutcome> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let state = AppState::build(config).await?;
    let app = routes::create_app(state.clone());

    let mut sigterm = signal(SignalKind::terminate())?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            result?;
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            state.shutdown().await;
            return Ok(RunOutcome::Terminated);
        }
    }

    Ok(RunOutcome::Restart)
}
