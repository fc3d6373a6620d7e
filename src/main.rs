//! Entry point: parses the CLI/config, sets up structured logging, then
//! hands off to [`stapled::supervisor::Supervisor`] for the life of the
//! process.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stapled::config::{Cli, Config};
use stapled::errhandler;
use stapled::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    let config = Config::load(&cli)?;
    let one_off = config.one_off;

    let (supervisor, queues) = Supervisor::new(config);
    let stop = supervisor.stop_handle();

    if !one_off {
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            stop.notify_waiters();
        });
    }

    supervisor.run(queues).await?;

    if one_off && errhandler::critical_count() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Default to INFO, but let `-v`/`-vv`/`-vvv` step down to DEBUG/TRACE, and
/// always respect `RUST_LOG` if the caller set one.
fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stapled={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
