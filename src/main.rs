use anyhow::{Context, Result};
use basenbridge_lib::bridge::Bridge;
use basenbridge_lib::link::SerialLink;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};
use tokio::sync::watch;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

/// Runs the user supplied cleanup command once, ignoring its outcome.
fn run_shutdown_hook(command: &str) {
    info!("Running shutdown hook: {command}");
    let status = if cfg!(target_os = "windows") {
        std::process::Command::new("cmd").args(["/C", command]).status()
    } else {
        std::process::Command::new("sh").args(["-c", command]).status()
    };
    match status {
        Ok(status) if status.success() => debug!("Shutdown hook finished"),
        Ok(status) => warn!("Shutdown hook exited with {status}"),
        Err(err) => error!("Cannot run shutdown hook: {err}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = args.bridge_config()?;
    info!("Using configuration: {config:?}");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = stop_tx.send(true);
            }
            Err(err) => {
                warn!("Cannot listen for ctrl-c, stop the process externally: {err}");
                // keep the sender alive, a dropped sender stops the bridge
                std::future::pending::<()>().await;
            }
        }
    });

    let mut bridge = Bridge::new(
        SerialLink::master(config.master.clone()),
        SerialLink::slave(config.slave.clone()),
        &config,
    )
    .with_context(|| "Cannot set up bridge")?;

    match bridge.run(stop_rx).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(command) = &args.on_fatal {
                run_shutdown_hook(command);
            }
            Err(err).with_context(|| format!("Bridge on '{}' failed", config.master.device))
        }
    }
}
