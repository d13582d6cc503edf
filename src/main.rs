use clap::Parser;
use std::env;
use std::error::Error;
use std::process;
use tokio::signal::unix::SignalKind;

use nxpad::bluetooth;
use nxpad::cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let log_level = match env::var("LOG_LEVEL") {
        Ok(value) => value,
        Err(_) => "info".to_string(),
    };
    env::set_var("RUST_LOG", log_level);
    env_logger::init();
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args = cli::Args::parse();

    log::info!("Starting nxpad v{}", VERSION);

    // Setup signal handlers
    let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;
    let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;

    let mut exit_code = 0;
    tokio::select! {
        result = cli::main_cli(args) => {
            if let Err(err) = result {
                log::error!("Error: {err}");
                exit_code = -1;
            }
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received CTRL+C. Shutting down.");
        },
        _ = sig_int.recv() => {
            log::info!("Received SIGINT. Shutting down.");
        },
        _ = sig_term.recv() => {
            log::info!("Received SIGTERM. Shutting down.");
        }
    }

    // Put bluetoothd's plugin configuration back the way we found it
    let restore = tokio::task::spawn_blocking(|| bluetooth::set_input_plugin_disabled(false));
    if let Ok(Err(err)) = restore.await {
        log::debug!("Could not restore bluetoothd configuration: {err}");
    }

    log::info!("nxpad stopped");
    process::exit(exit_code);
}
