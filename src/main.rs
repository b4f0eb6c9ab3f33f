// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::Parser;
use ensemble::{
    cli_ask,
    config::{AppConfig, Settings, DEFAULT_PORT},
    logging,
    server::Server,
};
use std::path::PathBuf;
use tokio::signal;
use tracing::debug;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// The port to listen on. When it is taken, the next free one is used.
    #[arg(long)]
    port: Option<u16>,
    /// Record every dispatched message to a log file for later replay.
    #[arg(long)]
    log: bool,
    /// The session password. Asked for on the terminal when not given.
    #[arg(long, env = "ENSEMBLE_SECRET")]
    secret: Option<String>,
    /// An ini file with `port` and `log` keys.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where the logs/ directory is created. Defaults to the current directory.
    #[arg(long)]
    directory: Option<PathBuf>,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();

    logging::initialize(cli.debug).context("Failed to initialize logging")?;

    let file_config = cli.config.as_deref().and_then(AppConfig::from_config_file);
    let app_config = AppConfig {
        port: cli.port,
        log_to_file: cli.log.then_some(true),
    }
    .merge(file_config);

    let password = match cli.secret {
        Some(password) => password,
        None => cli_ask::ask_password()?,
    };

    let directory = cli
        .directory
        .unwrap_or_else(|| std::env::current_dir().expect("Could not access current directory"));

    let settings = Settings {
        port: app_config.port.unwrap_or(DEFAULT_PORT),
        log_to_file: app_config.log_to_file.unwrap_or(false),
        root_dir: directory,
        secret_digest: Settings::digest(&password),
    };

    let server = Server::start(settings)
        .await
        .context("Failed to launch the server")?;

    wait_for_shutdown().await;
    server
        .shutdown("Server stopped from the keyboard. Please close your session.")
        .await;
    Ok(())
}

async fn wait_for_shutdown() {
    let mut signal_terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Should have been able to create terminate signal stream");
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Got SIGINT (Ctrl+C), shutting down");
        }
        _ = signal_terminate.recv() => {
            debug!("Got SIGTERM, shutting down");
        }
    }
}
