// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wires everything together: binds the listener, spawns the dispatch loop,
//! and hands every accepted socket to its own connection task.

use crate::config::Settings;
use crate::connection::handle_connection;
use crate::dispatch::DispatchHandle;
use crate::session_log::SessionLog;
use anyhow::{Context, Result};
use local_ip_address::local_ip;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Server {
    local_addr: SocketAddr,
    dispatch: DispatchHandle,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn start(settings: Settings) -> Result<Self> {
        let listener = bind_probing(settings.port).await?;
        let local_addr = listener.local_addr()?;

        let session_log = if settings.log_to_file {
            let log = SessionLog::create(&settings.root_dir)?;
            info!("Recording the session to {}", log.path().display());
            Some(log)
        } else {
            None
        };

        let shutdown = CancellationToken::new();
        let dispatch = DispatchHandle::spawn(session_log, shutdown.clone());

        // The address peers can actually reach, as opposed to the 0.0.0.0
        // we are bound to.
        let advertised = local_ip().map_or_else(
            |_| "localhost".to_string(),
            |ip| ip.to_string(),
        );
        info!("Server running @ {} on port {}", advertised, local_addr.port());

        let accept_dispatch = dispatch.clone();
        let accept_shutdown = shutdown.clone();
        let secret_digest = settings.secret_digest;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, address)) => {
                            tokio::spawn(handle_connection(
                                stream,
                                address,
                                accept_dispatch.clone(),
                                secret_digest.clone(),
                                accept_shutdown.clone(),
                            ));
                        }
                        Err(error) => {
                            error!("Error accepting connection: {error}");
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            dispatch,
            shutdown,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.dispatch.clone()
    }

    /// Tells all peers the session is over and waits until the dispatch loop
    /// has drained and cancelled everything.
    pub async fn shutdown(&self, reason: &str) {
        self.dispatch.shutdown(reason);
        self.shutdown.cancelled().await;
    }
}

/// Binds `0.0.0.0:<port>`; when the port is taken, probes the following
/// ones until one is free. Port 0 asks the OS for any port.
async fn bind_probing(port: u16) -> Result<TcpListener> {
    let mut candidate = port;
    loop {
        match TcpListener::bind(("0.0.0.0", candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    info!("Port {port} is taken, listening on {candidate} instead");
                }
                return Ok(listener);
            }
            Err(error) if error.kind() == io::ErrorKind::AddrInUse => {
                candidate = candidate
                    .checked_add(1)
                    .context("Ran out of ports to probe")?;
            }
            Err(error) => return Err(error).context("Failed to bind the listener"),
        }
    }
}
