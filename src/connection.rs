// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One task per connected peer.
//!
//! The task walks a fixed path: the first frame must authenticate the peer,
//! then an id is reserved and reported back, and from there on the task only
//! shovels messages between the socket and the dispatch loop. It never
//! touches session state itself.

use crate::dispatch::{Command, DispatchHandle};
use crate::protocol::{Body, Message, MessageCodec};
use crate::registry::ID_AUTH_FAILED;
use anyhow::{bail, Result};
use constant_time_eq::constant_time_eq;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    address: SocketAddr,
    dispatch: DispatchHandle,
    secret_digest: String,
    shutdown: CancellationToken,
) {
    match drive_connection(stream, address, dispatch, &secret_digest, shutdown).await {
        Ok(()) => debug!("Connection from {address} closed"),
        Err(error) => info!("Connection from {address} ended: {error:#}"),
    }
}

async fn drive_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    address: SocketAddr,
    dispatch: DispatchHandle,
    secret_digest: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, MessageCodec);

    let Some(first) = framed.next().await else {
        bail!("peer disconnected before authenticating");
    };
    let password = match first?.body {
        Body::Login { password } => password,
        _ => String::new(),
    };

    if !constant_time_eq(password.as_bytes(), secret_digest.as_bytes()) {
        warn!("Failed login from {address}");
        send_id_reply(&mut framed, ID_AUTH_FAILED).await?;
        return Ok(());
    }

    let id = dispatch.allocate_id().await?;
    if id < 0 {
        warn!("Session is full, turning {address} away");
        send_id_reply(&mut framed, id).await?;
        return Ok(());
    }
    debug!("Peer @ {address} authenticated as id {id}");
    send_id_reply(&mut framed, id).await?;

    // The dispatch loop reaches this peer through the sending half; the
    // receiving half stays here so socket writes happen on this task only.
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();

    let result = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if let Err(error) = framed.send(message).await {
                            break Err(error.into());
                        }
                    }
                    // The dispatch loop dropped us; nothing left to do.
                    None => break Ok(()),
                }
            }
            incoming = framed.next() => {
                match incoming {
                    None => break Ok(()),
                    Some(Err(error)) => break Err(error.into()),
                    Some(Ok(message)) => match message.body {
                        Body::Connect { name, .. } => {
                            dispatch.send(Command::Join {
                                id,
                                name,
                                address,
                                outbox: outbox_tx.clone(),
                            });
                        }
                        _ => dispatch.inbound(message),
                    }
                }
            }
        }
    };

    dispatch.disconnect(id);
    result
}

/// The id reply is the only unframed data on the wire: four characters,
/// zero-padded, sign included, e.g. `0003` or `-001`.
async fn send_id_reply<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S, MessageCodec>,
    id: i64,
) -> Result<()> {
    framed
        .get_mut()
        .write_all(format!("{id:04}").as_bytes())
        .await?;
    Ok(())
}
