// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The dispatch loop: one task that owns all shared session state.
//!
//! Connection handlers never touch the document, the revision log, the
//! authorship map or the peer registry. They turn everything that happens on
//! their socket into a [`Command`] and enqueue it here; this actor consumes
//! one command at a time, so edits are serialized by construction and no
//! transform can ever observe a half-updated log.
//!
//! While a join handshake is in flight, all messages except the
//! acknowledgements are parked in a side buffer and replayed in order once
//! every peer has confirmed the new baseline. (Dropping them instead would
//! silently lose edits from peers that typed during the handshake.)

use crate::annotation::AuthorMap;
use crate::engine::Engine;
use crate::protocol::{Body, Message, Snapshot};
use crate::registry::{Peer, Registry};
use crate::session_log::SessionLog;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub enum Command {
    /// Reserve a peer id during authentication.
    AllocateId {
        response_tx: oneshot::Sender<i64>,
    },
    /// An authenticated peer sent its connect handshake.
    Join {
        id: i64,
        name: String,
        address: SocketAddr,
        outbox: mpsc::UnboundedSender<Message>,
    },
    /// Any other message read from a peer's socket.
    Inbound(Message),
    /// A peer's socket closed or failed.
    Disconnect { id: i64 },
    /// Server-side announcement, fanned out as a `Response` message.
    Notice(String),
    /// Stop the session: broadcast a `Kill`, drain, and cancel.
    Shutdown { reason: String },
}

#[derive(Clone)]
pub struct DispatchHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl DispatchHandle {
    /// Spawns the dispatch actor and returns the handle every connection
    /// handler gets a clone of.
    #[must_use]
    pub fn spawn(session_log: Option<SessionLog>, shutdown: CancellationToken) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let actor = DispatchActor::new(command_rx, session_log, shutdown);
        tokio::spawn(actor.run());
        Self { command_tx }
    }

    pub fn send(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            debug!("Dispatch loop is gone, dropping command");
        }
    }

    pub async fn allocate_id(&self) -> Result<i64> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(Command::AllocateId { response_tx });
        response_rx
            .await
            .context("Dispatch loop did not answer the id request")
    }

    pub fn inbound(&self, message: Message) {
        self.send(Command::Inbound(message));
    }

    pub fn disconnect(&self, id: i64) {
        self.send(Command::Disconnect { id });
    }

    pub fn notice(&self, text: &str) {
        self.send(Command::Notice(text.to_string()));
    }

    pub fn shutdown(&self, reason: &str) {
        self.send(Command::Shutdown {
            reason: reason.to_string(),
        });
    }
}

struct DispatchActor {
    command_rx: mpsc::UnboundedReceiver<Command>,
    engine: Engine,
    authors: AuthorMap,
    registry: Registry,
    /// Messages parked while a join handshake is waiting for acks.
    deferred: VecDeque<Message>,
    session_log: Option<SessionLog>,
    shutdown: CancellationToken,
}

impl DispatchActor {
    fn new(
        command_rx: mpsc::UnboundedReceiver<Command>,
        session_log: Option<SessionLog>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            command_rx,
            engine: Engine::default(),
            authors: AuthorMap::default(),
            registry: Registry::default(),
            deferred: VecDeque::new(),
            session_log,
            shutdown,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                Command::AllocateId { response_tx } => {
                    let _ = response_tx.send(self.registry.allocate_id());
                }
                Command::Join {
                    id,
                    name,
                    address,
                    outbox,
                } => self.handle_join(id, name, address, outbox),
                Command::Inbound(message) => self.handle_inbound(message),
                Command::Disconnect { id } => self.remove_peer(id),
                Command::Notice(text) => {
                    self.broadcast(&Message::server(Body::Response { text }));
                }
                Command::Shutdown { reason } => {
                    self.handle_shutdown(reason).await;
                    break;
                }
            }
        }
        debug!("Dispatch loop stopped");
    }

    /// Admits a new peer and runs the whole join handshake. Everyone learns
    /// about the newcomer, the newcomer learns about everyone, the revision
    /// history is cut, and a fresh baseline is pushed to all peers.
    fn handle_join(
        &mut self,
        id: i64,
        name: String,
        address: SocketAddr,
        outbox: mpsc::UnboundedSender<Message>,
    ) {
        if self.registry.contains_address(&address) {
            debug!("Ignoring repeated connect handshake from {address}");
            return;
        }
        info!("New connection from {address}");

        self.registry.await_acks();
        self.registry
            .admit(Peer::new(id, name.clone(), address, outbox));

        let hello = Message::new(
            id,
            Body::Connect {
                name,
                hostname: address.ip().to_string(),
                port: address.port(),
            },
        );
        self.send_to_all(&hello);

        let introductions: Vec<Message> = self
            .registry
            .iter()
            .filter(|peer| peer.id != id)
            .map(|peer| {
                Message::new(
                    peer.id,
                    Body::Connect {
                        name: peer.name.clone(),
                        hostname: peer.address.ip().to_string(),
                        port: peer.address.port(),
                    },
                )
            })
            .collect();
        for introduction in introductions {
            self.send_to(id, introduction);
        }

        self.send_to_all(&Message::server(Body::RequestAck));

        // Everyone restarts from revision 0 on the snapshot below.
        self.engine.clear_history();
        self.send_to_all(&Message::server(Body::Reset(self.snapshot())));
    }

    fn handle_inbound(&mut self, message: Message) {
        if self.registry.awaiting_ack() {
            if matches!(message.body, Body::ConnectAck) {
                self.registry.record_ack(message.src_id);
                if !self.registry.awaiting_ack() {
                    debug!(
                        "Handshake complete, replaying {} deferred messages",
                        self.deferred.len()
                    );
                    self.replay_deferred();
                }
            } else {
                debug!("Handshake in flight, deferring message from {}", message.src_id);
                self.deferred.push_back(message);
            }
            return;
        }
        self.process_message(message);
    }

    fn replay_deferred(&mut self) {
        while let Some(message) = self.deferred.pop_front() {
            self.process_message(message);
        }
    }

    fn process_message(&mut self, mut message: Message) {
        if let Body::Operation {
            revision,
            operation,
        } = &message.body
        {
            let revision = *revision;
            match self.engine.receive_operation(revision, operation.clone()) {
                Ok(transformed) => {
                    if let Err(error) = self.authors.record(&transformed, message.src_id) {
                        warn!("Authorship map out of sync: {error}");
                    }
                    if let Some(peer) = self.registry.get_mut(message.src_id) {
                        peer.cursor_index = transformed.target_len();
                    }
                    message.body = Body::Operation {
                        revision,
                        operation: transformed,
                    };
                }
                Err(error) => {
                    // The peer and the server disagree about the document.
                    // Fatal for this edit, not for the session.
                    warn!("Dropping operation from peer {}: {error}", message.src_id);
                    return;
                }
            }
        } else if matches!(message.body, Body::GetAll) {
            let snapshot = self.snapshot();
            self.send_to(message.src_id, Message::server(Body::SetAll(snapshot)));
            return;
        }

        if let Some(log) = &mut self.session_log {
            log.record(&message);
        }
        self.broadcast(&message);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            document: self.engine.document().to_string(),
            ranges: self.authors.ranges(),
            locs: self
                .registry
                .iter()
                .map(|peer| (peer.id, peer.cursor_index))
                .collect(),
        }
    }

    /// Fan-out with reply suppression: the author only hears its own message
    /// back when the reply flag is set.
    fn broadcast(&mut self, message: &Message) {
        let dead: Vec<i64> = self
            .registry
            .iter()
            .filter(|peer| peer.id != message.src_id || message.reply)
            .filter_map(|peer| peer.send(message.clone()).is_err().then_some(peer.id))
            .collect();
        for id in dead {
            self.remove_peer(id);
        }
    }

    /// Fan-out without suppression, used by the join handshake.
    fn send_to_all(&mut self, message: &Message) {
        let dead: Vec<i64> = self
            .registry
            .iter()
            .filter_map(|peer| peer.send(message.clone()).is_err().then_some(peer.id))
            .collect();
        for id in dead {
            self.remove_peer(id);
        }
    }

    fn send_to(&mut self, id: i64, message: Message) {
        if let Some(peer) = self.registry.get(id) {
            if peer.send(message).is_err() {
                self.remove_peer(id);
            }
        }
    }

    fn remove_peer(&mut self, id: i64) {
        let was_waiting = self.registry.awaiting_ack();
        let Some(peer) = self.registry.evict(id) else {
            return;
        };
        info!("Peer {} @ {} left the session", peer.name, peer.address);
        self.send_to_all(&Message::server(Body::Remove { client_id: id }));
        if was_waiting && !self.registry.awaiting_ack() {
            self.replay_deferred();
        }
    }

    async fn handle_shutdown(&mut self, reason: String) {
        info!("Shutting down the session: {reason}");
        self.send_to_all(&Message::server(Body::Kill { text: reason }));
        // Give the connection tasks a moment to flush their sockets.
        sleep(Duration::from_millis(500)).await;
        self.shutdown.cancel();
    }
}
