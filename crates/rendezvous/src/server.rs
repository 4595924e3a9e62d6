//! The rendezvous server.
//!
//! Listens on a TCP port, upgrades connections to WebSocket, and keeps
//! an in-memory room table. A host creates a room and receives a
//! 4-digit code; a guest joins with the code; thereafter the server
//! relays descriptors opaquely between the two until either side hangs
//! up. Rooms evaporate when the host disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_protocol::constants::{RENDEZVOUS_PORT, ROOM_CODE_MAX, ROOM_CODE_MIN};

use crate::messages::Signal;

/// How many random draws to try before giving up on a free code.
const CODE_ATTEMPTS: usize = 128;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: RENDEZVOUS_PORT,
        }
    }
}

/// Errors from the rendezvous server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),
}

#[derive(Clone)]
struct PeerHandle {
    client_id: String,
    tx: mpsc::Sender<Signal>,
}

struct Room {
    host: PeerHandle,
    guest: Option<PeerHandle>,
}

/// Which side of a room this connection holds, once established.
enum ConnRole {
    Host { code: String },
    Guest { code: String },
}

/// The rendezvous service.
pub struct RendezvousServer {
    port: u16,
    rooms: Arc<Mutex<HashMap<String, Room>>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RendezvousServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the bound address once [`run`](Self::run) has started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("rendezvous server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("rendezvous server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("accept error: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let ws = accept_async(stream).await?;
        let (mut write, mut read) = ws.split();
        let client_id = uuid::Uuid::new_v4().to_string();
        debug!(%peer_addr, client = %client_id, "rendezvous connection established");

        let (tx, mut rx) = mpsc::channel::<Signal>(64);
        let cancel = self.cancel.clone();

        // Write pump: relayed and reply signals out to this peer.
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = rx.recv() => match signal {
                        Some(signal) => {
                            let Ok(json) = serde_json::to_string(&signal) else { continue };
                            if write.send(tungstenite::Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = write.send(tungstenite::Message::Close(None)).await;
        });

        let mut role: Option<ConnRole> = None;

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = read.next() => msg,
            };
            match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match serde_json::from_str::<Signal>(&text) {
                        Ok(signal) => {
                            self.dispatch(&client_id, &tx, &mut role, signal).await;
                        }
                        Err(e) => {
                            warn!(client = %client_id, "malformed signal: {e}");
                            let _ = tx
                                .send(Signal::Error {
                                    message: "malformed signal".into(),
                                })
                                .await;
                        }
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = %client_id, "read error: {e}");
                    break;
                }
            }
        }

        self.cleanup(&client_id, role.as_ref()).await;
        writer.abort();
        Ok(())
    }

    async fn dispatch(
        &self,
        client_id: &str,
        tx: &mpsc::Sender<Signal>,
        role: &mut Option<ConnRole>,
        signal: Signal,
    ) {
        match signal {
            Signal::CreateRoom => {
                if role.is_some() {
                    let _ = tx
                        .send(Signal::Error {
                            message: "already in a room".into(),
                        })
                        .await;
                    return;
                }
                match self.create_room(client_id, tx.clone()).await {
                    Some(code) => {
                        info!(client = %client_id, room = %code, "room created");
                        *role = Some(ConnRole::Host { code: code.clone() });
                        let _ = tx.send(Signal::RoomCreated { room_code: code }).await;
                    }
                    None => {
                        let _ = tx
                            .send(Signal::Error {
                                message: "no room codes available".into(),
                            })
                            .await;
                    }
                }
            }

            Signal::JoinRoom { room_code } => {
                if role.is_some() {
                    let _ = tx
                        .send(Signal::Error {
                            message: "already in a room".into(),
                        })
                        .await;
                    return;
                }
                let host = {
                    let mut rooms = self.rooms.lock().await;
                    match rooms.get_mut(&room_code) {
                        Some(room) if room.guest.is_none() => {
                            room.guest = Some(PeerHandle {
                                client_id: client_id.to_string(),
                                tx: tx.clone(),
                            });
                            Some(room.host.clone())
                        }
                        _ => None,
                    }
                };
                match host {
                    Some(host) => {
                        info!(client = %client_id, room = %room_code, "guest joined");
                        *role = Some(ConnRole::Guest {
                            code: room_code.clone(),
                        });
                        let _ = tx.send(Signal::RoomJoined { room_code }).await;
                        let _ = host
                            .tx
                            .send(Signal::ClientJoined {
                                client_id: client_id.to_string(),
                            })
                            .await;
                    }
                    None => {
                        let _ = tx
                            .send(Signal::Error {
                                message: "invalid room".into(),
                            })
                            .await;
                    }
                }
            }

            relay @ (Signal::Offer { .. }
            | Signal::Answer { .. }
            | Signal::IceCandidate { .. }) => {
                let peer = self.counterpart(role.as_ref()).await;
                match peer {
                    Some(peer) => {
                        let _ = peer.tx.send(relay).await;
                    }
                    None => {
                        debug!(client = %client_id, "dropping descriptor with no peer to relay to");
                    }
                }
            }

            other => {
                warn!(client = %client_id, "unexpected signal: {other:?}");
                let _ = tx
                    .send(Signal::Error {
                        message: "unexpected signal".into(),
                    })
                    .await;
            }
        }
    }

    /// Draws an unused 4-digit code and registers the room.
    async fn create_room(&self, client_id: &str, tx: mpsc::Sender<Signal>) -> Option<String> {
        let mut rooms = self.rooms.lock().await;
        for _ in 0..CODE_ATTEMPTS {
            let code = rand::thread_rng()
                .gen_range(ROOM_CODE_MIN..=ROOM_CODE_MAX)
                .to_string();
            if rooms.contains_key(&code) {
                continue;
            }
            rooms.insert(
                code.clone(),
                Room {
                    host: PeerHandle {
                        client_id: client_id.to_string(),
                        tx,
                    },
                    guest: None,
                },
            );
            return Some(code);
        }
        None
    }

    /// The other end of this connection's room, if present.
    async fn counterpart(&self, role: Option<&ConnRole>) -> Option<PeerHandle> {
        let rooms = self.rooms.lock().await;
        match role {
            Some(ConnRole::Host { code }) => rooms.get(code).and_then(|r| r.guest.clone()),
            Some(ConnRole::Guest { code }) => rooms.get(code).map(|r| r.host.clone()),
            None => None,
        }
    }

    async fn cleanup(&self, client_id: &str, role: Option<&ConnRole>) {
        let mut rooms = self.rooms.lock().await;
        match role {
            Some(ConnRole::Host { code }) => {
                // Rooms evaporate with their host.
                rooms.remove(code);
                info!(client = %client_id, room = %code, "host left, room removed");
            }
            Some(ConnRole::Guest { code }) => {
                if let Some(room) = rooms.get_mut(code) {
                    if room
                        .guest
                        .as_ref()
                        .is_some_and(|g| g.client_id == client_id)
                    {
                        room.guest = None;
                        debug!(client = %client_id, room = %code, "guest left");
                    }
                }
            }
            None => {}
        }
    }
}
