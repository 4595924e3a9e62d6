//! Rendezvous client.
//!
//! Thin wrapper over the signaling WebSocket: read/write pumps plus
//! helpers that send a request and wait for its reply. Relay traffic
//! (offers, answers, candidates) is read from [`recv`](RendezvousClient::recv).

use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use futures_util::{SinkExt, StreamExt};

use crate::messages::Signal;

/// Errors from the rendezvous client.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("connection closed")]
    Closed,

    #[error("rejected: {0}")]
    Rejected(String),
}

/// A connection to the rendezvous service.
pub struct RendezvousClient {
    write_tx: mpsc::Sender<Signal>,
    inbound_rx: mpsc::Receiver<Signal>,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl RendezvousClient {
    /// Connects to the service at `url` (e.g. `ws://host:3000`).
    pub async fn connect(url: &str) -> Result<Self, RendezvousError> {
        let (stream, _) = connect_async(url).await?;
        let (mut write, mut read) = stream.split();

        let cancel = CancellationToken::new();
        let (write_tx, mut write_rx) = mpsc::channel::<Signal>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Signal>(64);
        // Pongs bypass the signal queue.
        let (pong_tx, mut pong_rx) = mpsc::channel::<tungstenite::Message>(8);

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        pong = pong_rx.recv() => match pong {
                            Some(msg) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        signal = write_rx.recv() => match signal {
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
            })
        };

        let read_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = read.next() => msg,
                    };
                    match msg {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            match serde_json::from_str::<Signal>(&text) {
                                Ok(signal) => {
                                    if inbound_tx.send(signal).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("malformed signal from service: {e}"),
                            }
                        }
                        Some(Ok(tungstenite::Message::Ping(data))) => {
                            let _ = pong_tx.send(tungstenite::Message::Pong(data)).await;
                        }
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            debug!("rendezvous connection closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("rendezvous read error: {e}");
                            break;
                        }
                    }
                }
                cancel.cancel();
            })
        };

        Ok(Self {
            write_tx,
            inbound_rx,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
        })
    }

    /// Creates a room and returns its code.
    pub async fn create_room(&mut self) -> Result<String, RendezvousError> {
        self.send(Signal::CreateRoom).await?;
        loop {
            match self.recv().await {
                Some(Signal::RoomCreated { room_code }) => return Ok(room_code),
                Some(Signal::Error { message }) => {
                    return Err(RendezvousError::Rejected(message));
                }
                Some(other) => debug!("skipping signal while awaiting room-created: {other:?}"),
                None => return Err(RendezvousError::Closed),
            }
        }
    }

    /// Joins an existing room by code.
    pub async fn join_room(&mut self, code: &str) -> Result<(), RendezvousError> {
        self.send(Signal::JoinRoom {
            room_code: code.to_string(),
        })
        .await?;
        loop {
            match self.recv().await {
                Some(Signal::RoomJoined { .. }) => return Ok(()),
                Some(Signal::Error { message }) => {
                    return Err(RendezvousError::Rejected(message));
                }
                Some(other) => debug!("skipping signal while awaiting room-joined: {other:?}"),
                None => return Err(RendezvousError::Closed),
            }
        }
    }

    /// Sends one signal to the service.
    pub async fn send(&self, signal: Signal) -> Result<(), RendezvousError> {
        self.write_tx
            .send(signal)
            .await
            .map_err(|_| RendezvousError::Closed)
    }

    /// Receives the next signal; `None` when the connection closes.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.inbound_rx.recv().await
    }

    /// Closes the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}
