//! Rendezvous service.
//!
//! Pairs two endpoints by a short one-time room code and relays their
//! connection-setup descriptors until the direct channel comes up. No
//! persistence: a room lives exactly as long as its host's connection.
//!
//! Wire format: JSON [`Signal`] records over a WebSocket, TCP port 3000
//! by default.

mod client;
mod messages;
mod server;

pub use client::{RendezvousClient, RendezvousError};
pub use messages::Signal;
pub use server::{RendezvousServer, ServerConfig, ServerError};
