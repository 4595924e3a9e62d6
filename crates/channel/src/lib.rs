//! The bulk-transfer channel: a reliable, in-order, bidirectional frame
//! pipe with the flow-control surface the transfer engine consumes:
//! `buffered_amount`, a low-water event, and close signaling.
//!
//! Two implementations share the same [`Channel`] handle:
//!
//! - [`memory`]: an in-process pair for deterministic tests, with
//!   delivery gating and frame-tap hooks.
//! - [`ws`]: a WebSocket adapter (control frames as text, data frames
//!   as tagged binary) driven by read/write/ping pump tasks.

mod channel;
mod error;
pub mod memory;
pub mod ws;

pub use channel::{Channel, ChannelConfig, FlowControl};
pub use error::ChannelError;
