//! Wire protocol shared by both peers and the rendezvous service.
//!
//! Two frame families share the bulk channel:
//!
//! - **Control frames**: JSON records with a `type` discriminant,
//!   carried as text.
//! - **Data frames**: binary blobs tagged with a reserved first byte,
//!   followed by a little-endian `(flat_index, payload_length)` header
//!   and the sub-chunk payload.
//!
//! Discrimination is total: text is always control, binary must carry
//! the tag byte. Anything else is a [`FramingError`].

pub mod constants;
mod control;
mod frame;

pub use control::ControlFrame;
pub use frame::{DataFrame, FramingError, WireFrame, decode_control, encode_control};
