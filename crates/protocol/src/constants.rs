//! Protocol constants and default tuning parameters.

use std::time::Duration;

/// Size of a main chunk (50 MiB): the coarse unit of progress reporting.
pub const MAIN_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Size of a sub-chunk (1 MiB): the unit of integrity verification,
/// acknowledgement, and of a single data-frame payload.
pub const SUB_CHUNK_SIZE: u64 = 1024 * 1024;

/// Sender pauses while the channel's buffered amount exceeds this (64 MiB).
pub const HIGH_WATER_MARK: u64 = 64 * 1024 * 1024;

/// The low-water event fires when the buffered amount drops below this (1 MiB).
pub const LOW_WATER_THRESHOLD: u64 = 1024 * 1024;

/// Ceiling on in-flight unacknowledged sub-chunks.
pub const MAX_CONCURRENT_SENDS: usize = 3;

/// Per-sub-chunk retry budget before the transfer is declared fatal.
pub const MAX_RETRIES: u32 = 3;

/// Reserved first byte tagging binary data frames on the wire.
pub const DATA_FRAME_TAG: u8 = 0xFF;

/// Bytes of data-frame framing ahead of the payload: tag + two u32 fields.
pub const DATA_FRAME_OVERHEAD: usize = 9;

/// Number of digits in a rendezvous room code.
pub const ROOM_CODE_DIGITS: u32 = 4;

/// Inclusive room-code range: uniform in [1000, 9999].
pub const ROOM_CODE_MIN: u32 = 1000;
pub const ROOM_CODE_MAX: u32 = 9999;

/// Default TCP port for the rendezvous service.
pub const RENDEZVOUS_PORT: u16 = 3000;

/// Time allowed for a recreated channel to become ready again.
pub const READY_WAIT: Duration = Duration::from_secs(10);

/// Consecutive framing errors on one channel before the session is fatal.
pub const FRAMING_ERROR_LIMIT: u32 = 3;

/// Largest batch of flat indexes carried in a single `chunk-nack`.
pub const NACK_BATCH_LIMIT: usize = 64;

/// Quiet period with no receive progress before a gap scan runs.
pub const GAP_SCAN_GRACE: Duration = Duration::from_secs(3);

/// Floor for the adaptive inter-send delay.
pub const SEND_DELAY_MIN: Duration = Duration::from_millis(50);

/// Ceiling for the adaptive inter-send delay.
pub const SEND_DELAY_MAX: Duration = Duration::from_millis(500);

/// Maximum frame size accepted by the WebSocket transport adapter.
///
/// Must fit a full sub-chunk plus framing overhead with headroom.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// How often the WebSocket adapter sends keepalive pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);
