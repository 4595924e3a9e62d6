//! Bulk transfer engine.
//!
//! One file per session, split by a two-level [`ChunkPlan`] into main
//! chunks (progress granularity) and sub-chunks (integrity and
//! acknowledgement granularity). The [`Sender`] reads sub-chunks from a
//! [`Source`], digests them, and emits metadata/data frame pairs under
//! backpressure and admission control; the [`Receiver`] verifies
//! digests, acknowledges, streams the verified prefix to a [`Sink`],
//! and nacks gaps. Each pipeline is a single owning task: all transfer
//! state is mutated serially, with blocking I/O hopped to the blocking
//! pool.

mod integrity;
mod phase;
mod plan;
mod receiver;
mod sender;
mod sink;
mod source;
mod stats;

pub use integrity::digest_hex;
pub use phase::{Phase, Role, SessionState, StateError};
pub use plan::{ChunkParams, ChunkPlan, MainChunk, PlanError, SubChunk};
pub use receiver::Receiver;
pub use sender::{Reconnect, Sender};
pub use sink::{FileSink, MemorySink, Sink};
pub use source::{FileSource, MemorySource, Source};
pub use stats::{StatsSnapshot, TransferStats};

use std::time::Duration;

use tokio::sync::mpsc;

use beamdrop_protocol::FramingError;
use beamdrop_protocol::constants::{
    GAP_SCAN_GRACE, HIGH_WATER_MARK, MAX_CONCURRENT_SENDS, MAX_RETRIES, NACK_BATCH_LIMIT,
};

/// Engine tuning parameters. Defaults come from the protocol constants.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub params: ChunkParams,
    /// Sender pauses while the channel buffers more than this.
    pub high_water_mark: u64,
    /// Ceiling on in-flight unacknowledged sub-chunks.
    pub max_concurrent_sends: usize,
    /// Per-sub-chunk retry budget.
    pub max_retries: u32,
    /// Quiet period before the receiver scans for gaps.
    pub gap_scan_grace: Duration,
    /// Largest `chunk-nack` batch.
    pub nack_batch_limit: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            params: ChunkParams::default(),
            high_water_mark: HIGH_WATER_MARK,
            max_concurrent_sends: MAX_CONCURRENT_SENDS,
            max_retries: MAX_RETRIES,
            gap_scan_grace: GAP_SCAN_GRACE,
            nack_batch_limit: NACK_BATCH_LIMIT,
        }
    }
}

/// Progress notifications emitted by both pipelines.
///
/// The engine never owns a UI; callers hand in the sender half of a
/// channel and render however they like. `Progress` sends are lossy so
/// a slow consumer cannot stall the pipelines.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started { name: String, size: u64 },
    Progress(StatsSnapshot),
    Completed(StatsSnapshot),
    Interrupted { error: String },
}

/// Sender half for [`TransferEvent`] notifications.
pub type EventSender = mpsc::Sender<TransferEvent>;

/// Fatal transfer failures. Transient conditions (queue-full sends,
/// single digest mismatches) are recovered inside the pipelines and
/// never surface here.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("framing: {0}")]
    Framing(#[from] FramingError),

    #[error("too many consecutive framing errors")]
    FramingLimit,

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("sub-chunk {flat_index} failed digest verification after all retries")]
    DigestExhausted { flat_index: u32 },

    #[error("sub-chunk {flat_index} exceeded its retry budget")]
    RetriesExhausted { flat_index: u32 },

    #[error("source read failed: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("sink write failed: {0}")]
    SinkWrite(#[source] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("assembled {got} bytes, announced size was {expected}")]
    AssemblyLengthMismatch { expected: u64, got: u64 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("peer reported: {0}")]
    Peer(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cancelled")]
    Cancelled,
}
