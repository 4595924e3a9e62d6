use serde::{Deserialize, Serialize};

/// A control frame: a JSON record with a `type` discriminant.
///
/// Control frames ride the channel as text and steer the transfer;
/// sub-chunk payloads ride separately as binary [`DataFrame`]s.
///
/// [`DataFrame`]: crate::DataFrame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Announces a new transfer: the receiver derives its chunk plan
    /// from these totals.
    #[serde(rename_all = "camelCase")]
    FileStart {
        name: String,
        size: u64,
        main_count: u32,
        sub_count: u32,
    },

    /// Announces the digest of the data frame that immediately follows.
    #[serde(rename_all = "camelCase")]
    ChunkMetadata {
        flat_index: u32,
        main_index: u32,
        sub_index: u32,
        /// Lowercase hex SHA-256 of the sub-chunk payload.
        digest: String,
    },

    /// Receiver verdict on a single sub-chunk.
    #[serde(rename_all = "camelCase")]
    ChunkAck { flat_index: u32, ok: bool },

    /// Receiver-side gap report: every listed index needs retransmission.
    #[serde(rename_all = "camelCase")]
    ChunkNack { flat_indexes: Vec<u32> },

    /// All sub-chunks accounted for on the emitting side.
    TransferComplete,

    /// Receiver request to resend one sub-chunk (digest mismatch).
    #[serde(rename_all = "camelCase")]
    RetryRequest { flat_index: u32 },

    /// Session-fatal condition reported to the peer.
    Error { message: String },
}
