use tokio_tungstenite::tungstenite;

/// Errors from the channel layer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The send queue is full; wait for the buffer to drain and retry.
    #[error("send queue full")]
    QueueFull,

    #[error("channel closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_mentions_queue() {
        // The sender's transient-error handling keys off this condition.
        assert!(ChannelError::QueueFull.to_string().contains("queue full"));
    }
}
