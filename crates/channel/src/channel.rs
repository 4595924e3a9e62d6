//! The shared channel handle.
//!
//! A [`Channel`] is one endpoint of an ordered frame pipe. Outbound
//! frames enter a bounded queue drained by a transport pump; the bytes
//! still queued are the channel's `buffered_amount`, and a low-water
//! notification fires when draining takes it below the configured
//! threshold. Those two signals are the only flow control the transfer
//! engine relies on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use beamdrop_protocol::constants::{LOW_WATER_THRESHOLD, SUB_CHUNK_SIZE};
use beamdrop_protocol::{FramingError, WireFrame};

use crate::ChannelError;

/// Channel tuning parameters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Buffered amount below which the low-water event fires.
    pub low_water_threshold: u64,
    /// Largest accepted data-frame payload (decode bound).
    pub max_payload: u64,
    /// Outbound queue capacity in frames. A full queue surfaces
    /// [`ChannelError::QueueFull`].
    pub send_queue_frames: usize,
    /// Inbound queue capacity in frames.
    pub recv_queue_frames: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            low_water_threshold: LOW_WATER_THRESHOLD,
            max_payload: SUB_CHUNK_SIZE,
            send_queue_frames: 256,
            recv_queue_frames: 256,
        }
    }
}

/// Send-buffer accounting shared between a channel handle and its pump.
pub(crate) struct BufferState {
    buffered: AtomicU64,
    low_water: Notify,
    threshold: u64,
}

impl BufferState {
    pub(crate) fn new(threshold: u64) -> Arc<Self> {
        Arc::new(Self {
            buffered: AtomicU64::new(0),
            low_water: Notify::new(),
            threshold,
        })
    }

    pub(crate) fn charge(&self, bytes: u64) {
        self.buffered.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Releases bytes once the transport has taken the frame. Fires the
    /// low-water notification when the buffer crosses the threshold.
    pub(crate) fn release(&self, bytes: u64) {
        let mut current = self.buffered.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.buffered.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if next < self.threshold {
                        self.low_water.notify_waiters();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }
}

/// One endpoint of an ordered, bidirectional frame pipe.
///
/// Owned exclusively by one pipeline task; `recv` takes `&mut self`.
pub struct Channel {
    outbound_tx: mpsc::Sender<WireFrame>,
    inbound_rx: mpsc::Receiver<Result<WireFrame, FramingError>>,
    buffer: Arc<BufferState>,
    closed: CancellationToken,
}

impl Channel {
    pub(crate) fn from_parts(
        outbound_tx: mpsc::Sender<WireFrame>,
        inbound_rx: mpsc::Receiver<Result<WireFrame, FramingError>>,
        buffer: Arc<BufferState>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            outbound_tx,
            inbound_rx,
            buffer,
            closed,
        }
    }

    /// Queues a frame for transmission.
    ///
    /// Returns [`ChannelError::QueueFull`] when the outbound queue is at
    /// capacity; the caller should wait for the low-water event and
    /// retry the same frame.
    pub fn send(&self, frame: impl Into<WireFrame>) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let frame = frame.into();
        let bytes = frame.wire_len() as u64;
        // Charge before enqueueing so buffered_amount never under-reports
        // while the pump races us.
        self.buffer.charge(bytes);
        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.buffer.release(bytes);
                Err(ChannelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.buffer.release(bytes);
                Err(ChannelError::Closed)
            }
        }
    }

    /// Bytes queued but not yet taken by the transport.
    pub fn buffered_amount(&self) -> u64 {
        self.buffer.amount()
    }

    /// Resolves once the buffered amount is below the low-water
    /// threshold, or immediately when the channel closes.
    pub async fn wait_low_water(&self) {
        self.flow().wait_low_water().await;
    }

    /// A detached handle onto the flow-control signals.
    ///
    /// Lets a pipeline await the low-water event while it holds the
    /// channel itself mutably for `recv`.
    pub fn flow(&self) -> FlowControl {
        FlowControl {
            buffer: Arc::clone(&self.buffer),
            closed: self.closed.clone(),
        }
    }

    /// Receives the next inbound frame.
    ///
    /// `Some(Err(_))` is a frame that failed to decode (the transfer
    /// layer counts these); `None` means the channel is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Result<WireFrame, FramingError>> {
        self.inbound_rx.recv().await
    }

    /// Non-blocking receive of an already-arrived frame.
    pub fn try_recv(&mut self) -> Option<Result<WireFrame, FramingError>> {
        self.inbound_rx.try_recv().ok()
    }

    /// Closes the channel. Both endpoints and all pumps observe this.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the channel closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Flow-control view of a channel: buffered amount and the low-water
/// event, independent of the frame queues.
#[derive(Clone)]
pub struct FlowControl {
    buffer: Arc<BufferState>,
    closed: CancellationToken,
}

impl FlowControl {
    /// Bytes queued but not yet taken by the transport.
    pub fn buffered_amount(&self) -> u64 {
        self.buffer.amount()
    }

    /// Resolves once the buffered amount is below the low-water
    /// threshold, or immediately when the channel closes.
    pub async fn wait_low_water(&self) {
        loop {
            let notified = self.buffer.low_water.notified();
            if self.buffer.amount() < self.buffer.threshold || self.closed.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.closed.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_constants() {
        let config = ChannelConfig::default();
        assert_eq!(config.low_water_threshold, LOW_WATER_THRESHOLD);
        assert_eq!(config.max_payload, SUB_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn buffer_release_fires_low_water() {
        let buffer = BufferState::new(100);
        buffer.charge(300);

        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                loop {
                    let notified = buffer.low_water.notified();
                    if buffer.amount() < buffer.threshold {
                        return;
                    }
                    notified.await;
                }
            })
        };

        buffer.release(150); // 150 left, still above threshold
        buffer.release(120); // 30 left, below threshold
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("low-water should fire")
            .unwrap();
    }

    #[test]
    fn release_saturates_at_zero() {
        let buffer = BufferState::new(10);
        buffer.charge(5);
        buffer.release(5);
        buffer.release(5);
        assert_eq!(buffer.amount(), 0);
    }
}
