//! Send pipeline.
//!
//! A single task owns all send state and walks the chunk plan in
//! flat-index order: read a sub-chunk from the source on the blocking
//! pool, digest it, pass the backpressure gate, and emit the
//! `chunk-metadata`/data pair. Admission control caps unacknowledged
//! sub-chunks in flight; acks, nacks, and retry requests are handled on
//! the same task between sends. `transfer-complete` is held until every
//! sub-chunk is acked.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use beamdrop_channel::{Channel, ChannelError, FlowControl};
use beamdrop_protocol::constants::{
    FRAMING_ERROR_LIMIT, READY_WAIT, SEND_DELAY_MAX, SEND_DELAY_MIN,
};
use beamdrop_protocol::{ControlFrame, DataFrame, FramingError, WireFrame};

use crate::integrity::digest_hex;
use crate::phase::{Role, SessionState};
use crate::plan::ChunkPlan;
use crate::source::Source;
use crate::stats::{StatsSnapshot, TransferStats};
use crate::{EventSender, TransferConfig, TransferError, TransferEvent};

/// Callback recreating the channel after an unexpected close.
///
/// The sender invokes it at most once per session, bounded by the
/// ready-wait timeout. Boxed-future form keeps the engine decoupled
/// from how the caller re-establishes transport.
pub type Reconnect =
    Box<dyn FnMut() -> Pin<Box<dyn Future<Output = Result<Channel, ChannelError>> + Send>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Pending,
    Inflight,
    Acked,
    Failed,
}

struct SendRecord {
    state: SendState,
    retries: u32,
}

enum Wake {
    LowWater,
    Inbound(Option<Result<WireFrame, FramingError>>),
}

/// The sending side of one transfer session.
pub struct Sender<S: Source> {
    config: TransferConfig,
    channel: Channel,
    flow: FlowControl,
    source: Arc<S>,
    plan: ChunkPlan,
    records: Vec<SendRecord>,
    queue: VecDeque<u32>,
    inflight: usize,
    receiver_done: bool,
    stats: TransferStats,
    state: SessionState,
    events: EventSender,
    cancel: CancellationToken,
    pacer: Pacer,
    reconnect: Option<Reconnect>,
    reconnect_used: bool,
    framing_errors: u32,
}

impl<S: Source> Sender<S> {
    /// Creates a sender over an open channel.
    pub fn new(
        channel: Channel,
        source: S,
        config: TransferConfig,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self, TransferError> {
        let plan = ChunkPlan::build(source.size(), config.params)?;
        let records = (0..plan.sub_count())
            .map(|_| SendRecord {
                state: SendState::Pending,
                retries: 0,
            })
            .collect();
        let queue = (0..plan.sub_count()).collect();
        let stats = TransferStats::new(&plan);

        let mut state = SessionState::new(Role::Sender);
        state.channel_open()?;

        let flow = channel.flow();
        Ok(Self {
            config,
            channel,
            flow,
            source: Arc::new(source),
            plan,
            records,
            queue,
            inflight: 0,
            receiver_done: false,
            stats,
            state,
            events,
            cancel,
            pacer: Pacer::new(),
            reconnect: None,
            reconnect_used: false,
            framing_errors: 0,
        })
    }

    /// Installs the one-shot channel recreation callback.
    pub fn with_reconnect(mut self, reconnect: Reconnect) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs the transfer to completion.
    pub async fn run(mut self) -> Result<StatsSnapshot, TransferError> {
        match self.drive().await {
            Ok(snapshot) => {
                let _ = self
                    .events
                    .send(TransferEvent::Completed(snapshot.clone()))
                    .await;
                Ok(snapshot)
            }
            Err(err) => {
                self.state.interrupt();
                if !matches!(
                    err,
                    TransferError::ChannelClosed | TransferError::Cancelled
                ) {
                    // Best-effort: tell the peer why the session died.
                    // Dropping the channel afterwards flushes the queue
                    // and ends the session.
                    let _ = self.channel.send(ControlFrame::Error {
                        message: err.to_string(),
                    });
                }
                let _ = self
                    .events
                    .send(TransferEvent::Interrupted {
                        error: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<StatsSnapshot, TransferError> {
        let name = self.source.name().to_string();
        let size = self.source.size();

        self.send_frame(ControlFrame::FileStart {
            name: name.clone(),
            size,
            main_count: self.plan.main_count(),
            sub_count: self.plan.sub_count(),
        })
        .await?;
        self.state.begin_transfer()?;
        info!(size, subs = self.plan.sub_count(), "transfer started");
        let _ = self.events.send(TransferEvent::Started { name, size }).await;

        loop {
            self.drain_inbound()?;
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if self.stats.all_subs_completed() {
                break;
            }

            // Admission gate: only send with a free in-flight slot.
            if self.inflight < self.config.max_concurrent_sends {
                if let Some(flat_index) = self.next_pending() {
                    self.send_sub(flat_index).await?;
                    continue;
                }
            }

            // Blocked on acks (or on retransmission requests).
            self.wait_inbound().await?;
        }

        // Held until every sub-chunk is acked.
        self.send_frame(ControlFrame::TransferComplete).await?;
        debug!("all sub-chunks acked, transfer-complete sent");

        while !self.receiver_done {
            self.wait_inbound().await?;
        }
        self.state.complete()?;
        Ok(self.stats.snapshot())
    }

    fn next_pending(&mut self) -> Option<u32> {
        while let Some(flat_index) = self.queue.pop_front() {
            if self.records[flat_index as usize].state == SendState::Pending {
                return Some(flat_index);
            }
        }
        None
    }

    /// Reads, digests, and emits one sub-chunk.
    async fn send_sub(&mut self, flat_index: u32) -> Result<(), TransferError> {
        let Some(sub) = self.plan.sub(flat_index) else {
            return Ok(());
        };
        let (start, len, main_index, sub_index) =
            (sub.start, sub.size() as usize, sub.main_index, sub.sub_index);

        let source = Arc::clone(&self.source);
        let payload = tokio::task::spawn_blocking(move || source.read_range(start, len))
            .await
            .map_err(|e| TransferError::SourceRead(io::Error::other(e)))?
            .map_err(TransferError::SourceRead)?;

        let digest = digest_hex(&payload);

        self.backpressure_gate().await?;

        // The pair goes out back-to-back; nothing else writes to the
        // channel between them, so ordered delivery carries the
        // metadata-precedes-data adjacency to the receiver.
        self.send_frame(ControlFrame::ChunkMetadata {
            flat_index,
            main_index,
            sub_index,
            digest,
        })
        .await?;
        self.send_frame(DataFrame {
            flat_index,
            payload,
        })
        .await?;

        self.records[flat_index as usize].state = SendState::Inflight;
        self.inflight += 1;
        trace!(flat_index, "sub-chunk in flight");

        let delay = self.pacer.current();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Waits until the buffered amount is under the high-water mark.
    /// Acks keep flowing while gated; channel close unblocks the wait.
    async fn backpressure_gate(&mut self) -> Result<(), TransferError> {
        loop {
            let buffered = self.flow.buffered_amount();
            self.pacer.observe(buffered, self.config.high_water_mark);
            if buffered < self.config.high_water_mark {
                return Ok(());
            }

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = self.flow.wait_low_water() => Wake::LowWater,
                item = self.channel.recv() => Wake::Inbound(item),
            };
            match wake {
                Wake::LowWater => {}
                Wake::Inbound(item) => self.handle_inbound(item).await?,
            }
        }
    }

    /// Sends one frame, absorbing transient queue-full rejections and
    /// retrying the same frame after the buffer drains.
    async fn send_frame(&mut self, frame: impl Into<WireFrame>) -> Result<(), TransferError> {
        let frame = frame.into();
        loop {
            match self.channel.send(frame.clone()) {
                Ok(()) => return Ok(()),
                Err(ChannelError::QueueFull) => {
                    trace!("send queue full, waiting for drain");
                    let wake = tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = self.flow.wait_low_water() => Wake::LowWater,
                        item = self.channel.recv() => Wake::Inbound(item),
                    };
                    if let Wake::Inbound(item) = wake {
                        self.handle_inbound(item).await?;
                    }
                }
                Err(_) => self.handle_channel_closed().await?,
            }
        }
    }

    fn drain_inbound(&mut self) -> Result<(), TransferError> {
        while let Some(item) = self.channel.try_recv() {
            self.handle_item(item)?;
        }
        Ok(())
    }

    async fn wait_inbound(&mut self) -> Result<(), TransferError> {
        let item = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            item = self.channel.recv() => item,
        };
        self.handle_inbound(item).await
    }

    async fn handle_inbound(
        &mut self,
        item: Option<Result<WireFrame, FramingError>>,
    ) -> Result<(), TransferError> {
        match item {
            None => self.handle_channel_closed().await,
            Some(item) => self.handle_item(item),
        }
    }

    fn handle_item(&mut self, item: Result<WireFrame, FramingError>) -> Result<(), TransferError> {
        match item {
            Ok(frame) => {
                self.framing_errors = 0;
                self.on_frame(frame)
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                self.framing_errors += 1;
                if self.framing_errors >= FRAMING_ERROR_LIMIT {
                    Err(TransferError::FramingLimit)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn on_frame(&mut self, frame: WireFrame) -> Result<(), TransferError> {
        match frame {
            WireFrame::Control(ControlFrame::ChunkAck {
                flat_index,
                ok: true,
            }) => {
                self.on_ack(flat_index);
                Ok(())
            }
            WireFrame::Control(ControlFrame::ChunkAck {
                flat_index,
                ok: false,
            }) => self.requeue(flat_index),
            WireFrame::Control(ControlFrame::ChunkNack { flat_indexes }) => {
                for flat_index in flat_indexes {
                    self.requeue(flat_index)?;
                }
                Ok(())
            }
            WireFrame::Control(ControlFrame::RetryRequest { flat_index }) => {
                self.requeue(flat_index)
            }
            WireFrame::Control(ControlFrame::TransferComplete) => {
                self.receiver_done = true;
                Ok(())
            }
            WireFrame::Control(ControlFrame::Error { message }) => {
                Err(TransferError::Peer(message))
            }
            _ => {
                warn!("ignoring unexpected frame on the sending side");
                Ok(())
            }
        }
    }

    /// Acks are idempotent: only an in-flight sub-chunk transitions.
    fn on_ack(&mut self, flat_index: u32) {
        let Some(record) = self.records.get_mut(flat_index as usize) else {
            warn!(flat_index, "ack for unknown sub-chunk");
            return;
        };
        if record.state != SendState::Inflight {
            return;
        }
        record.state = SendState::Acked;
        self.inflight -= 1;

        if let Some(sub) = self.plan.sub(flat_index) {
            let (main_index, bytes) = (sub.main_index, sub.size());
            self.stats.record_sub(main_index, bytes);
        }
        trace!(flat_index, "sub-chunk acked");
        // Lossy: a slow event consumer must not stall the pipeline.
        let _ = self
            .events
            .try_send(TransferEvent::Progress(self.stats.snapshot()));
    }

    /// Marks a sub-chunk for retransmission at the head of the send
    /// order, bounded by the retry budget.
    fn requeue(&mut self, flat_index: u32) -> Result<(), TransferError> {
        let Some(record) = self.records.get_mut(flat_index as usize) else {
            warn!(flat_index, "retransmission request for unknown sub-chunk");
            return Ok(());
        };
        let state = record.state;
        match state {
            // Already confirmed or already queued for resend.
            SendState::Acked | SendState::Pending => Ok(()),
            SendState::Inflight | SendState::Failed => {
                record.retries += 1;
                let retries = record.retries;
                if retries > self.config.max_retries {
                    record.state = SendState::Failed;
                    self.stats.record_failed();
                    return Err(TransferError::RetriesExhausted { flat_index });
                }
                record.state = SendState::Pending;
                if state == SendState::Inflight {
                    self.inflight -= 1;
                }
                self.queue.push_front(flat_index);
                debug!(flat_index, retries, "re-queued sub-chunk");
                Ok(())
            }
        }
    }

    /// One-shot channel recreation. In-flight sub-chunks are presumed
    /// lost and re-queued.
    async fn handle_channel_closed(&mut self) -> Result<(), TransferError> {
        if self.reconnect_used {
            return Err(TransferError::ChannelClosed);
        }
        let Some(reconnect) = self.reconnect.as_mut() else {
            return Err(TransferError::ChannelClosed);
        };
        self.reconnect_used = true;
        warn!("channel closed mid-transfer, attempting recreation");

        let channel = tokio::time::timeout(READY_WAIT, reconnect())
            .await
            .map_err(|_| TransferError::ChannelClosed)?
            .map_err(|_| TransferError::ChannelClosed)?;
        self.flow = channel.flow();
        self.channel = channel;

        for (flat_index, record) in self.records.iter_mut().enumerate() {
            if record.state == SendState::Inflight {
                record.state = SendState::Pending;
                self.queue.push_front(flat_index as u32);
            }
        }
        self.inflight = 0;
        info!("channel re-established, resuming transfer");
        Ok(())
    }
}

/// Adaptive inter-send delay.
///
/// Inactive (zero delay) until the buffer runs well past the high-water
/// mark; backs off again once the buffer drains. Bounded to
/// [`SEND_DELAY_MIN`], [`SEND_DELAY_MAX`] while active.
struct Pacer {
    delay: Duration,
}

impl Pacer {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    fn observe(&mut self, buffered: u64, high_water: u64) {
        if buffered > 2 * high_water {
            self.delay = if self.delay.is_zero() {
                SEND_DELAY_MIN
            } else {
                (self.delay * 2).min(SEND_DELAY_MAX)
            };
        } else if buffered < high_water / 4 && !self.delay.is_zero() {
            let halved = self.delay / 2;
            self.delay = if halved < SEND_DELAY_MIN {
                Duration::ZERO
            } else {
                halved
            };
        }
    }

    fn current(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: u64 = 1024;

    #[test]
    fn pacer_starts_inactive() {
        let pacer = Pacer::new();
        assert!(pacer.current().is_zero());
    }

    #[test]
    fn pacer_engages_past_double_high_water() {
        let mut pacer = Pacer::new();
        pacer.observe(2 * HW + 1, HW);
        assert_eq!(pacer.current(), SEND_DELAY_MIN);
    }

    #[test]
    fn pacer_caps_at_max_delay() {
        let mut pacer = Pacer::new();
        for _ in 0..20 {
            pacer.observe(3 * HW, HW);
        }
        assert_eq!(pacer.current(), SEND_DELAY_MAX);
    }

    #[test]
    fn pacer_backs_off_below_quarter_water() {
        let mut pacer = Pacer::new();
        pacer.observe(3 * HW, HW);
        pacer.observe(3 * HW, HW);
        let engaged = pacer.current();
        assert!(engaged > SEND_DELAY_MIN);

        pacer.observe(HW / 4 - 1, HW);
        assert!(pacer.current() < engaged);

        // Draining fully deactivates the pacer.
        for _ in 0..10 {
            pacer.observe(0, HW);
        }
        assert!(pacer.current().is_zero());
    }

    #[test]
    fn pacer_holds_between_thresholds() {
        let mut pacer = Pacer::new();
        pacer.observe(3 * HW, HW);
        let engaged = pacer.current();
        pacer.observe(HW, HW);
        assert_eq!(pacer.current(), engaged);
    }
}
