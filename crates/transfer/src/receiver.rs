//! Receive pipeline.
//!
//! A single task owns the record table. Metadata announces a digest;
//! the matching data frame is verified against it and acknowledged.
//! Reception is order-robust: data arriving ahead of its metadata is
//! buffered until the digest shows up. Verified payloads are streamed
//! to the sink as the contiguous flat-index prefix grows, so memory
//! holds only out-of-order sub-chunks rather than the whole file. A
//! periodic gap scan nacks announced-but-unverified indexes after a
//! quiet period.

use std::io;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use beamdrop_channel::{Channel, ChannelError, FlowControl};
use beamdrop_protocol::constants::FRAMING_ERROR_LIMIT;
use beamdrop_protocol::{ControlFrame, DataFrame, FramingError, WireFrame};

use crate::integrity::digest_hex;
use crate::phase::{Role, SessionState};
use crate::plan::ChunkPlan;
use crate::sink::Sink;
use crate::stats::{StatsSnapshot, TransferStats};
use crate::{EventSender, TransferConfig, TransferError, TransferEvent};

#[derive(Debug, Clone, Default)]
struct RecvSlot {
    /// Digest announced by `chunk-metadata`, cleared on mismatch.
    digest: Option<String>,
    /// Payload that arrived ahead of its metadata.
    pending: Option<Vec<u8>>,
    /// Verified payload awaiting its turn in the prefix stream.
    payload: Option<Vec<u8>>,
    verified: bool,
    retries: u32,
}

struct ActiveTransfer {
    name: String,
    plan: ChunkPlan,
    slots: Vec<RecvSlot>,
    verified_count: u32,
    /// Next flat index to stream to the sink.
    next_write: u32,
    /// Bytes handed to the sink so far.
    written: u64,
    stats: TransferStats,
    /// Our side is complete: sink closed, `transfer-complete` sent.
    done: bool,
    /// The sender announced its own `transfer-complete`.
    sender_done: bool,
    /// Verified count at the last gap-scan tick.
    last_progress_mark: u32,
}

enum DataAction {
    Ignore,
    ReAck,
    Buffered,
    Verify { expected: String, payload: Vec<u8> },
}

/// The receiving side of one transfer session.
pub struct Receiver<K: Sink> {
    config: TransferConfig,
    channel: Channel,
    flow: FlowControl,
    sink: Option<K>,
    active: Option<ActiveTransfer>,
    state: SessionState,
    events: EventSender,
    cancel: CancellationToken,
    framing_errors: u32,
}

impl<K: Sink> Receiver<K> {
    /// Creates a receiver over an open channel.
    pub fn new(
        channel: Channel,
        sink: K,
        config: TransferConfig,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self, TransferError> {
        let mut state = SessionState::new(Role::Receiver);
        state.channel_open()?;
        let flow = channel.flow();
        Ok(Self {
            config,
            channel,
            flow,
            sink: Some(sink),
            active: None,
            state,
            events,
            cancel,
            framing_errors: 0,
        })
    }

    /// Runs until the transfer completes on both sides.
    ///
    /// Returns the sink so callers can take the assembled output back.
    pub async fn run(mut self) -> Result<(K, StatsSnapshot), TransferError> {
        match self.drive().await {
            Ok(snapshot) => {
                let _ = self
                    .events
                    .send(TransferEvent::Completed(snapshot.clone()))
                    .await;
                let sink = self
                    .sink
                    .take()
                    .ok_or_else(|| TransferError::Protocol("sink lost".into()))?;
                Ok((sink, snapshot))
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

    fn finished(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.done && a.sender_done)
    }

    async fn drive(&mut self) -> Result<StatsSnapshot, TransferError> {
        let mut gap_timer = tokio::time::interval(self.config.gap_scan_grace);
        gap_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        gap_timer.tick().await; // Consume the immediate first tick.

        loop {
            if self.finished() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),

                _ = gap_timer.tick() => self.gap_scan().await?,

                item = self.channel.recv() => match item {
                    None => {
                        // A close after our completion is a clean end:
                        // the data is already safe in the sink.
                        if self.active.as_ref().is_some_and(|a| a.done) {
                            break;
                        }
                        return Err(TransferError::ChannelClosed);
                    }
                    Some(Ok(frame)) => {
                        self.framing_errors = 0;
                        self.on_frame(frame).await?;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "dropping malformed frame");
                        self.framing_errors += 1;
                        if self.framing_errors >= FRAMING_ERROR_LIMIT {
                            return Err(TransferError::FramingLimit);
                        }
                    }
                }
            }
        }

        self.state.complete()?;
        match self.active.as_ref() {
            Some(active) => Ok(active.stats.snapshot()),
            None => Err(TransferError::ChannelClosed),
        }
    }

    async fn on_frame(&mut self, frame: WireFrame) -> Result<(), TransferError> {
        match frame {
            WireFrame::Control(ControlFrame::FileStart {
                name,
                size,
                main_count,
                sub_count,
            }) => self.on_file_start(name, size, main_count, sub_count).await,

            WireFrame::Control(ControlFrame::ChunkMetadata {
                flat_index, digest, ..
            }) => self.on_metadata(flat_index, digest).await,

            WireFrame::Data(frame) => self.on_data(frame).await,

            WireFrame::Control(ControlFrame::TransferComplete) => {
                let premature = match self.active.as_mut() {
                    Some(active) => {
                        active.sender_done = true;
                        !active.done
                    }
                    None => false,
                };
                if premature {
                    // The sender holds transfer-complete until all acks,
                    // so a gap here means lost frames: nack immediately.
                    warn!("sender finished while sub-chunks are missing");
                    self.nack_missing().await?;
                }
                Ok(())
            }

            WireFrame::Control(ControlFrame::Error { message }) => {
                Err(TransferError::Peer(message))
            }

            WireFrame::Control(
                ControlFrame::ChunkAck { .. }
                | ControlFrame::ChunkNack { .. }
                | ControlFrame::RetryRequest { .. },
            ) => {
                warn!("ignoring sender-bound frame on the receiving side");
                Ok(())
            }
        }
    }

    async fn on_file_start(
        &mut self,
        name: String,
        size: u64,
        main_count: u32,
        sub_count: u32,
    ) -> Result<(), TransferError> {
        if self.active.is_some() {
            return Err(TransferError::Protocol(
                "second file-start within one session".into(),
            ));
        }

        if let Err(e) =
            ChunkPlan::verify_announced(size, main_count, sub_count, self.config.params)
        {
            warn!(error = %e, "rejecting session");
            return Err(e.into());
        }
        let plan = ChunkPlan::build(size, self.config.params)?;

        {
            let name = name.clone();
            self.with_sink(move |sink| sink.open(&name, size)).await?;
        }
        self.state.begin_transfer()?;

        let stats = TransferStats::new(&plan);
        let slot_count = plan.sub_count() as usize;
        info!(name = %name, size, subs = sub_count, "incoming transfer");
        let _ = self
            .events
            .send(TransferEvent::Started {
                name: name.clone(),
                size,
            })
            .await;

        self.active = Some(ActiveTransfer {
            name,
            plan,
            slots: vec![RecvSlot::default(); slot_count],
            verified_count: 0,
            next_write: 0,
            written: 0,
            stats,
            done: false,
            sender_done: false,
            last_progress_mark: 0,
        });

        if sub_count == 0 {
            self.complete_transfer().await?;
        }
        Ok(())
    }

    async fn on_metadata(
        &mut self,
        flat_index: u32,
        digest: String,
    ) -> Result<(), TransferError> {
        let pending = {
            let Some(active) = self.active.as_mut() else {
                warn!("chunk-metadata before file-start");
                return Ok(());
            };
            if flat_index >= active.plan.sub_count() {
                warn!(flat_index, "metadata out of range");
                return Ok(());
            }
            let slot = &mut active.slots[flat_index as usize];
            if slot.verified {
                return Ok(());
            }
            slot.digest = Some(digest.clone());
            slot.pending.take()
        };

        // Order-robust path: the data frame arrived first.
        if let Some(payload) = pending {
            self.verify_and_store(flat_index, digest, payload).await?;
        }
        Ok(())
    }

    async fn on_data(&mut self, frame: DataFrame) -> Result<(), TransferError> {
        let DataFrame {
            flat_index,
            payload,
        } = frame;

        let action = {
            let Some(active) = self.active.as_mut() else {
                warn!("data frame before file-start");
                return Ok(());
            };
            if flat_index >= active.plan.sub_count() {
                warn!(flat_index, "data frame out of range");
                DataAction::Ignore
            } else {
                let slot = &mut active.slots[flat_index as usize];
                if slot.verified {
                    // Duplicate delivery; re-ack so the sender converges.
                    DataAction::ReAck
                } else {
                    match slot.digest.clone() {
                        Some(expected) => DataAction::Verify { expected, payload },
                        None => {
                            trace!(flat_index, "buffering data ahead of metadata");
                            slot.pending = Some(payload);
                            DataAction::Buffered
                        }
                    }
                }
            }
        };

        match action {
            DataAction::Ignore | DataAction::Buffered => Ok(()),
            DataAction::ReAck => {
                self.send_frame(ControlFrame::ChunkAck {
                    flat_index,
                    ok: true,
                })
                .await
            }
            DataAction::Verify { expected, payload } => {
                self.verify_and_store(flat_index, expected, payload).await
            }
        }
    }

    async fn verify_and_store(
        &mut self,
        flat_index: u32,
        expected: String,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        let actual = digest_hex(&payload);

        if actual != expected {
            let retries = {
                let Some(active) = self.active.as_mut() else {
                    return Ok(());
                };
                let slot = &mut active.slots[flat_index as usize];
                slot.digest = None;
                slot.retries += 1;
                slot.retries
            };
            if retries > self.config.max_retries {
                return Err(TransferError::DigestExhausted { flat_index });
            }
            warn!(flat_index, retries, "digest mismatch, requesting retry");
            return self
                .send_frame(ControlFrame::RetryRequest { flat_index })
                .await;
        }

        let complete = {
            let Some(active) = self.active.as_mut() else {
                return Ok(());
            };
            let bytes = payload.len() as u64;
            let slot = &mut active.slots[flat_index as usize];
            slot.payload = Some(payload);
            slot.verified = true;
            active.verified_count += 1;
            if let Some(sub) = active.plan.sub(flat_index) {
                let main_index = sub.main_index;
                active.stats.record_sub(main_index, bytes);
            }
            active.verified_count == active.plan.sub_count()
        };

        self.send_frame(ControlFrame::ChunkAck {
            flat_index,
            ok: true,
        })
        .await?;
        self.flush_prefix().await?;

        if let Some(active) = self.active.as_ref() {
            let _ = self
                .events
                .try_send(TransferEvent::Progress(active.stats.snapshot()));
        }

        if complete {
            self.complete_transfer().await?;
        }
        Ok(())
    }

    /// Streams the verified contiguous prefix to the sink, releasing
    /// payload memory as it goes.
    async fn flush_prefix(&mut self) -> Result<(), TransferError> {
        let writes: Vec<(u64, Vec<u8>)> = {
            let Some(active) = self.active.as_mut() else {
                return Ok(());
            };
            let mut writes = Vec::new();
            while (active.next_write as usize) < active.slots.len() {
                let index = active.next_write;
                let Some(offset) = active.plan.sub(index).map(|s| s.start) else {
                    break;
                };
                let slot = &mut active.slots[index as usize];
                let Some(payload) = slot.payload.take() else {
                    break;
                };
                active.written += payload.len() as u64;
                active.next_write += 1;
                writes.push((offset, payload));
            }
            writes
        };

        if writes.is_empty() {
            return Ok(());
        }
        self.with_sink(move |sink| {
            for (offset, data) in &writes {
                sink.write(*offset, data)?;
            }
            Ok(())
        })
        .await
    }

    /// Closes out the transfer: final length check, sink close, and the
    /// (idempotent) `transfer-complete` acknowledgement.
    async fn complete_transfer(&mut self) -> Result<(), TransferError> {
        let (expected, written, name, already_done) = match self.active.as_ref() {
            Some(a) => (a.plan.size(), a.written, a.name.clone(), a.done),
            None => return Ok(()),
        };
        if already_done {
            return Ok(());
        }

        self.with_sink(|sink| sink.close()).await?;
        if written != expected {
            return Err(TransferError::AssemblyLengthMismatch {
                expected,
                got: written,
            });
        }

        self.send_frame(ControlFrame::TransferComplete).await?;
        if let Some(active) = self.active.as_mut() {
            active.done = true;
        }
        info!(name = %name, bytes = written, "transfer assembled and verified");
        Ok(())
    }

    /// Periodic gap detection: nack announced-but-unverified indexes
    /// when a full grace period passes without progress.
    async fn gap_scan(&mut self) -> Result<(), TransferError> {
        let stalled = match self.active.as_mut() {
            None => return Ok(()),
            Some(active) => {
                if active.done {
                    return Ok(());
                }
                let stalled = active.verified_count == active.last_progress_mark;
                active.last_progress_mark = active.verified_count;
                stalled
            }
        };
        if stalled {
            self.nack_missing().await?;
        }
        Ok(())
    }

    async fn nack_missing(&mut self) -> Result<(), TransferError> {
        let missing: Vec<u32> = match self.active.as_ref() {
            None => return Ok(()),
            Some(active) => active
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.digest.is_some() && !slot.verified)
                .map(|(i, _)| i as u32)
                .take(self.config.nack_batch_limit)
                .collect(),
        };
        if missing.is_empty() {
            return Ok(());
        }
        debug!(count = missing.len(), "nacking missing sub-chunks");
        self.send_frame(ControlFrame::ChunkNack {
            flat_indexes: missing,
        })
        .await
    }

    /// Sends one control frame, absorbing transient queue-full
    /// rejections.
    async fn send_frame(&mut self, frame: impl Into<WireFrame>) -> Result<(), TransferError> {
        let frame = frame.into();
        loop {
            match self.channel.send(frame.clone()) {
                Ok(()) => return Ok(()),
                Err(ChannelError::QueueFull) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = self.flow.wait_low_water() => {}
                    }
                }
                Err(_) => return Err(TransferError::ChannelClosed),
            }
        }
    }

    /// Runs one blocking sink operation on the blocking pool, handing
    /// the sink out and back.
    async fn with_sink<F>(&mut self, op: F) -> Result<(), TransferError>
    where
        F: FnOnce(&mut K) -> io::Result<()> + Send + 'static,
    {
        let Some(mut sink) = self.sink.take() else {
            return Err(TransferError::Protocol("sink already closed".into()));
        };
        let (sink, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut sink);
            (sink, result)
        })
        .await
        .map_err(|e| TransferError::SinkWrite(io::Error::other(e)))?;
        self.sink = Some(sink);
        result.map_err(TransferError::SinkWrite)
    }
}
