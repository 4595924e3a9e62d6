//! In-process channel pair.
//!
//! Two [`Channel`] endpoints joined by delivery pumps. Frames queued on
//! one side are delivered to the other in order; bytes stay counted in
//! the sender's `buffered_amount` until delivery, so backpressure
//! behaves like a real transport. Test hooks: a delivery gate that
//! holds frames in the buffer, and a tap that can rewrite frames in
//! transit (fault injection).

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use beamdrop_protocol::{FramingError, WireFrame};

use crate::channel::{BufferState, Channel, ChannelConfig};

/// Rewrites a frame in transit. Used to inject faults in tests.
pub type FrameTap = Box<dyn FnMut(WireFrame) -> WireFrame + Send>;

/// Pauses and resumes delivery on one direction of a memory pair.
///
/// While paused, sent frames stay in the sending channel's buffer, so
/// `buffered_amount` grows and the sender's backpressure gate engages.
pub struct DeliveryGate {
    tx: watch::Sender<bool>,
}

impl DeliveryGate {
    pub fn pause(&self) {
        let _ = self.tx.send(false);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(true);
    }
}

/// Creates a connected channel pair.
pub fn pair(config: ChannelConfig) -> (Channel, Channel) {
    let (a, b, _) = build(config, None, false);
    (a, b)
}

/// Creates a pair with a tap on the a-to-b direction.
pub fn pair_with_tap(config: ChannelConfig, tap: FrameTap) -> (Channel, Channel) {
    let (a, b, _) = build(config, Some(tap), false);
    (a, b)
}

/// Creates a pair with a delivery gate on the a-to-b direction.
pub fn pair_with_gate(config: ChannelConfig) -> (Channel, Channel, DeliveryGate) {
    let (a, b, gate) = build(config, None, true);
    (a, b, gate.expect("gate requested"))
}

fn build(
    config: ChannelConfig,
    tap: Option<FrameTap>,
    gated: bool,
) -> (Channel, Channel, Option<DeliveryGate>) {
    let closed = CancellationToken::new();

    let (a_out_tx, a_out_rx) = mpsc::channel(config.send_queue_frames);
    let (b_out_tx, b_out_rx) = mpsc::channel(config.send_queue_frames);
    let (a_in_tx, a_in_rx) = mpsc::channel(config.recv_queue_frames);
    let (b_in_tx, b_in_rx) = mpsc::channel(config.recv_queue_frames);

    let a_buffer = BufferState::new(config.low_water_threshold);
    let b_buffer = BufferState::new(config.low_water_threshold);

    let (gate, gate_rx) = if gated {
        let (tx, rx) = watch::channel(true);
        (Some(DeliveryGate { tx }), Some(rx))
    } else {
        (None, None)
    };

    // a -> b carries the optional tap and gate.
    tokio::spawn(delivery_pump(
        a_out_rx,
        b_in_tx,
        Arc::clone(&a_buffer),
        tap,
        gate_rx,
        closed.clone(),
    ));
    tokio::spawn(delivery_pump(
        b_out_rx,
        a_in_tx,
        Arc::clone(&b_buffer),
        None,
        None,
        closed.clone(),
    ));

    let a = Channel::from_parts(a_out_tx, a_in_rx, a_buffer, closed.clone());
    let b = Channel::from_parts(b_out_tx, b_in_rx, b_buffer, closed);
    (a, b, gate)
}

async fn delivery_pump(
    mut out_rx: mpsc::Receiver<WireFrame>,
    peer_tx: mpsc::Sender<Result<WireFrame, FramingError>>,
    buffer: Arc<BufferState>,
    mut tap: Option<FrameTap>,
    mut gate: Option<watch::Receiver<bool>>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Hold delivery while the gate is paused; the frame's bytes stay
        // charged to the sender's buffer.
        if let Some(gate) = gate.as_mut() {
            while !*gate.borrow() {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let bytes = frame.wire_len() as u64;
        let frame = match tap.as_mut() {
            Some(tap) => tap(frame),
            None => frame,
        };
        if peer_tx.send(Ok(frame)).await.is_err() {
            break;
        }
        buffer.release(bytes);
    }
}
