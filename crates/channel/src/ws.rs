//! WebSocket channel adapter.
//!
//! Control frames ride as text messages, data frames as tagged binary.
//! Each endpoint runs three pump tasks in the usual shape: a write pump
//! draining the outbound queue into the socket, a read pump decoding
//! inbound messages, and a ping pump for keepalive. The write pump
//! releases buffered bytes only after the sink accepts a frame, so
//! `buffered_amount` tracks what the socket has not yet taken.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::WebSocketConfig};
use tokio_tungstenite::{WebSocketStream, accept_async_with_config, connect_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use beamdrop_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD};
use beamdrop_protocol::{DataFrame, FramingError, WireFrame, decode_control, encode_control};

use crate::channel::{BufferState, Channel, ChannelConfig};
use crate::error::ChannelError;

/// Connects to a peer's WebSocket endpoint and returns the channel.
pub async fn connect(url: &str, config: ChannelConfig) -> Result<Channel, ChannelError> {
    let (stream, _) = connect_async_with_config(url, Some(ws_config()), false).await?;
    Ok(spawn_channel(stream, config))
}

/// Accepts an inbound TCP connection as a WebSocket channel.
pub async fn accept(stream: TcpStream, config: ChannelConfig) -> Result<Channel, ChannelError> {
    let ws = accept_async_with_config(stream, Some(ws_config())).await?;
    Ok(spawn_channel(ws, config))
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

fn spawn_channel<S>(stream: WebSocketStream<S>, config: ChannelConfig) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = stream.split();
    let closed = CancellationToken::new();
    let buffer = BufferState::new(config.low_water_threshold);

    let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_frames);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.recv_queue_frames);
    // Raw path for pongs and pings so they bypass frame accounting.
    let (raw_tx, raw_rx) = mpsc::channel(16);

    tokio::spawn(write_pump(
        write,
        outbound_rx,
        raw_rx,
        Arc::clone(&buffer),
        closed.clone(),
    ));
    tokio::spawn(read_pump(
        read,
        inbound_tx,
        raw_tx.clone(),
        config.max_payload,
        closed.clone(),
    ));
    tokio::spawn(ping_pump(raw_tx, closed.clone()));

    Channel::from_parts(outbound_tx, inbound_rx, buffer, closed)
}

async fn write_pump<S>(
    mut write: S,
    mut outbound_rx: mpsc::Receiver<WireFrame>,
    mut raw_rx: mpsc::Receiver<tungstenite::Message>,
    buffer: Arc<BufferState>,
    closed: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            raw = raw_rx.recv() => {
                match raw {
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            warn!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let bytes = frame.wire_len() as u64;
                let msg = match frame {
                    WireFrame::Control(c) => {
                        tungstenite::Message::Text(encode_control(&c).into())
                    }
                    WireFrame::Data(d) => tungstenite::Message::Binary(d.encode().into()),
                };
                let result = write.send(msg).await;
                // The socket has taken the frame (or the channel is dying
                // either way); stop counting it against the sender.
                buffer.release(bytes);
                if let Err(e) = result {
                    warn!("WebSocket write error: {e}");
                    break;
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
    closed.cancel();
}

async fn read_pump<S>(
    mut read: S,
    inbound_tx: mpsc::Sender<Result<WireFrame, FramingError>>,
    raw_tx: mpsc::Sender<tungstenite::Message>,
    max_payload: u64,
    closed: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(tungstenite::Message::Text(text))) => {
                let item = decode_control(&text).map(WireFrame::Control);
                if inbound_tx.send(item).await.is_err() {
                    break;
                }
            }
            Some(Ok(tungstenite::Message::Binary(bytes))) => {
                let item = DataFrame::decode(&bytes, max_payload).map(WireFrame::Data);
                if inbound_tx.send(item).await.is_err() {
                    break;
                }
            }
            Some(Ok(tungstenite::Message::Ping(data))) => {
                trace!("received ping, sending pong");
                let _ = raw_tx.send(tungstenite::Message::Pong(data)).await;
            }
            Some(Ok(tungstenite::Message::Pong(_))) => {
                trace!("received pong");
            }
            Some(Ok(tungstenite::Message::Close(_))) => {
                debug!("received close frame");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket read error: {e}");
                break;
            }
            None => {
                debug!("WebSocket stream ended");
                break;
            }
        }
    }

    closed.cancel();
}

async fn ping_pump(raw_tx: mpsc::Sender<tungstenite::Message>, closed: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip the immediate first tick.

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if raw_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
