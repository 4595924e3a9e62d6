//! Full sender/receiver pipeline tests over in-memory and WebSocket
//! channels: happy paths, boundary sizes, fault injection, loss
//! recovery, and backpressure behavior.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamdrop_channel::{Channel, ChannelConfig, memory};
use beamdrop_protocol::constants::SUB_CHUNK_SIZE;
use beamdrop_protocol::{ControlFrame, DataFrame, WireFrame};
use beamdrop_transfer::{
    ChunkParams, MemorySink, MemorySource, Receiver, Sender, StatsSnapshot, TransferConfig,
    TransferError, TransferEvent,
};

fn small_config() -> TransferConfig {
    TransferConfig {
        params: ChunkParams {
            main_size: 4096,
            sub_size: 1024,
        },
        high_water_mark: 64 * 1024,
        gap_scan_grace: Duration::from_millis(200),
        ..TransferConfig::default()
    }
}

fn channel_config() -> ChannelConfig {
    ChannelConfig {
        low_water_threshold: 2048,
        ..ChannelConfig::default()
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct TransferOutcome {
    assembled: Vec<u8>,
    send_stats: StatsSnapshot,
    recv_stats: StatsSnapshot,
    recv_events: Vec<TransferEvent>,
}

async fn run_pair(data: Vec<u8>, config: TransferConfig, a: Channel, b: Channel) -> TransferOutcome {
    let cancel = CancellationToken::new();
    let (send_events, _keep) = mpsc::channel(64);
    let (recv_events_tx, mut recv_events_rx) = mpsc::channel(1024);

    let sender = Sender::new(
        a,
        MemorySource::new("payload.bin", data),
        config.clone(),
        send_events,
        cancel.clone(),
    )
    .unwrap();
    let receiver = Receiver::new(b, MemorySink::new(), config, recv_events_tx, cancel).unwrap();

    let recv_task = tokio::spawn(receiver.run());
    let send_stats = sender.run().await.unwrap();
    let (sink, recv_stats) = recv_task.await.unwrap().unwrap();

    let mut recv_events = Vec::new();
    while let Ok(event) = recv_events_rx.try_recv() {
        recv_events.push(event);
    }

    TransferOutcome {
        assembled: sink.into_bytes(),
        send_stats,
        recv_stats,
        recv_events,
    }
}

async fn run_memory(data: Vec<u8>, config: TransferConfig) -> TransferOutcome {
    let (a, b) = memory::pair(channel_config());
    run_pair(data, config, a, b).await
}

#[tokio::test]
async fn empty_file() {
    let outcome = run_memory(Vec::new(), small_config()).await;
    assert!(outcome.assembled.is_empty());
    assert_eq!(outcome.send_stats.subs_total, 0);
    assert_eq!(outcome.send_stats.subs_completed, 0);
    assert_eq!(outcome.recv_stats.bytes_completed, 0);
    assert!(outcome
        .recv_events
        .iter()
        .any(|e| matches!(e, TransferEvent::Completed(_))));
}

#[tokio::test]
async fn exactly_one_sub_chunk_at_default_size() {
    // One full 1 MiB sub-chunk with the production chunk parameters.
    let data = patterned(SUB_CHUNK_SIZE as usize);
    let config = TransferConfig {
        gap_scan_grace: Duration::from_millis(500),
        ..TransferConfig::default()
    };
    let outcome = run_memory(data.clone(), config).await;

    assert_eq!(outcome.assembled, data);
    assert_eq!(outcome.send_stats.subs_total, 1);
    assert_eq!(outcome.send_stats.subs_completed, 1);
    assert_eq!(outcome.send_stats.mains_completed, 1);
}

#[tokio::test]
async fn short_tail_sub_chunk() {
    // Two full sub-chunks plus a 37-byte tail.
    let size = 2 * 1024 + 37;
    let data = patterned(size);
    let outcome = run_memory(data.clone(), small_config()).await;

    assert_eq!(outcome.assembled.len(), size);
    assert_eq!(outcome.assembled, data);
    assert_eq!(outcome.send_stats.subs_total, 3);
    assert_eq!(outcome.send_stats.subs_completed, 3);
}

#[tokio::test]
async fn main_chunk_boundary() {
    // One byte past a main-chunk boundary: a second main chunk holding
    // a single one-byte sub-chunk.
    let size = 4096 + 1;
    let data = patterned(size);
    let outcome = run_memory(data.clone(), small_config()).await;

    assert_eq!(outcome.assembled, data);
    assert_eq!(outcome.send_stats.mains_total, 2);
    assert_eq!(outcome.send_stats.mains_completed, 2);
    assert_eq!(outcome.send_stats.subs_total, 5);
}

#[tokio::test]
async fn digest_fault_injection_recovers() {
    // Flip one byte of the data frame for flat index 7 in transit,
    // exactly once. The receiver must request a retry and the second
    // copy must assemble correctly.
    let data = patterned(10 * 1024);
    let mut corrupted = false;
    let tap: memory::FrameTap = Box::new(move |frame| match frame {
        WireFrame::Data(mut d) if d.flat_index == 7 && !corrupted => {
            corrupted = true;
            d.payload[100] ^= 0xFF;
            WireFrame::Data(d)
        }
        other => other,
    });

    let (a, b) = memory::pair_with_tap(channel_config(), tap);
    let outcome = run_pair(data.clone(), small_config(), a, b).await;

    assert_eq!(outcome.assembled, data);
    assert_eq!(outcome.send_stats.subs_completed, 10);
    // The retry succeeded, so nothing is counted as failed.
    assert_eq!(outcome.send_stats.failed, 0);
    assert_eq!(outcome.recv_stats.failed, 0);
}

#[tokio::test]
async fn backpressure_pauses_sends_and_loses_nothing() {
    // High-water small enough to trip after ~2 sub-chunks. Holding the
    // delivery gate must stall the sender without losing data.
    let config = TransferConfig {
        high_water_mark: 2 * 1100,
        ..small_config()
    };
    let data = patterned(20 * 1024);

    let (a, b, gate) = memory::pair_with_gate(channel_config());
    let flow = a.flow();

    let cancel = CancellationToken::new();
    let (send_events, _keep) = mpsc::channel(64);
    let (recv_events, _keep2) = mpsc::channel(64);
    let sender = Sender::new(
        a,
        MemorySource::new("payload.bin", data.clone()),
        config.clone(),
        send_events,
        cancel.clone(),
    )
    .unwrap();
    let receiver = Receiver::new(b, MemorySink::new(), config.clone(), recv_events, cancel).unwrap();

    // Hold the transport before anything flows: the sender fills the
    // buffer up to the high-water mark and must then stop sending.
    gate.pause();

    let recv_task = tokio::spawn(receiver.run());
    let send_task = tokio::spawn(sender.run());

    tokio::time::sleep(Duration::from_millis(100)).await;

    // While held, the sender must respect the high-water mark: the
    // buffer never grows past one metadata/data pair over the mark.
    let pair_margin = 1024 + 256;
    let mut max_buffered = 0;
    for _ in 0..20 {
        max_buffered = max_buffered.max(flow.buffered_amount());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        max_buffered <= config.high_water_mark + pair_margin,
        "buffered {max_buffered} exceeded the gate bound"
    );
    assert!(
        max_buffered >= config.high_water_mark / 2,
        "sender should have filled the buffer while gated"
    );

    gate.resume();

    let send_stats = send_task.await.unwrap().unwrap();
    let (sink, recv_stats) = recv_task.await.unwrap().unwrap();
    assert_eq!(sink.into_bytes(), data);
    assert_eq!(send_stats.bytes_completed, 20 * 1024);
    assert_eq!(recv_stats.bytes_completed, 20 * 1024);
}

#[tokio::test]
async fn receiver_nacks_gap_after_grace_period() {
    // Drive the receiver with raw frames: announce three sub-chunks but
    // withhold the middle data frame. The gap scan must nack it.
    let config = small_config();
    let data = patterned(3 * 1024);
    let plan_digest =
        |range: std::ops::Range<usize>| beamdrop_transfer::digest_hex(&data[range]);

    let (mut peer, b) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (events, _keep) = mpsc::channel(64);
    let receiver = Receiver::new(b, MemorySink::new(), config, events, cancel).unwrap();
    let recv_task = tokio::spawn(receiver.run());

    peer.send(ControlFrame::FileStart {
        name: "gap.bin".into(),
        size: 3 * 1024,
        main_count: 1,
        sub_count: 3,
    })
    .unwrap();

    for index in [0u32, 1, 2] {
        let range = (index as usize * 1024)..((index as usize + 1) * 1024);
        peer.send(ControlFrame::ChunkMetadata {
            flat_index: index,
            main_index: 0,
            sub_index: index,
            digest: plan_digest(range.clone()),
        })
        .unwrap();
        if index != 1 {
            peer.send(DataFrame {
                flat_index: index,
                payload: data[range].to_vec(),
            })
            .unwrap();
        }
    }

    // Collect acks for 0 and 2, then the nack for 1.
    let mut nacked = None;
    loop {
        match peer.recv().await.unwrap().unwrap() {
            WireFrame::Control(ControlFrame::ChunkAck { ok: true, .. }) => {}
            WireFrame::Control(ControlFrame::ChunkNack { flat_indexes }) => {
                nacked = Some(flat_indexes);
                break;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(nacked, Some(vec![1]));

    // Retransmit the missing sub-chunk; the transfer then completes.
    peer.send(DataFrame {
        flat_index: 1,
        payload: data[1024..2048].to_vec(),
    })
    .unwrap();

    let mut got_complete = false;
    loop {
        match peer.recv().await.unwrap().unwrap() {
            WireFrame::Control(ControlFrame::ChunkAck {
                flat_index: 1,
                ok: true,
            }) => {}
            WireFrame::Control(ControlFrame::TransferComplete) => {
                got_complete = true;
                break;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(got_complete);

    peer.send(ControlFrame::TransferComplete).unwrap();
    let (sink, stats) = recv_task.await.unwrap().unwrap();
    assert_eq!(sink.into_bytes(), data);
    assert_eq!(stats.subs_completed, 3);
}

#[tokio::test]
async fn receiver_rejects_plan_mismatch() {
    let config = small_config();
    let (mut peer, b) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (events, _keep) = mpsc::channel(64);
    let receiver = Receiver::new(b, MemorySink::new(), config, events, cancel).unwrap();
    let recv_task = tokio::spawn(receiver.run());

    // 3 KiB is 3 sub-chunks at 1 KiB; announce 5.
    peer.send(ControlFrame::FileStart {
        name: "bad.bin".into(),
        size: 3 * 1024,
        main_count: 1,
        sub_count: 5,
    })
    .unwrap();

    let result = recv_task.await.unwrap();
    assert!(matches!(result, Err(TransferError::Plan(_))));

    // The receiver reported the rejection in-band before closing.
    let mut saw_error = false;
    while let Some(item) = peer.recv().await {
        if let Ok(WireFrame::Control(ControlFrame::Error { .. })) = item {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn receiver_ignores_out_of_range_indexes() {
    let config = small_config();
    let data = patterned(2 * 1024);
    let (mut peer, b) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (events, _keep) = mpsc::channel(64);
    let receiver = Receiver::new(b, MemorySink::new(), config, events, cancel).unwrap();
    let recv_task = tokio::spawn(receiver.run());

    peer.send(ControlFrame::FileStart {
        name: "range.bin".into(),
        size: 2 * 1024,
        main_count: 1,
        sub_count: 2,
    })
    .unwrap();

    // An index far past the plan: must be rejected without an ack.
    peer.send(ControlFrame::ChunkMetadata {
        flat_index: 9,
        main_index: 0,
        sub_index: 9,
        digest: beamdrop_transfer::digest_hex(b"bogus"),
    })
    .unwrap();
    peer.send(DataFrame {
        flat_index: 9,
        payload: b"bogus".to_vec(),
    })
    .unwrap();

    for index in [0u32, 1] {
        let range = (index as usize * 1024)..((index as usize + 1) * 1024);
        peer.send(ControlFrame::ChunkMetadata {
            flat_index: index,
            main_index: 0,
            sub_index: index,
            digest: beamdrop_transfer::digest_hex(&data[range.clone()]),
        })
        .unwrap();
        peer.send(DataFrame {
            flat_index: index,
            payload: data[range].to_vec(),
        })
        .unwrap();
    }

    let mut acked = Vec::new();
    loop {
        match peer.recv().await.unwrap().unwrap() {
            WireFrame::Control(ControlFrame::ChunkAck {
                flat_index,
                ok: true,
            }) => acked.push(flat_index),
            WireFrame::Control(ControlFrame::TransferComplete) => break,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    // Exactly the in-plan data frames are accepted.
    acked.sort_unstable();
    assert_eq!(acked, vec![0, 1]);

    peer.send(ControlFrame::TransferComplete).unwrap();
    let (sink, _) = recv_task.await.unwrap().unwrap();
    assert_eq!(sink.into_bytes(), data);
}

#[tokio::test]
async fn receiver_tolerates_data_before_metadata() {
    let config = small_config();
    let data = patterned(1024);
    let (mut peer, b) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (events, _keep) = mpsc::channel(64);
    let receiver = Receiver::new(b, MemorySink::new(), config, events, cancel).unwrap();
    let recv_task = tokio::spawn(receiver.run());

    peer.send(ControlFrame::FileStart {
        name: "swap.bin".into(),
        size: 1024,
        main_count: 1,
        sub_count: 1,
    })
    .unwrap();

    // Data first, metadata second.
    peer.send(DataFrame {
        flat_index: 0,
        payload: data.clone(),
    })
    .unwrap();
    peer.send(ControlFrame::ChunkMetadata {
        flat_index: 0,
        main_index: 0,
        sub_index: 0,
        digest: beamdrop_transfer::digest_hex(&data),
    })
    .unwrap();

    let mut acked = false;
    loop {
        match peer.recv().await.unwrap().unwrap() {
            WireFrame::Control(ControlFrame::ChunkAck {
                flat_index: 0,
                ok: true,
            }) => acked = true,
            WireFrame::Control(ControlFrame::TransferComplete) => break,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(acked);

    peer.send(ControlFrame::TransferComplete).unwrap();
    let (sink, _) = recv_task.await.unwrap().unwrap();
    assert_eq!(sink.into_bytes(), data);
}

#[tokio::test]
async fn duplicate_acks_do_not_disturb_the_sender() {
    let config = small_config();
    let data = patterned(2 * 1024);
    let (a, mut peer) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (events, _keep) = mpsc::channel(64);
    let sender = Sender::new(
        a,
        MemorySource::new("dup.bin", data),
        config,
        events,
        cancel,
    )
    .unwrap();
    let send_task = tokio::spawn(sender.run());

    let mut acked = std::collections::HashSet::new();
    loop {
        match peer.recv().await.unwrap().unwrap() {
            WireFrame::Control(ControlFrame::FileStart { sub_count, .. }) => {
                assert_eq!(sub_count, 2);
            }
            WireFrame::Control(ControlFrame::ChunkMetadata { .. }) => {}
            WireFrame::Data(d) => {
                // Ack every data frame twice.
                for _ in 0..2 {
                    peer.send(ControlFrame::ChunkAck {
                        flat_index: d.flat_index,
                        ok: true,
                    })
                    .unwrap();
                }
                acked.insert(d.flat_index);
            }
            WireFrame::Control(ControlFrame::TransferComplete) => break,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(acked.len(), 2);

    peer.send(ControlFrame::TransferComplete).unwrap();
    let stats = send_task.await.unwrap().unwrap();
    assert_eq!(stats.subs_completed, 2);
    assert_eq!(stats.subs_total, 2);
}

#[tokio::test]
async fn sender_gives_up_after_retry_budget() {
    let config = small_config();
    let data = patterned(1024);
    let (a, mut peer) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (events, _keep) = mpsc::channel(64);
    let sender = Sender::new(
        a,
        MemorySource::new("retry.bin", data),
        config.clone(),
        events,
        cancel,
    )
    .unwrap();
    let send_task = tokio::spawn(sender.run());

    // Demand a retry for every copy of sub-chunk 0 that arrives.
    let mut data_frames = 0;
    let result = loop {
        match peer.recv().await {
            Some(Ok(WireFrame::Data(_))) => {
                data_frames += 1;
                peer.send(ControlFrame::RetryRequest { flat_index: 0 }).unwrap();
            }
            Some(Ok(_)) => {}
            Some(Err(_)) => {}
            None => break send_task.await.unwrap(),
        }
    };

    // Initial send plus MAX_RETRIES retransmissions.
    assert_eq!(data_frames, 1 + config.max_retries as usize);
    assert!(matches!(
        result,
        Err(TransferError::RetriesExhausted { flat_index: 0 })
    ));
}

#[tokio::test]
async fn transfer_over_websocket_loopback() {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ws_config = ChannelConfig {
        max_payload: 1024,
        ..ChannelConfig::default()
    };

    let accept_config = ws_config.clone();
    let accept_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        beamdrop_channel::ws::accept(stream, accept_config).await.unwrap()
    });
    let a = beamdrop_channel::ws::connect(&format!("ws://{addr}"), ws_config)
        .await
        .unwrap();
    let b = accept_task.await.unwrap();

    let data = patterned(10 * 1024 + 300);
    let outcome = run_pair(data.clone(), small_config(), a, b).await;
    assert_eq!(outcome.assembled, data);
    assert_eq!(outcome.send_stats.bytes_completed, data.len() as u64);
    assert!(outcome
        .recv_events
        .iter()
        .any(|e| matches!(e, TransferEvent::Started { .. })));
}

#[tokio::test]
async fn file_source_to_file_sink_roundtrip() {
    use beamdrop_transfer::{FileSink, FileSource};

    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("input.bin");
    let data = patterned(5 * 1024 + 17);
    std::fs::write(&src_path, &data).unwrap();

    let out_dir = dir.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();

    let (a, b) = memory::pair(channel_config());
    let cancel = CancellationToken::new();
    let (send_events, _keep) = mpsc::channel(64);
    let (recv_events, _keep2) = mpsc::channel(64);

    let sender = Sender::new(
        a,
        FileSource::open(&src_path).unwrap(),
        small_config(),
        send_events,
        cancel.clone(),
    )
    .unwrap();
    let receiver = Receiver::new(
        b,
        FileSink::new(&out_dir),
        small_config(),
        recv_events,
        cancel,
    )
    .unwrap();

    let recv_task = tokio::spawn(receiver.run());
    sender.run().await.unwrap();
    let (sink, _) = recv_task.await.unwrap().unwrap();

    // The sink names the output after the file-start announcement.
    assert_eq!(sink.path().unwrap(), out_dir.join("input.bin"));
    let written = std::fs::read(out_dir.join("input.bin")).unwrap();
    assert_eq!(written, data);
}
