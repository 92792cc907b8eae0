// End-to-end room routing tests over in-memory duplex streams.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use loom_router::{ChunkFullBehavior, PartitionFullBehavior, QueueType, Room, RouterConfig, StreamPair};
use loom_wire as wire;

const MAX_CHUNK: usize = 64 << 10;

// Build the byte image of one producer message.
async fn producer_message(buf: &mut Vec<u8>, key: &[u8], declared_size: u64, payload: &[u8]) {
    wire::write_message_header(buf, key, declared_size, 0)
        .await
        .expect("header");
    if !payload.is_empty() {
        wire::write_chunk(buf, payload).await.expect("chunk");
    }
    wire::write_end_of_message(buf).await.expect("eom");
}

// Run handle_producer over a prepared byte image on its own task.
fn spawn_producer(room: &Arc<Room>, bytes: Vec<u8>) -> (JoinHandle<wire::Result<()>>, CancellationToken) {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let room = Arc::clone(room);
    let task = tokio::spawn(async move {
        let mut reader = bytes.as_slice();
        room.handle_producer(&task_cancel, &mut reader).await
    });
    (task, cancel)
}

struct Received {
    key: Bytes,
    msg_id: u64,
    payload: Vec<u8>,
}

// Consumer client that reads every message and acks it immediately.
fn spawn_acking_client(client: DuplexStream) -> mpsc::UnboundedReceiver<Received> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(client);
        loop {
            let header = match wire::read_message_header(&mut reader, 1024).await {
                Ok(Some(header)) => header,
                _ => return,
            };
            let mut payload = Vec::new();
            loop {
                match wire::read_chunk(&mut reader, MAX_CHUNK).await {
                    Ok(Some(chunk)) => payload.extend_from_slice(&chunk),
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
            if wire::write_ack(&mut writer, header.msg_id).await.is_err() {
                return;
            }
            let _ = tx.send(Received {
                key: header.key,
                msg_id: header.msg_id,
                payload,
            });
        }
    });
    rx
}

async fn read_one_message(
    reader: &mut ReadHalf<DuplexStream>,
) -> (wire::MessageHeader, Vec<u8>) {
    let header = wire::read_message_header(reader, 1024)
        .await
        .expect("header")
        .expect("message present");
    let mut payload = Vec::new();
    while let Some(chunk) = wire::read_chunk(reader, MAX_CHUNK).await.expect("chunk") {
        payload.extend_from_slice(&chunk);
    }
    (header, payload)
}

async fn ack(writer: &mut WriteHalf<DuplexStream>, msg_id: u64) {
    wire::write_ack(writer, msg_id).await.expect("ack");
}

#[tokio::test]
async fn producer_waits_for_consumer_ack() {
    let room = Room::new("gate", RouterConfig::default());
    let (stream, client, _stream_cancel) = StreamPair::duplex(64 * 1024);
    let _consumer = room.register_consumer("c", stream);

    let mut bytes = Vec::new();
    producer_message(&mut bytes, b"key", 0, b"hello").await;
    let (producer, _cancel) = spawn_producer(&room, bytes);

    let (mut reader, mut writer) = tokio::io::split(client);
    let (header, payload) = read_one_message(&mut reader).await;
    assert_eq!(header.key.as_ref(), b"key");
    assert!(header.msg_id > 0, "expected broker-assigned msg_id");
    assert_eq!(payload, b"hello");

    // No ack yet: the producer must still be parked at end-of-message.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished(), "producer completed before ack");

    ack(&mut writer, header.msg_id).await;
    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer released by ack")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn fanout_waits_for_every_ack() {
    let mut cfg = RouterConfig::default();
    cfg.queue_type = QueueType::Fanout;
    let room = Room::new("fanout", cfg);

    let (s1, c1, _t1) = StreamPair::duplex(64 * 1024);
    let (s2, c2, _t2) = StreamPair::duplex(64 * 1024);
    let _h1 = room.register_consumer("c1", s1);
    let _h2 = room.register_consumer("c2", s2);

    let mut bytes = Vec::new();
    producer_message(&mut bytes, b"key", 0, b"hello").await;
    let (producer, _cancel) = spawn_producer(&room, bytes);

    let (mut r1, mut w1) = tokio::io::split(c1);
    let (mut r2, mut w2) = tokio::io::split(c2);
    let (header1, payload1) = read_one_message(&mut r1).await;
    let (header2, payload2) = read_one_message(&mut r2).await;
    assert_eq!(header1.msg_id, header2.msg_id, "fanout shares one msg_id");
    assert_eq!(payload1, b"hello");
    assert_eq!(payload2, b"hello");

    ack(&mut w1, header1.msg_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished(), "one ack must not release the producer");

    ack(&mut w2, header2.msg_id).await;
    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer released by second ack")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn drop_newest_rejects_without_blocking() {
    let mut cfg = RouterConfig::default();
    cfg.consumer_queue_depth = 1;
    cfg.partition_full_behavior = PartitionFullBehavior::DropNewest;
    let room = Room::new("pressure", cfg);

    let (stream, client, _t) = StreamPair::duplex(64 * 1024);
    let _consumer = room.register_consumer("slow", stream);
    let (mut reader, _writer) = tokio::io::split(client);

    // First producer: its message is picked up by the writer, which then
    // parks waiting for an ack that never comes.
    let mut first = Vec::new();
    producer_message(&mut first, b"a", 0, b"one").await;
    let (p1, _c1) = spawn_producer(&room, first);
    let (header, _) = read_one_message(&mut reader).await;
    assert_eq!(header.key.as_ref(), b"a");

    // Second producer: its message occupies the single queue slot.
    let mut second = Vec::new();
    producer_message(&mut second, b"b", 0, b"two").await;
    let (p2, _c2) = spawn_producer(&room, second);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!p1.is_finished());
    assert!(!p2.is_finished());

    // Third producer: three messages, all rejected at enqueue. It must run
    // to completion without ever blocking on the stalled consumer.
    let mut third = Vec::new();
    producer_message(&mut third, b"c", 0, b"three").await;
    producer_message(&mut third, b"d", 0, b"four").await;
    producer_message(&mut third, b"e", 0, b"five").await;
    let (p3, _c3) = spawn_producer(&room, third);
    let result = tokio::time::timeout(Duration::from_secs(2), p3)
        .await
        .expect("drop_newest must not block the producer")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn drop_oldest_displaces_queued_message() {
    let mut cfg = RouterConfig::default();
    cfg.consumer_queue_depth = 1;
    cfg.partition_full_behavior = PartitionFullBehavior::DropOldest;
    let room = Room::new("displace", cfg);

    let (stream, client, _t) = StreamPair::duplex(64 * 1024);
    let _consumer = room.register_consumer("slow", stream);
    let (mut reader, mut writer) = tokio::io::split(client);

    // A is mid-write (header read, no ack); B waits in the queue.
    let mut bytes_a = Vec::new();
    producer_message(&mut bytes_a, b"a", 0, b"one").await;
    let (pa, _ca) = spawn_producer(&room, bytes_a);
    let (header_a, _) = read_one_message(&mut reader).await;
    assert_eq!(header_a.key.as_ref(), b"a");

    let mut bytes_b = Vec::new();
    producer_message(&mut bytes_b, b"b", 0, b"two").await;
    let (pb, _cb) = spawn_producer(&room, bytes_b);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pb.is_finished());

    // C displaces B: B's producer is released with a failed ack and C takes
    // the queue slot.
    let mut bytes_c = Vec::new();
    producer_message(&mut bytes_c, b"c", 0, b"three").await;
    let (pc, _cc) = spawn_producer(&room, bytes_c);
    let displaced = tokio::time::timeout(Duration::from_secs(2), pb)
        .await
        .expect("displaced producer must be released")
        .expect("join");
    assert!(displaced.is_ok());

    // Ack A; the tail resident must be C, not B.
    ack(&mut writer, header_a.msg_id).await;
    let finished_a = tokio::time::timeout(Duration::from_secs(2), pa)
        .await
        .expect("producer A released")
        .expect("join");
    assert!(finished_a.is_ok());

    let (header_next, payload_next) = read_one_message(&mut reader).await;
    assert_eq!(header_next.key.as_ref(), b"c");
    assert_eq!(payload_next, b"three");
    ack(&mut writer, header_next.msg_id).await;
    let finished_c = tokio::time::timeout(Duration::from_secs(2), pc)
        .await
        .expect("producer C released")
        .expect("join");
    assert!(finished_c.is_ok());
}

#[tokio::test]
async fn oversize_declared_message_is_skipped() {
    let mut cfg = RouterConfig::default();
    cfg.max_message_bytes = 100;
    let room = Room::new("oversize", cfg);

    let (stream, client, _t) = StreamPair::duplex(64 * 1024);
    let _consumer = room.register_consumer("c", stream);
    let mut received = spawn_acking_client(client);

    let mut bytes = Vec::new();
    producer_message(&mut bytes, b"big", 1000, &[b'x'; 50]).await;
    producer_message(&mut bytes, b"k2", 0, b"fits").await;
    let (producer, _cancel) = spawn_producer(&room, bytes);

    // Only the second message reaches the consumer.
    let first = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("delivery")
        .expect("message");
    assert_eq!(first.key.as_ref(), b"k2");
    assert_eq!(first.payload, b"fits");

    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer completes")
        .expect("join");
    assert!(result.is_ok());
    assert!(received.try_recv().is_err(), "oversize message leaked through");
}

#[tokio::test]
async fn running_total_over_cap_cancels_delivery() {
    let mut cfg = RouterConfig::default();
    cfg.max_message_bytes = 100;
    let room = Room::new("cap", cfg);

    let (stream, client, _t) = StreamPair::duplex(64 * 1024);
    let _consumer = room.register_consumer("c", stream);
    let mut received = spawn_acking_client(client);

    // declared_size 0 (unknown), but the streamed bytes exceed the cap.
    let mut bytes = Vec::new();
    wire::write_message_header(&mut bytes, b"big", 0, 0)
        .await
        .expect("header");
    for _ in 0..3 {
        wire::write_chunk(&mut bytes, &[b'x'; 60]).await.expect("chunk");
    }
    wire::write_end_of_message(&mut bytes).await.expect("eom");
    producer_message(&mut bytes, b"k2", 0, b"fits").await;
    let (producer, _cancel) = spawn_producer(&room, bytes);

    // The consumer may see a truncated frame for "big" but never its full
    // payload; the next complete delivery must be "k2".
    let delivered = loop {
        let message = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("delivery")
            .expect("message");
        if message.key.as_ref() == b"k2" {
            break message;
        }
        assert!(
            message.payload.len() < 180,
            "canceled message delivered in full"
        );
    };
    assert_eq!(delivered.payload, b"fits");

    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer completes")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn empty_key_fails_the_stream() {
    let room = Room::new("corrupt", RouterConfig::default());
    let (stream, client, _t) = StreamPair::duplex(64 * 1024);
    let _consumer = room.register_consumer("c", stream);
    drop(client);

    // key_len = 0 directly after a valid stream start.
    let bytes = vec![0u8];
    let (producer, _cancel) = spawn_producer(&room, bytes);
    let err = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer fails fast")
        .expect("join")
        .expect_err("empty key must fail the stream");
    assert!(matches!(err, wire::WireError::EmptyKey));
    assert!(err.is_protocol());
    assert_eq!(err.error_type(), "empty_key");
}

#[tokio::test]
async fn partitioned_key_affinity_is_stable() {
    let room = Room::new("affinity", RouterConfig::default());
    let (s1, c1, _t1) = StreamPair::duplex(64 * 1024);
    let (s2, c2, _t2) = StreamPair::duplex(64 * 1024);
    let h1 = room.register_consumer("c1", s1);
    let h2 = room.register_consumer("c2", s2);
    assert_eq!(h1.id(), "c-1");
    assert_eq!(h2.id(), "c-2");

    let mut rx1 = spawn_acking_client(c1);
    let mut rx2 = spawn_acking_client(c2);

    let mut bytes = Vec::new();
    for i in 0..5u8 {
        producer_message(&mut bytes, b"sticky", 0, &[i]).await;
    }
    let (producer, _cancel) = spawn_producer(&room, bytes);
    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer completes")
        .expect("join");
    assert!(result.is_ok());

    // All five land on one consumer, in order, with increasing ids.
    let first = tokio::select! {
        message = rx1.recv() => (message.expect("message"), 1),
        message = rx2.recv() => (message.expect("message"), 2),
    };
    let (mut winner_rx, mut loser_rx) = if first.1 == 1 { (rx1, rx2) } else { (rx2, rx1) };
    let mut messages = vec![first.0];
    while messages.len() < 5 {
        let message = tokio::time::timeout(Duration::from_secs(2), winner_rx.recv())
            .await
            .expect("delivery")
            .expect("message");
        messages.push(message);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(loser_rx.try_recv().is_err(), "key leaked to a second consumer");
    for pair in messages.windows(2) {
        assert!(pair[0].msg_id < pair[1].msg_id, "msg ids must increase");
    }
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message.payload, vec![i as u8], "per-key FIFO order");
    }
}

#[tokio::test]
async fn consumer_teardown_releases_waiting_producer() {
    let room = Room::new("teardown", RouterConfig::default());
    let (stream, client, stream_cancel) = StreamPair::duplex(64 * 1024);
    let consumer = room.register_consumer("c", stream);

    let mut bytes = Vec::new();
    producer_message(&mut bytes, b"key", 0, b"hello").await;
    let (producer, _cancel) = spawn_producer(&room, bytes);

    let (mut reader, _writer) = tokio::io::split(client);
    let (header, _) = read_one_message(&mut reader).await;
    assert_eq!(header.key.as_ref(), b"key");

    // The consumer goes away without acking; its teardown must fail the
    // pending ack and release the producer.
    stream_cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), consumer.closed())
        .await
        .expect("consumer torn down");
    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("producer released by teardown")
        .expect("join");
    assert!(result.is_ok());
    assert_eq!(room.consumer_count(), 0);
}

#[tokio::test]
async fn chunk_drop_policy_sheds_stalled_target() {
    let mut cfg = RouterConfig::default();
    cfg.message_chunk_queue = 1;
    cfg.chunk_full_behavior = ChunkFullBehavior::Drop;
    let room = Room::new("shed", cfg);

    // A one-byte transport buffer wedges the writer mid-frame, so chunks
    // pile up in the bounded queue instead.
    let (stream, client, _t) = StreamPair::duplex(1);
    let _consumer = room.register_consumer("stuck", stream);
    let _hold = client;

    let mut bytes = Vec::new();
    wire::write_message_header(&mut bytes, b"key", 0, 0)
        .await
        .expect("header");
    for _ in 0..16 {
        wire::write_chunk(&mut bytes, &[b'x'; 512]).await.expect("chunk");
    }
    wire::write_end_of_message(&mut bytes).await.expect("eom");
    let (producer, _cancel) = spawn_producer(&room, bytes);

    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("drop policy must not block the producer")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn chunk_block_policy_backpressures_producer() {
    let mut cfg = RouterConfig::default();
    cfg.message_chunk_queue = 1;
    cfg.chunk_full_behavior = ChunkFullBehavior::Block;
    let room = Room::new("block", cfg);

    let (stream, client, _t) = StreamPair::duplex(1);
    let _consumer = room.register_consumer("stuck", stream);
    let _hold = client;

    let mut bytes = Vec::new();
    wire::write_message_header(&mut bytes, b"key", 0, 0)
        .await
        .expect("header");
    for _ in 0..16 {
        wire::write_chunk(&mut bytes, &[b'x'; 512]).await.expect("chunk");
    }
    wire::write_end_of_message(&mut bytes).await.expect("eom");
    let (producer, cancel) = spawn_producer(&room, bytes);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!producer.is_finished(), "block policy must apply backpressure");

    // Producer cancellation is an exit path out of the blocking enqueue.
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("cancellation releases the producer")
        .expect("join");
    assert!(result.is_ok());
}
