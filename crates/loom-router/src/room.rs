// Room routing engine.
//
// A room owns its consumer table and two sequence counters. Each consumer
// owns a bounded send queue, a pending-ack map and a reader/writer task
// pair. Each in-flight message owns a bounded chunk queue and a one-shot
// ack signal per target. The producer task is released past end-of-message
// only when every target has acked or dropped out; that coupling is what
// bounds broker memory.
//
// Lock discipline: the consumer table lock and the per-consumer pending
// lock are never held across an await point.
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_channel::TrySendError;
use bytes::Bytes;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use loom_wire as wire;

use crate::config::{ChunkFullBehavior, PartitionFullBehavior, QueueType, RouterConfig};
use crate::rendezvous::Rendezvous;
use crate::stream::StreamPair;

// Shared per-target state of one in-flight message. The ack slot is a
// watch value so that firing is idempotent and both the writer task and the
// producer task can resolve it; the first write wins.
struct MessageState {
    canceled: AtomicBool,
    ack: watch::Sender<Option<bool>>,
}

impl MessageState {
    fn new() -> (Arc<Self>, watch::Receiver<Option<bool>>) {
        let (ack, ack_rx) = watch::channel(None);
        (
            Arc::new(Self {
                canceled: AtomicBool::new(false),
                ack,
            }),
            ack_rx,
        )
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    // Fire the ack signal; only the first caller decides the outcome.
    fn fire_ack(&self, ok: bool) {
        self.ack.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(ok);
                true
            } else {
                false
            }
        });
    }
}

// One message pinned to one consumer, queued for that consumer's writer.
struct RoutedMessage {
    key: Bytes,
    declared_size: u64,
    msg_id: u64,
    chunks: async_channel::Receiver<Bytes>,
    state: Arc<MessageState>,
}

struct Consumer {
    id: String,
    name: String,
    active: AtomicBool,
    send_tx: async_channel::Sender<RoutedMessage>,
    // Receiver clones share one queue; the producer side uses its clone to
    // displace the oldest entry under the drop_oldest policy.
    send_rx: async_channel::Receiver<RoutedMessage>,
    done: CancellationToken,
    pending: Mutex<HashMap<u64, Arc<MessageState>>>,
}

/// Returned by [`Room::register_consumer`].
pub struct ConsumerHandle {
    id: String,
    done: CancellationToken,
}

impl ConsumerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves once the consumer has been torn down and removed.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }
}

// Producer-side handle for one target of the message currently being
// ingested.
struct Target {
    consumer: Arc<Consumer>,
    chunk_tx: async_channel::Sender<Bytes>,
    state: Arc<MessageState>,
    ack_rx: watch::Receiver<Option<bool>>,
}

enum Enqueue {
    Enqueued(Target),
    Rejected,
    ProducerCanceled,
}

enum ChunkSend {
    Kept,
    TargetDropped,
    ProducerCanceled,
}

/// A single delivery domain: consumer registry, sequence counters and the
/// dispatch loop for producer streams. Rooms are created by the
/// [`RoomManager`](crate::rooms::RoomManager) and live for the rest of the
/// process.
pub struct Room {
    name: String,
    cfg: RwLock<RouterConfig>,
    selector: Rendezvous,
    partition_seed: RandomState,
    consumers: RwLock<HashMap<String, Arc<Consumer>>>,
    consumer_seq: AtomicU64,
    message_seq: AtomicU64,
}

impl Room {
    pub fn new(name: impl Into<String>, cfg: RouterConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cfg: RwLock::new(cfg),
            selector: Rendezvous::new(),
            partition_seed: RandomState::new(),
            consumers: RwLock::new(HashMap::new()),
            consumer_seq: AtomicU64::new(0),
            message_seq: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> RouterConfig {
        self.cfg.read().expect("config lock").clone()
    }

    /// Swap the configuration. New messages honor the new limits; in-flight
    /// messages and existing consumer queue depths are unaffected.
    pub fn set_config(&self, cfg: RouterConfig) {
        *self.cfg.write().expect("config lock") = cfg;
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().expect("consumer table").len()
    }

    /// Register a subscriber and spawn its reader/writer task pair. The
    /// consumer removes itself from the room when its writer exits.
    pub fn register_consumer(self: &Arc<Self>, name: &str, stream: StreamPair) -> ConsumerHandle {
        let cfg = self.config();
        let id = format!("c-{}", self.consumer_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let (send_tx, send_rx) = async_channel::bounded(cfg.consumer_queue_depth.max(1));
        let consumer = Arc::new(Consumer {
            id: id.clone(),
            name: name.to_string(),
            active: AtomicBool::new(true),
            send_tx,
            send_rx,
            done: CancellationToken::new(),
            pending: Mutex::new(HashMap::new()),
        });
        self.consumers
            .write()
            .expect("consumer table")
            .insert(id.clone(), Arc::clone(&consumer));

        let StreamPair {
            reader,
            writer,
            cancel,
        } = stream;
        tokio::spawn(run_reader(Arc::clone(&consumer), reader));
        tokio::spawn(run_writer(
            Arc::downgrade(self),
            self.name.clone(),
            Arc::clone(&consumer),
            writer,
            cancel,
        ));
        tracing::debug!(
            room = %self.name,
            id = %consumer.id,
            name = %consumer.name,
            "consumer registered"
        );
        ConsumerHandle {
            id,
            done: consumer.done.clone(),
        }
    }

    /// Ingest one producer stream until clean EOF, cancellation or error.
    ///
    /// Cancellation is not an error: the stream ends cleanly. Protocol and
    /// transport failures are returned so the dispatcher can classify them.
    pub async fn handle_producer<R>(
        &self,
        cancel: &CancellationToken,
        reader: &mut R,
    ) -> wire::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let cfg = self.config();
            let header = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                header = wire::read_message_header(reader, cfg.max_key_bytes) => header?,
            };
            let Some(header) = header else {
                return Ok(());
            };
            counter!("loom_messages_in_total", "room" => self.name.clone()).increment(1);

            // declared_size zero means "unknown"; the running total below
            // still applies.
            if header.declared_size > cfg.max_message_bytes {
                self.count_drop("too_large");
                wire::discard_message(reader, cfg.max_chunk_bytes).await?;
                continue;
            }

            let targets = self.select_targets(&header.key, &cfg);
            if targets.is_empty() {
                self.count_drop("no_consumer");
                wire::discard_message(reader, cfg.max_chunk_bytes).await?;
                continue;
            }

            // One routed message per target: same broker-assigned id, but an
            // independent chunk queue and ack signal each.
            let msg_id = self.message_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let mut live: Vec<Target> = Vec::with_capacity(targets.len());
            for consumer in targets {
                match self.enqueue_message(&cfg, consumer, &header, msg_id, cancel).await {
                    Enqueue::Enqueued(target) => live.push(target),
                    Enqueue::Rejected => {}
                    Enqueue::ProducerCanceled => {
                        release_targets(&live);
                        return Ok(());
                    }
                }
            }
            if live.is_empty() {
                wire::discard_message(reader, cfg.max_chunk_bytes).await?;
                continue;
            }

            let mut total = 0u64;
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        release_targets(&live);
                        return Ok(());
                    }
                    chunk = wire::read_chunk(reader, cfg.max_chunk_bytes) => match chunk {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            // Source stream is dead. Closing the chunk
                            // queues lets each writer finish the frame it
                            // started with an end-of-message.
                            drop(live);
                            return Err(err);
                        }
                    },
                };
                let Some(chunk) = chunk else {
                    break; // end of message
                };

                total += chunk.len() as u64;
                counter!("loom_bytes_in_total", "room" => self.name.clone())
                    .increment(chunk.len() as u64);
                if total > cfg.max_message_bytes {
                    self.count_drop("too_large");
                    release_targets(&live);
                    live.clear();
                    wire::discard_message(reader, cfg.max_chunk_bytes).await?;
                    break;
                }

                let mut index = 0;
                while index < live.len() {
                    match self
                        .forward_chunk(&cfg, &live[index], chunk.clone(), cancel)
                        .await
                    {
                        ChunkSend::Kept => index += 1,
                        ChunkSend::TargetDropped => {
                            let target = live.swap_remove(index);
                            target.state.cancel();
                            target.state.fire_ack(false);
                        }
                        ChunkSend::ProducerCanceled => {
                            release_targets(&live);
                            return Ok(());
                        }
                    }
                }
                if live.is_empty() {
                    // Every target fell away; skip the rest of the source.
                    wire::discard_message(reader, cfg.max_chunk_bytes).await?;
                    break;
                }
            }
            if live.is_empty() {
                continue;
            }

            // End of message: close each chunk queue (the writer turns that
            // into an end-of-message frame) and wait for every ack. Target
            // teardown or our own cancellation releases the wait early.
            for target in &live {
                target.chunk_tx.close();
            }
            for target in &live {
                let mut ack_rx = target.ack_rx.clone();
                tokio::select! {
                    _ = ack_rx.wait_for(|slot| slot.is_some()) => {}
                    _ = target.consumer.done.cancelled() => {
                        target.state.fire_ack(false);
                    }
                    _ = cancel.cancelled() => {
                        target.state.fire_ack(false);
                        return Ok(());
                    }
                }
            }
        }
    }

    // Pick the targets for a key under the room's routing mode.
    fn select_targets(&self, key: &[u8], cfg: &RouterConfig) -> Vec<Arc<Consumer>> {
        let consumers = self.consumers.read().expect("consumer table");
        match cfg.queue_type {
            QueueType::Fanout => consumers
                .values()
                .filter(|c| c.active.load(Ordering::Relaxed))
                .cloned()
                .collect(),
            QueueType::Partitioned => {
                let partition_key = self.partition_key(key, cfg.partition_count);
                let winner = self.selector.pick(
                    &partition_key,
                    consumers
                        .values()
                        .filter(|c| c.active.load(Ordering::Relaxed))
                        .map(|c| c.id.as_str()),
                );
                winner
                    .and_then(|id| consumers.get(id))
                    .filter(|c| c.active.load(Ordering::Relaxed))
                    .cloned()
                    .map(|c| vec![c])
                    .unwrap_or_default()
            }
        }
    }

    // The rendezvous input is the partition id, not the raw key, so the
    // effective routing cardinality is capped at partition_count.
    fn partition_key(&self, key: &[u8], partition_count: u64) -> [u8; 8] {
        let mut hasher = self.partition_seed.build_hasher();
        hasher.write(key);
        let partition = hasher.finish() % partition_count.max(1);
        partition.to_be_bytes()
    }

    // Enqueue one routed message into a target's send queue under the
    // partition-full policy.
    async fn enqueue_message(
        &self,
        cfg: &RouterConfig,
        consumer: Arc<Consumer>,
        header: &wire::MessageHeader,
        msg_id: u64,
        cancel: &CancellationToken,
    ) -> Enqueue {
        if consumer.done.is_cancelled() {
            self.count_drop("consumer_gone");
            return Enqueue::Rejected;
        }
        let (chunk_tx, chunk_rx) = async_channel::bounded(cfg.message_chunk_queue.max(1));
        let (state, ack_rx) = MessageState::new();
        let msg = RoutedMessage {
            key: header.key.clone(),
            declared_size: header.declared_size,
            msg_id,
            chunks: chunk_rx,
            state: Arc::clone(&state),
        };
        let target = Target {
            consumer: Arc::clone(&consumer),
            chunk_tx,
            state,
            ack_rx,
        };

        match cfg.partition_full_behavior {
            PartitionFullBehavior::Block => {
                tokio::select! {
                    result = consumer.send_tx.send(msg) => match result {
                        Ok(()) => Enqueue::Enqueued(target),
                        Err(_) => {
                            self.count_drop("consumer_gone");
                            Enqueue::Rejected
                        }
                    },
                    _ = consumer.done.cancelled() => {
                        self.count_drop("consumer_gone");
                        Enqueue::Rejected
                    }
                    _ = cancel.cancelled() => Enqueue::ProducerCanceled,
                }
            }
            PartitionFullBehavior::DropOldest => match consumer.send_tx.try_send(msg) {
                Ok(()) => Enqueue::Enqueued(target),
                Err(TrySendError::Full(msg)) => {
                    if let Ok(displaced) = consumer.send_rx.try_recv() {
                        // The displaced message was still queued, so nothing
                        // of it reached the wire; resolve it right here.
                        displaced.state.cancel();
                        displaced.state.fire_ack(false);
                        self.count_drop("displaced");
                    }
                    match consumer.send_tx.try_send(msg) {
                        Ok(()) => Enqueue::Enqueued(target),
                        Err(_) => {
                            self.count_drop("queue_full");
                            Enqueue::Rejected
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    self.count_drop("consumer_gone");
                    Enqueue::Rejected
                }
            },
            PartitionFullBehavior::DropNewest => match consumer.send_tx.try_send(msg) {
                Ok(()) => Enqueue::Enqueued(target),
                Err(TrySendError::Full(_)) => {
                    self.count_drop("queue_full");
                    Enqueue::Rejected
                }
                Err(TrySendError::Closed(_)) => {
                    self.count_drop("consumer_gone");
                    Enqueue::Rejected
                }
            },
        }
    }

    // Broadcast one chunk into a target's chunk queue under the chunk-full
    // policy.
    async fn forward_chunk(
        &self,
        cfg: &RouterConfig,
        target: &Target,
        chunk: Bytes,
        cancel: &CancellationToken,
    ) -> ChunkSend {
        if target.state.is_canceled() || target.consumer.done.is_cancelled() {
            return ChunkSend::TargetDropped;
        }
        match cfg.chunk_full_behavior {
            ChunkFullBehavior::Drop => match target.chunk_tx.try_send(chunk) {
                Ok(()) => ChunkSend::Kept,
                Err(TrySendError::Full(_)) => {
                    self.count_drop("chunk_queue_full");
                    ChunkSend::TargetDropped
                }
                Err(TrySendError::Closed(_)) => ChunkSend::TargetDropped,
            },
            ChunkFullBehavior::Block => {
                tokio::select! {
                    result = target.chunk_tx.send(chunk) => match result {
                        Ok(()) => ChunkSend::Kept,
                        Err(_) => ChunkSend::TargetDropped,
                    },
                    _ = target.consumer.done.cancelled() => ChunkSend::TargetDropped,
                    _ = cancel.cancelled() => ChunkSend::ProducerCanceled,
                }
            }
        }
    }

    fn count_drop(&self, reason: &'static str) {
        counter!("loom_drops_total", "room" => self.name.clone(), "reason" => reason)
            .increment(1);
    }
}

// Mark every remaining target canceled and resolve its ack. Used on the
// producer's early-exit paths; dropping the targets afterwards closes their
// chunk queues so writers can finish their frames.
fn release_targets(live: &[Target]) {
    for target in live {
        target.state.cancel();
        target.state.fire_ack(false);
    }
}

// Reader task: drains ACK frames until the stream dies. Unknown frame types
// are skipped for forward compatibility.
async fn run_reader(consumer: Arc<Consumer>, reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut reader = BufReader::new(reader);
    loop {
        let (frame_type, msg_id) = match wire::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if frame_type != wire::FRAME_ACK {
            continue;
        }
        let state = consumer
            .pending
            .lock()
            .expect("pending lock")
            .get(&msg_id)
            .cloned();
        if let Some(state) = state {
            state.fire_ack(true);
        }
    }
}

// Writer task: forwards routed messages to the consumer stream, then tears
// the consumer down when the stream dies or the queue closes.
async fn run_writer(
    room: Weak<Room>,
    room_name: String,
    consumer: Arc<Consumer>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    cancel: CancellationToken,
) {
    let mut writer = BufWriter::new(writer);
    if let Err(err) = writer_loop(&room_name, &consumer, &mut writer, &cancel).await {
        tracing::debug!(
            room = %room_name,
            id = %consumer.id,
            error = %err,
            "consumer writer failed"
        );
    }

    // Teardown order: deactivate so routing stops picking this consumer,
    // close and drain the queue, then resolve every pending ack exactly
    // once before announcing `done`.
    consumer.active.store(false, Ordering::Relaxed);
    consumer.send_rx.close();
    while let Ok(stale) = consumer.send_rx.try_recv() {
        stale.state.cancel();
        stale.state.fire_ack(false);
    }
    {
        let mut pending = consumer.pending.lock().expect("pending lock");
        for (_, state) in pending.drain() {
            state.fire_ack(false);
        }
    }
    consumer.done.cancel();
    if let Some(room) = room.upgrade() {
        room.consumers
            .write()
            .expect("consumer table")
            .remove(&consumer.id);
    }
    let _ = writer.shutdown().await;
    tracing::debug!(room = %room_name, id = %consumer.id, "consumer removed");
}

async fn writer_loop(
    room_name: &str,
    consumer: &Consumer,
    writer: &mut (impl AsyncWrite + Unpin),
    cancel: &CancellationToken,
) -> wire::Result<()> {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = consumer.send_rx.recv() => match msg {
                Ok(msg) => msg,
                Err(_) => return Ok(()),
            },
        };
        if !consumer.active.load(Ordering::Relaxed) || msg.state.is_canceled() {
            // Canceled while still queued: nothing was written, skip it.
            msg.state.cancel();
            msg.state.fire_ack(false);
            continue;
        }

        consumer
            .pending
            .lock()
            .expect("pending lock")
            .insert(msg.msg_id, Arc::clone(&msg.state));

        wire::write_message_header(writer, &msg.key, msg.declared_size, msg.msg_id).await?;
        let mut payload_bytes = 0u64;
        while let Ok(chunk) = msg.chunks.recv().await {
            if msg.state.is_canceled() {
                // Canceled mid-write: keep draining without forwarding and
                // still emit end-of-message so frame alignment survives.
                continue;
            }
            payload_bytes += chunk.len() as u64;
            wire::write_chunk(writer, &chunk).await?;
        }
        wire::write_end_of_message(writer).await?;
        writer.flush().await?;
        if !msg.state.is_canceled() {
            counter!("loom_messages_out_total", "room" => room_name.to_string()).increment(1);
            counter!("loom_bytes_out_total", "room" => room_name.to_string())
                .increment(payload_bytes);
        }

        let mut ack_rx = msg.state.ack.subscribe();
        tokio::select! {
            _ = ack_rx.wait_for(|slot| slot.is_some()) => {}
            _ = cancel.cancelled() => {
                msg.state.fire_ack(false);
                consumer
                    .pending
                    .lock()
                    .expect("pending lock")
                    .remove(&msg.msg_id);
                return Ok(());
            }
        }
        consumer
            .pending
            .lock()
            .expect("pending lock")
            .remove(&msg.msg_id);
    }
}
