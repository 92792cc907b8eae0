//! Routing core for the Loom broker.
//!
//! A [`Room`] demultiplexes producer messages onto registered consumers by
//! key (rendezvous over a partition id) or by fanout, pipelines each
//! message's chunks through bounded queues, and holds the producer at
//! end-of-message until every target has acknowledged. The [`RoomManager`]
//! creates rooms lazily and applies per-room configuration overrides.
//!
//! The core is transport-agnostic: adapters hand it a [`StreamPair`] (byte
//! reader, byte writer, cancellation token) per accepted stream.
pub mod config;
pub mod rendezvous;
pub mod room;
pub mod rooms;
pub mod stream;
pub mod tracker;

pub use config::{
    message_chunk_queue_for, ChunkFullBehavior, PartitionFullBehavior, QueueType, RouterConfig,
};
pub use room::{ConsumerHandle, Room};
pub use rooms::RoomManager;
pub use stream::StreamPair;
pub use tracker::{ProducerErrorTracker, DEFAULT_ERROR_WINDOW, DEFAULT_MAX_ERRORS_PER_WINDOW};
