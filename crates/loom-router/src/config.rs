// Per-room routing configuration. The service layer builds these from its
// own config document and pushes updates through `RoomManager::update_config`.

/// Policy applied when a consumer's bounded send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFullBehavior {
    DropNewest,
    DropOldest,
    Block,
}

impl PartitionFullBehavior {
    /// Parse a config value. The legacy name "drop" is accepted as
    /// `DropNewest`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drop_newest" | "drop" => Some(Self::DropNewest),
            "drop_oldest" => Some(Self::DropOldest),
            "block" => Some(Self::Block),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropNewest => "drop_newest",
            Self::DropOldest => "drop_oldest",
            Self::Block => "block",
        }
    }
}

/// Policy applied when a message's bounded chunk queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFullBehavior {
    /// Cancel the message for the affected target.
    Drop,
    Block,
}

impl ChunkFullBehavior {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drop" => Some(Self::Drop),
            "block" => Some(Self::Block),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Block => "block",
        }
    }
}

/// How a room picks targets for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    /// One consumer per message, chosen by rendezvous over the partition key.
    Partitioned,
    /// Every active consumer receives the message.
    Fanout,
}

impl QueueType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "partitioned" => Some(Self::Partitioned),
            "fanout" => Some(Self::Fanout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partitioned => "partitioned",
            Self::Fanout => "fanout",
        }
    }
}

// Per in-flight message byte budget used to derive the chunk queue depth.
const TARGET_BUFFERED_BYTES: usize = 1 << 20;

/// Derive the chunk queue depth from the chunk size cap so that one
/// in-flight message buffers at most ~1 MiB.
pub fn message_chunk_queue_for(max_chunk_bytes: usize) -> usize {
    if max_chunk_bytes == 0 {
        return 1;
    }
    (TARGET_BUFFERED_BYTES / max_chunk_bytes).max(1)
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub partition_count: u64,

    pub max_name_bytes: usize,
    pub max_room_bytes: usize,
    pub max_token_bytes: usize,
    pub max_key_bytes: usize,
    pub max_chunk_bytes: usize,
    pub max_message_bytes: u64,

    pub consumer_queue_depth: usize,
    pub message_chunk_queue: usize,

    pub partition_full_behavior: PartitionFullBehavior,
    pub chunk_full_behavior: ChunkFullBehavior,
    pub queue_type: QueueType,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let max_chunk_bytes = 64 << 10;
        Self {
            partition_count: 64,
            max_name_bytes: 128,
            max_room_bytes: 128,
            max_token_bytes: 1024,
            max_key_bytes: 256,
            max_chunk_bytes,
            max_message_bytes: 256 << 20,
            consumer_queue_depth: 128,
            message_chunk_queue: message_chunk_queue_for(max_chunk_bytes),
            partition_full_behavior: PartitionFullBehavior::DropNewest,
            chunk_full_behavior: ChunkFullBehavior::Drop,
            queue_type: QueueType::Partitioned,
        }
    }
}
