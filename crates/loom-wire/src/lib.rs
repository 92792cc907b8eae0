// Wire format for Loom streams.
//
// Every stream starts with a preface (magic, version, role, identity).
// Producer streams then carry a sequence of (message header, chunk*,
// end-of-message); broker-to-consumer streams carry the same sequence with
// the broker-assigned message id, and consumers answer with ACK frames.
// The only primitive is an unsigned LEB128 varint capped at ten bytes.
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 4] = *b"LOOM";
pub const VERSION: u8 = 4;

/// Frame type carried on consumer-to-broker streams.
pub const FRAME_ACK: u64 = 1;

// Decoded varints above 2^50 (~1 PiB) are treated as stream corruption; no
// legitimate length field comes close.
pub const MAX_VARINT_VALUE: u64 = 1 << 50;
const MAX_VARINT_LEN: u32 = 10;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("bad handshake")]
    BadHandshake,
    #[error("empty key - possible stream corruption")]
    EmptyKey,
    #[error("key too large: {len} (max {max}) - stream likely corrupted")]
    KeyTooLarge { len: u64, max: u64 },
    #[error("chunk too large: {len} (max {max}) - stream likely corrupted")]
    ChunkTooLarge { len: u64, max: u64 },
    #[error("{field} too large: {len} (max {max})")]
    FieldTooLarge {
        field: &'static str,
        len: u64,
        max: u64,
    },
    #[error("invalid varint value {0} - stream corrupted")]
    InvalidVarint(u64),
    #[error("varint overflow")]
    VarintOverflow,
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// True for errors caused by malformed input rather than transport I/O.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, WireError::Io(_))
    }

    /// Metric label for the protocol error class.
    pub fn error_type(&self) -> &'static str {
        match self {
            WireError::EmptyKey => "empty_key",
            WireError::KeyTooLarge { .. } => "key_too_large",
            WireError::ChunkTooLarge { .. } => "chunk_too_large",
            WireError::InvalidVarint(_) | WireError::VarintOverflow => "invalid_varint",
            _ => "unknown_protocol",
        }
    }
}

/// Role a stream declares in its preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn from_byte(byte: u8) -> Option<Role> {
        match byte {
            b'P' => Some(Role::Producer),
            b'C' => Some(Role::Consumer),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Role::Producer => b'P',
            Role::Consumer => b'C',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

/// Per-stream handshake sent once, before any frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preface {
    pub role: Role,
    pub name: String,
    pub room: String,
    pub token: String,
}

/// Length caps applied while reading a preface.
#[derive(Debug, Clone, Copy)]
pub struct PrefaceLimits {
    pub max_name_bytes: usize,
    pub max_room_bytes: usize,
    pub max_token_bytes: usize,
}

/// Header of one message on a producer or consumer stream.
///
/// `msg_id` is ignored on ingress; the broker assigns its own before
/// forwarding the header to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: Bytes,
    pub declared_size: u64,
    pub msg_id: u64,
}

/// Encode a varint into a buffer. Used by the async writers and by tests
/// that build wire images by hand.
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub async fn write_uvarint<W: AsyncWrite + Unpin>(writer: &mut W, value: u64) -> Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN as usize);
    put_uvarint(&mut buf, value);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a varint, rejecting encodings longer than ten bytes and decoded
/// values above [`MAX_VARINT_VALUE`].
pub async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    match try_read_uvarint(reader).await? {
        Some(value) => Ok(value),
        None => Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof reading varint",
        ))),
    }
}

// Like read_uvarint, but a clean EOF before the first byte yields None.
// EOF in the middle of a varint is still an error.
async fn try_read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if first {
                return Ok(None);
            }
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof inside varint",
            )));
        }
        first = false;
        let byte = byte[0];
        if shift >= 7 * MAX_VARINT_LEN || (shift == 63 && byte > 1) {
            return Err(WireError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if value > MAX_VARINT_VALUE {
                return Err(WireError::InvalidVarint(value));
            }
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Write the stream preface and flush.
pub async fn write_preface<W: AsyncWrite + Unpin>(
    writer: &mut W,
    role: Role,
    name: &str,
    room: &str,
    token: &str,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(
        MAGIC.len() + 2 + name.len() + room.len() + token.len() + 3 * MAX_VARINT_LEN as usize,
    );
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(role.as_byte());
    for field in [name, room, token] {
        put_uvarint(&mut buf, field.len() as u64);
        buf.put_slice(field.as_bytes());
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the stream preface. Magic, version or role mismatch is
/// [`WireError::BadHandshake`]; an over-long field is
/// [`WireError::FieldTooLarge`].
pub async fn read_preface<R: AsyncRead + Unpin>(
    reader: &mut R,
    limits: &PrefaceLimits,
) -> Result<Preface> {
    let mut head = [0u8; 6];
    reader.read_exact(&mut head).await?;
    if head[..4] != MAGIC || head[4] != VERSION {
        return Err(WireError::BadHandshake);
    }
    let role = Role::from_byte(head[5]).ok_or(WireError::BadHandshake)?;

    let name = read_preface_string(reader, "name", limits.max_name_bytes).await?;
    let room = read_preface_string(reader, "room", limits.max_room_bytes).await?;
    let token = read_preface_string(reader, "token", limits.max_token_bytes).await?;
    Ok(Preface {
        role,
        name,
        room,
        token,
    })
}

async fn read_preface_string<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &'static str,
    max: usize,
) -> Result<String> {
    let len = read_uvarint(reader).await?;
    if len > max as u64 {
        return Err(WireError::FieldTooLarge {
            field,
            len,
            max: max as u64,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| WireError::InvalidUtf8 { field })
}

/// Write a message header. The key must be non-empty.
pub async fn write_message_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &[u8],
    declared_size: u64,
    msg_id: u64,
) -> Result<()> {
    if key.is_empty() {
        return Err(WireError::EmptyKey);
    }
    let mut buf = BytesMut::with_capacity(key.len() + 3 * MAX_VARINT_LEN as usize);
    put_uvarint(&mut buf, key.len() as u64);
    buf.put_slice(key);
    put_uvarint(&mut buf, declared_size);
    put_uvarint(&mut buf, msg_id);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a message header, or `None` on a clean EOF between messages.
///
/// An empty key is a strong corruption signal and fails the stream; a key
/// above `max_key_bytes` likewise.
pub async fn read_message_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_key_bytes: usize,
) -> Result<Option<MessageHeader>> {
    let key_len = match try_read_uvarint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if key_len == 0 {
        return Err(WireError::EmptyKey);
    }
    if key_len > max_key_bytes as u64 {
        return Err(WireError::KeyTooLarge {
            len: key_len,
            max: max_key_bytes as u64,
        });
    }
    let mut key = vec![0u8; key_len as usize];
    reader.read_exact(&mut key).await?;
    let declared_size = read_uvarint(reader).await?;
    let msg_id = read_uvarint(reader).await?;
    Ok(Some(MessageHeader {
        key: Bytes::from(key),
        declared_size,
        msg_id,
    }))
}

/// Write one chunk frame. An empty chunk encodes as end-of-message.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> Result<()> {
    write_uvarint(writer, chunk.len() as u64).await?;
    if !chunk.is_empty() {
        writer.write_all(chunk).await?;
    }
    Ok(())
}

pub async fn write_end_of_message<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_uvarint(writer, 0).await
}

/// Read one chunk. `None` means end-of-message.
pub async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_chunk_bytes: usize,
) -> Result<Option<Bytes>> {
    let len = read_uvarint(reader).await?;
    if len == 0 {
        return Ok(None);
    }
    if len > max_chunk_bytes as u64 {
        return Err(WireError::ChunkTooLarge {
            len,
            max: max_chunk_bytes as u64,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Read and discard chunk frames up to and including end-of-message.
///
/// Chunk length caps still apply: a stream that is over the cap cannot be
/// skipped safely because frame alignment is already lost.
pub async fn discard_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_chunk_bytes: usize,
) -> Result<()> {
    loop {
        let len = read_uvarint(reader).await?;
        if len == 0 {
            return Ok(());
        }
        if len > max_chunk_bytes as u64 {
            return Err(WireError::ChunkTooLarge {
                len,
                max: max_chunk_bytes as u64,
            });
        }
        let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
        if copied < len {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof inside discarded chunk",
            )));
        }
    }
}

/// Write an ACK frame and flush.
pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W, msg_id: u64) -> Result<()> {
    let mut buf = BytesMut::with_capacity(2 * MAX_VARINT_LEN as usize);
    put_uvarint(&mut buf, FRAME_ACK);
    put_uvarint(&mut buf, msg_id);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one `(frame_type, msg_id)` pair from a consumer stream.
///
/// Callers skip frame types they do not understand so future frame kinds
/// stay wire-compatible.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u64, u64)> {
    let frame_type = read_uvarint(reader).await?;
    let msg_id = read_uvarint(reader).await?;
    Ok((frame_type, msg_id))
}
