// Transport-facing stream capability bundle.
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// The capability set the router needs from a bidirectional stream: an
/// ordered byte reader, an ordered byte writer and a cancellation signal
/// that fires when the transport tears the stream down.
///
/// Adapters construct one per accepted stream; the router never sees the
/// transport itself. Closing is expressed by shutting down the writer and
/// dropping both halves.
pub struct StreamPair {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub cancel: CancellationToken,
}

impl StreamPair {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            cancel,
        }
    }

    /// In-memory stream pair for tests: the returned `StreamPair` is the
    /// broker side, the `DuplexStream` the client side.
    pub fn duplex(buffer: usize) -> (Self, tokio::io::DuplexStream, CancellationToken) {
        let (near, far) = tokio::io::duplex(buffer);
        let (read_half, write_half) = tokio::io::split(near);
        let cancel = CancellationToken::new();
        (
            Self::new(read_half, write_half, cancel.clone()),
            far,
            cancel,
        )
    }
}
