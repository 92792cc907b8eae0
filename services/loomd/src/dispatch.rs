// Stream dispatcher shared by the QUIC and HTTP adapters.
//
// Per accepted stream: read the preface, authorize, then either park the
// stream in a room as a consumer or drive producer ingestion to completion.
// Protocol failures on producer streams are classified for metrics and the
// health tracker; handshake failures are closed silently since a garbage
// preface is as likely a port scan as a client bug.
use std::sync::{Arc, RwLock};

use metrics::{counter, gauge};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use loom_router::{ProducerErrorTracker, RoomManager, StreamPair};
use loom_wire as wire;
use loom_wire::Role;

use crate::auth::Authorizer;

#[derive(Debug)]
pub enum AcceptError {
    BadPreface,
    Denied,
}

pub struct Dispatcher {
    rooms: Arc<RoomManager>,
    auth: RwLock<Authorizer>,
    tracker: ProducerErrorTracker,
}

impl Dispatcher {
    pub fn new(rooms: Arc<RoomManager>, auth: Authorizer) -> Self {
        Self {
            rooms,
            auth: RwLock::new(auth),
            tracker: ProducerErrorTracker::default(),
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn tracker(&self) -> &ProducerErrorTracker {
        &self.tracker
    }

    /// Swap the authorization rules (config reload).
    pub fn set_authorizer(&self, auth: Authorizer) {
        *self.auth.write().expect("auth lock") = auth;
    }

    /// Read the preface and authorize the stream. Adapters close the stream
    /// on any error; the HTTP adapter additionally maps the variants to
    /// status codes.
    pub async fn accept<R>(
        &self,
        reader: &mut R,
        peer_cert_der: Option<&[u8]>,
    ) -> Result<wire::Preface, AcceptError>
    where
        R: AsyncRead + Unpin,
    {
        let base = self.rooms.base_config();
        let limits = wire::PrefaceLimits {
            max_name_bytes: base.max_name_bytes,
            max_room_bytes: base.max_room_bytes,
            max_token_bytes: base.max_token_bytes,
        };
        let preface = wire::read_preface(reader, &limits)
            .await
            .map_err(|_| AcceptError::BadPreface)?;

        let decision = self.auth.read().expect("auth lock").authorize(
            &preface.token,
            peer_cert_der,
            &preface.room,
            preface.role,
        );
        if !decision.allowed {
            tracing::debug!(
                room = %preface.room,
                name = %preface.name,
                role = preface.role.as_str(),
                principal = %decision.principal,
                reason = decision.reason,
                "stream denied"
            );
            return Err(AcceptError::Denied);
        }
        Ok(preface)
    }

    /// Register the stream as a consumer and park until it is torn down.
    pub async fn run_consumer(
        &self,
        transport: &'static str,
        preface: &wire::Preface,
        stream: StreamPair,
    ) {
        let labels = stream_labels(transport, preface);
        gauge!("loom_streams", &labels).increment(1.0);
        let room = self.rooms.get(&preface.room);
        let handle = room.register_consumer(&preface.name, stream);
        tracing::info!(
            room = %room.name(),
            id = handle.id(),
            name = %preface.name,
            "consumer connected"
        );
        handle.closed().await;
        gauge!("loom_streams", &labels).decrement(1.0);
    }

    /// Drive producer ingestion to completion. Returns false when the
    /// producer was rejected or its stream failed.
    pub async fn run_producer<R>(
        &self,
        transport: &'static str,
        preface: &wire::Preface,
        remote_addr: &str,
        cancel: &CancellationToken,
        reader: &mut R,
    ) -> bool
    where
        R: AsyncRead + Unpin,
    {
        let producer_key = format!("{}:{}:{}", preface.room, preface.name, remote_addr);
        if self.tracker.is_blocked(&producer_key) {
            counter!("loom_blocked_producers_total", "room" => preface.room.clone()).increment(1);
            tracing::warn!(
                room = %preface.room,
                name = %preface.name,
                addr = remote_addr,
                "rejecting blocked producer"
            );
            return false;
        }

        let labels = stream_labels(transport, preface);
        gauge!("loom_streams", &labels).increment(1.0);
        let room = self.rooms.get(&preface.room);
        let result = room.handle_producer(cancel, reader).await;
        gauge!("loom_streams", &labels).decrement(1.0);

        let Err(err) = result else {
            return true;
        };
        if err.is_protocol() {
            counter!(
                "loom_protocol_errors_total",
                "room" => preface.room.clone(),
                "error_type" => err.error_type()
            )
            .increment(1);
            if self.tracker.record_error(&producer_key) {
                counter!("loom_blocked_producers_total", "room" => preface.room.clone())
                    .increment(1);
                tracing::warn!(
                    room = %preface.room,
                    name = %preface.name,
                    addr = remote_addr,
                    "producer blocked after repeated protocol errors"
                );
            }
        }
        tracing::warn!(
            room = %preface.room,
            name = %preface.name,
            addr = remote_addr,
            error = %err,
            "producer stream error"
        );
        false
    }
}

fn stream_labels(transport: &'static str, preface: &wire::Preface) -> [(&'static str, String); 3] {
    [
        ("transport", transport.to_string()),
        ("role", preface.role.as_str().to_string()),
        ("room", preface.room.clone()),
    ]
}
