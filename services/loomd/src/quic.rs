// QUIC accept loop: one task per connection, one per stream.
use std::sync::Arc;

use anyhow::Result;
use metrics::gauge;
use quinn::{RecvStream, SendStream};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use loom_router::StreamPair;
use loom_transport::{QuicConnection, QuicServer};
use loom_wire::Role;

use crate::dispatch::Dispatcher;

pub async fn serve(server: QuicServer, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let connection = server.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(handle_connection(Arc::new(connection), dispatcher));
    }
}

async fn handle_connection(connection: Arc<QuicConnection>, dispatcher: Arc<Dispatcher>) {
    gauge!("loom_connections", "transport" => "quic").increment(1.0);

    // One token per connection; closing the connection cancels every stream
    // task rooted on it.
    let cancel = CancellationToken::new();
    {
        let connection = Arc::clone(&connection);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            connection.closed().await;
            cancel.cancel();
        });
    }

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(_) => break,
        };
        let connection = Arc::clone(&connection);
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.child_token();
        tokio::spawn(handle_stream(dispatcher, connection, send, recv, cancel));
    }

    cancel.cancel();
    gauge!("loom_connections", "transport" => "quic").decrement(1.0);
}

async fn handle_stream(
    dispatcher: Arc<Dispatcher>,
    connection: Arc<QuicConnection>,
    send: SendStream,
    recv: RecvStream,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(recv);
    let peer_cert = connection.peer_certificate_der();
    // Bad preface or deny: drop both halves, which resets the stream.
    let Ok(preface) = dispatcher.accept(&mut reader, peer_cert.as_deref()).await else {
        return;
    };

    match preface.role {
        Role::Consumer => {
            let stream = StreamPair::new(reader, send, cancel.clone());
            dispatcher.run_consumer("quic", &preface, stream).await;
        }
        Role::Producer => {
            let remote = connection.remote_address().to_string();
            dispatcher
                .run_producer("quic", &preface, &remote, &cancel, &mut reader)
                .await;
            let mut send = send;
            let _ = send.finish();
        }
    }
}
