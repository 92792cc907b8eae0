// HTTP stream adapter: `POST /stream` carries producer bytes in the request
// body and consumer bytes in the streaming response body. The core sees the
// same StreamPair as on the QUIC binding; only the framing of bytes into a
// connection differs.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::TryStreamExt;
use metrics::gauge;
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use loom_router::StreamPair;
use loom_wire::Role;

use crate::dispatch::{AcceptError, Dispatcher};

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/stream", post(stream_handler))
        .with_state(dispatcher)
}

async fn stream_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    gauge!("loom_connections", "transport" => "h3").increment(1.0);
    let response = handle_stream(dispatcher, remote, request).await;
    gauge!("loom_connections", "transport" => "h3").decrement(1.0);
    response
}

async fn handle_stream(
    dispatcher: Arc<Dispatcher>,
    remote: SocketAddr,
    request: axum::extract::Request,
) -> Response {
    let body = request.into_body();
    let mut reader = BufReader::new(StreamReader::new(
        body.into_data_stream().map_err(std::io::Error::other),
    ));

    // TLS terminates in front of this adapter, so there is no peer
    // certificate to hand to the authorizer here.
    let preface = match dispatcher.accept(&mut reader, None).await {
        Ok(preface) => preface,
        Err(AcceptError::BadPreface) => return StatusCode::BAD_REQUEST.into_response(),
        Err(AcceptError::Denied) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    match preface.role {
        Role::Producer => {
            let cancel = CancellationToken::new();
            let clean = dispatcher
                .run_producer("h3", &preface, &remote.to_string(), &cancel, &mut reader)
                .await;
            if clean {
                StatusCode::OK.into_response()
            } else {
                StatusCode::BAD_REQUEST.into_response()
            }
        }
        Role::Consumer => {
            // The room writes into one end of an in-memory pipe; the other
            // end streams out as the response body. Dropping the response
            // tears the pipe and with it the consumer.
            let (broker_side, response_side) = tokio::io::duplex(64 * 1024);
            let cancel = CancellationToken::new();
            let stream = StreamPair::new(reader, broker_side, cancel);
            tokio::spawn(async move {
                dispatcher.run_consumer("h3", &preface, stream).await;
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(ReaderStream::new(response_side)))
                .expect("build streaming response")
        }
    }
}
