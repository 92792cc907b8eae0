// Broker daemon entry point.
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use loom_router::RoomManager;
use loom_transport::{QuicServer, TransportConfig, ALPN};

use loomd::auth::Authorizer;
use loomd::config::{self, Transport};
use loomd::dispatch::Dispatcher;
use loomd::{admin, http, observability, quic, tls};

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();

    // Config path: first CLI argument, then $LOOM_CONFIG, then ./loom.yaml.
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LOOM_CONFIG").ok())
        .unwrap_or_else(|| "loom.yaml".to_string());
    let config = config::load(&config_path)?;

    let base = config.router_config();
    let overrides = config.room_overrides(&base);
    let rooms = Arc::new(RoomManager::new(base, overrides));
    let authorizer = Authorizer::from_config(&config.auth);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&rooms), authorizer));

    if let Some(admin_addr) = config.admin_addr()? {
        let handle = metrics_handle.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(admin_addr, handle).await {
                tracing::warn!(error = %err, "admin endpoint exited");
            }
        });
    }

    spawn_tracker_cleanup(Arc::clone(&dispatcher));
    spawn_reload_handler(config_path.clone(), Arc::clone(&rooms), Arc::clone(&dispatcher));

    let listen_addr = config.listen_addr()?;
    match config.transport {
        Transport::Quic => {
            let crypto = tls::server_tls(&config.server.tls, config.auth.mode, &[ALPN])?;
            let server = QuicServer::bind(listen_addr, crypto, &TransportConfig::default())
                .context("bind stream listener")?;
            tracing::info!(addr = %server.local_addr()?, "listening (quic)");
            tokio::select! {
                result = quic::serve(server, dispatcher) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Transport::H3 => {
            let listener = TcpListener::bind(listen_addr)
                .await
                .context("bind stream listener")?;
            tracing::info!(addr = %listener.local_addr()?, "listening (http)");
            let app = http::router(dispatcher)
                .into_make_service_with_connect_info::<SocketAddr>();
            tokio::select! {
                result = axum::serve(listener, app).into_future() => result.context("serve http")?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }
    tracing::info!("shutting down");
    Ok(())
}

// Expire stale health-tracker entries opportunistically.
fn spawn_tracker_cleanup(dispatcher: Arc<Dispatcher>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(loom_router::DEFAULT_ERROR_WINDOW);
        loop {
            ticker.tick().await;
            dispatcher.tracker().cleanup();
        }
    });
}

// SIGHUP reloads the config file: new routing limits apply to new messages,
// new auth rules to new streams. A broken file keeps the old config.
fn spawn_reload_handler(
    config_path: String,
    rooms: Arc<RoomManager>,
    dispatcher: Arc<Dispatcher>,
) {
    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "install SIGHUP handler failed");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            match config::load(&config_path) {
                Ok(next) => {
                    let base = next.router_config();
                    let overrides = next.room_overrides(&base);
                    rooms.update_config(base, overrides);
                    dispatcher.set_authorizer(Authorizer::from_config(&next.auth));
                    tracing::info!(path = %config_path, "reloaded config");
                }
                Err(err) => {
                    tracing::warn!(path = %config_path, error = %err, "reload failed");
                }
            }
        }
    });
}
