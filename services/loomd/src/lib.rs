//! Broker daemon library crate.
//!
//! Exposes the daemon's subsystems (config, auth, dispatch, transport
//! adapters, admin endpoint) for the `loomd` binary and integration tests.
pub mod admin;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod observability;
pub mod quic;
pub mod tls;
