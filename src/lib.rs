//! Async client for Discord-style bot APIs.
//!
//! The crate is organized by transport surface:
//! - `gateway`: persistent websocket session with heartbeating and resume.
//! - `rest`: authenticated HTTP dispatcher with per-route rate limiting.
//! - `retry`: shared backoff and retry helpers.
//! - `client`: one token, both surfaces.

/// Combined REST and gateway entry point.
pub mod client;
/// Gateway session manager, heartbeat controller and wire protocol.
pub mod gateway;
/// REST dispatcher, route builder and rate limit tracking.
pub mod rest;
/// Backoff policy and retry helper used by both surfaces.
pub mod retry;

pub use client::Client;
pub use gateway::client::{GatewayClient, GatewayConnection, GatewayError, GatewayOptions};
pub use rest::client::{RestClient, RestClientOptions, RestError};
pub use rest::route::{Method, Route};
