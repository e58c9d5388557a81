//! Gateway surface: the persistent event connection.
//!
//! - `proto`: frames, opcodes and close codes.
//! - `session`: session id, sequence and resume endpoint.
//! - `heartbeat`: liveness loop with zombie detection.
//! - `client`: connection worker with resume and reconnect.

/// Session manager, connection handle and gateway errors.
pub mod client;
/// Heartbeat controller task.
pub mod heartbeat;
/// Gateway wire frames.
pub mod proto;
/// Session state shared across reconnects.
pub mod session;
