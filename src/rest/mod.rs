//! REST surface: route construction, rate limit tracking and the dispatcher.
//!
//! - `route`: pure mapping from an operation to a path and bucket key.
//! - `ratelimit`: process-wide bucket table that gates outbound requests.
//! - `client`: authenticated HTTP dispatcher with retry and error mapping.

/// Authenticated dispatcher and endpoint helpers.
pub mod client;
/// Rate limit bucket tracker and header parsing.
pub mod ratelimit;
/// Route builder and bucket key policies.
pub mod route;
