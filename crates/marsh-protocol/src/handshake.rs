//! Endpoint announcement.
//!
//! The worker writes `ENDPOINT <address>` as the very first line of its
//! standard output once its listener is bound. The host reads that line to
//! learn where to connect.

use crate::error::{ProtocolError, Result};
use std::net::SocketAddr;

/// Prefix of the handshake line.
pub const ENDPOINT_PREFIX: &str = "ENDPOINT ";

/// Format the handshake line for a bound address (without trailing newline).
pub fn endpoint_line(addr: &SocketAddr) -> String {
    format!("{ENDPOINT_PREFIX}{addr}")
}

/// Check whether a line looks like a handshake line.
pub fn is_endpoint_line(line: &str) -> bool {
    line.starts_with(ENDPOINT_PREFIX)
}

/// Parse a handshake line into the announced address.
pub fn parse_endpoint_line(line: &str) -> Result<SocketAddr> {
    line.trim_end()
        .strip_prefix(ENDPOINT_PREFIX)
        .and_then(|addr| addr.trim().parse().ok())
        .ok_or_else(|| ProtocolError::InvalidEndpoint(line.to_string()))
}
