//! Types and wire-protocol primitives shared by the telemon agent and server.
//!
//! The agent and the server must agree byte-for-byte on how a batch is
//! framed: JSON, then gzip, then optional RSA, then an optional HMAC header
//! computed over whatever ends up on the wire. Everything needed to produce
//! or undo one of those stages lives here.

pub mod build_info;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod retry;
pub mod signing;
pub mod types;

/// Header carrying the caller's origin address, set by a trusted proxy or by
/// the agent itself.
pub const REAL_IP_HEADER: &str = "X-Real-IP";
