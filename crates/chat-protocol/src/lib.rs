//! Shared Protocol Definitions for Sotto
//!
//! This crate contains the identifiers and wire messages exchanged between
//! Sotto chat clients and the relay server. Every frame on the wire is one
//! JSON-encoded [`ClientRequest`] or [`ServerEvent`].

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;
