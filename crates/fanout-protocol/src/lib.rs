//! Shared protocol definitions for the fanout relay
//!
//! Session descriptions travel between browsers and the relay as base64
//! encoded JSON. The push channel wraps them in a small tagged envelope.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
