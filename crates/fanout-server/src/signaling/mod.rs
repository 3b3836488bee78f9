//! Signaling channel: push connection registry and WebSocket handler

pub mod handler;
mod hub;

pub use hub::{Delivery, MAX_BACKLOG, SignalingHub};
