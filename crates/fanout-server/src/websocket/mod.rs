//! WebSocket connection handling.

pub mod connection;
pub mod frames;
pub mod lifecycle;
