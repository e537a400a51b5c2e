//! # fanout-server
//!
//! Per-host half of the fan-out service.
//!
//! - `ConnectionRegistry`: account → live local connections
//! - `ConnectionLifecycle`: register/announce on connect, remove/retract on
//!   close, heartbeat reaping
//! - `MessageRouter`: local delivery plus one relay per remote host
//! - `InterHostTransport`: in-process bus and HTTP relay transports
//! - Axum HTTP + `WebSocket` surface with graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod health;
pub mod lease;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod transport;
pub mod websocket;

pub use config::ServerConfig;
pub use lease::spawn_lease_renewal;
pub use registry::ConnectionRegistry;
pub use router::{DeliveryReport, MessageRouter};
pub use server::{FanoutServer, bind, resolve_host_id};
pub use shutdown::ShutdownCoordinator;
pub use transport::{HttpRelayTransport, InterHostTransport, MemoryBus, spawn_relay_listener};
pub use websocket::connection::ClientConnection;
pub use websocket::lifecycle::{ConnectionLifecycle, LifecycleConfig, LifecycleState};
