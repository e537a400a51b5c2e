//! # fanout-presence
//!
//! Shared, eventually consistent directories used to route messages across
//! hosts:
//!
//! - [`PresenceDirectory`]: account → hosts holding a live connection
//! - [`ChannelDirectory`]: channel → subscribed accounts
//! - [`SetStore`]: the per-key set interface both sit on, with in-memory
//!   and `SQLite` implementations

#![deny(unsafe_code)]

pub mod channels;
pub mod directory;
pub mod store;

pub use channels::ChannelDirectory;
pub use directory::PresenceDirectory;
pub use store::memory::MemorySetStore;
pub use store::sqlite::{ConnectionConfig, SqliteSetStore};
pub use store::{SetStore, StoreError};
