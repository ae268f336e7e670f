//! mailhub: remote-mailbox connectivity layer for a webmail service.
//!
//! Owns every IMAP interaction: pooled per-user sessions, folder synchronization
//! into a local cache, IDLE push listeners, and fan-out of change events to
//! connected client sockets.

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod imap;
pub mod listener;
pub mod mailbox;
pub mod model;
pub mod pool;
pub mod search;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use service::Mailhub;

/// Identifier of an already-authenticated end user, resolved upstream.
pub type UserId = std::sync::Arc<str>;
