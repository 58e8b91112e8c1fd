//! # Channel Access Client Core
//!
//! Channel lifecycle and outstanding I/O tracking for a Channel Access client.
//!
//! This crate provides:
//! - **Channels**: search, claim, connect and disconnect state machine with
//!   automatic subscription re-arm on reconnect
//! - **Notification I/O**: reads, buffer reads, writes and subscriptions
//!   correlated to replies by generation-tagged id
//! - **Wire format**: the 16-byte request header and request builders
//! - **Transport boundary**: the trait the stream and datagram senders
//!   implement, plus an in-memory implementation
//!
//! The byte-level sockets and the receive loop that parses replies live
//! outside this crate. The receive loop drives the [`ClientContext`] dispatch
//! methods (`search_reply`, `connect_channel`, `complete_io`, ...) by id.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Channel handle, connection state machine and request builders.
pub mod channel;

/// Client configuration.
pub mod config;

/// Client context: registry, lock and receive-path dispatch.
pub mod context;

/// DBR type codes and payload encoding.
pub mod dbr;

/// Error types.
pub mod error;

/// Correlation ids.
pub mod ids;

/// Notification I/O objects and caller handles.
pub mod io;

/// Transport boundary.
pub mod transport;

/// Wire header and request builders.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use channel::{AccessRights, Channel, ChannelNotify, ConnectionState, NoopNotify, ServerBinding};
pub use config::ClientConfig;
pub use context::{ClientContext, ContextStats};
pub use dbr::{DbrData, DbrType, DbrValue, EventMask};
pub use error::{Access, CaError, CaResult};
pub use ids::{ChannelId, IoId};
pub use io::{IoReply, MonitorEvent, PendingRead, PendingWrite, ReadBuffer, Subscription};
pub use transport::{ChannelList, MemoryTransport, SendError, SentRequest, Transport};
pub use wire::{CaHeader, Command};
