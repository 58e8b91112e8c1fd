//! Transport boundary consumed by the channel state machine.
//!
//! The byte-level stream and datagram senders live outside this crate. The
//! client core only needs to hand them an encoded header plus payload, learn
//! the negotiated protocol revision, and keep a per-transport ordered list of
//! the channels bound to it.
//!
//! # Channel lists
//!
//! Every transport owns a [`ChannelList`]. Channels waiting for a search reply
//! sit on the datagram transport's list; connected (or claiming) channels sit on
//! the list of the stream transport that serves them. Sending a search or a
//! claim moves the channel to the tail, which gives round-robin fairness.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;

use crate::ids::ChannelId;
use crate::wire::{version, CaHeader};

mod memory;

pub use memory::{MemoryTransport, SendHook, SentRequest};

/// Errors a transport reports for a send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No buffer space; the request was not queued.
    #[error("send buffer full")]
    WouldBlock,

    /// The connection is unusable.
    #[error("transport failure: {0}")]
    Fatal(String),
}

/// A stream or datagram connection as seen by channels.
///
/// Implementations must be safe to call from both caller threads and the
/// receive thread. The client context never holds its lock across
/// `send_stream`, `send_datagram` or `disconnect_channel`.
pub trait Transport: Send + Sync {
    /// Queue a request on the stream connection.
    ///
    /// With `flush` false the transport must not block waiting for buffer
    /// space; it returns `WouldBlock` instead.
    fn send_stream(&self, header: &CaHeader, payload: &[u8], flush: bool) -> Result<(), SendError>;

    /// Send a request as a datagram.
    fn send_datagram(&self, header: &CaHeader, payload: &[u8]) -> Result<(), SendError>;

    /// Minor protocol version negotiated with the peer.
    fn minor_version(&self) -> u16;

    /// Whether the peer sends access rights messages.
    fn supports_access_rights(&self) -> bool {
        version::has_access_rights(self.minor_version())
    }

    /// Name of the remote host, for diagnostics and disconnect reports.
    fn host_name(&self) -> String;

    /// Called after a channel bound to this transport has been disconnected
    /// and removed from its channel list.
    fn disconnect_channel(&self, _cid: ChannelId) {}

    /// Channels currently bound to this transport.
    fn channel_list(&self) -> &ChannelList;

    /// Remember that a claim could not be sent for lack of buffer space.
    fn request_claim_retry(&self);

    /// Clear and return the pending claim flag.
    fn take_claim_retry(&self) -> bool;
}

/// Ordered set of channels bound to one transport.
#[derive(Debug, Default)]
pub struct ChannelList {
    order: Mutex<VecDeque<ChannelId>>,
}

impl ChannelList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a channel at the tail. A channel already present is moved.
    pub fn push_back(&self, cid: ChannelId) {
        let mut order = self.order.lock();
        order.retain(|c| *c != cid);
        order.push_back(cid);
    }

    /// Remove a channel. Returns whether it was present.
    pub fn remove(&self, cid: ChannelId) -> bool {
        let mut order = self.order.lock();
        let before = order.len();
        order.retain(|c| *c != cid);
        order.len() != before
    }

    /// Move a present channel to the tail. Absent channels are left absent.
    pub fn move_to_tail(&self, cid: ChannelId) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|c| *c == cid) {
            order.remove(pos);
            order.push_back(cid);
        }
    }

    /// Up to `n` channels from the head.
    pub fn head(&self, n: usize) -> Vec<ChannelId> {
        self.order.lock().iter().take(n).copied().collect()
    }

    /// All channels in order.
    pub fn snapshot(&self) -> Vec<ChannelId> {
        self.order.lock().iter().copied().collect()
    }

    /// Whether the channel is on this list.
    pub fn contains(&self, cid: ChannelId) -> bool {
        self.order.lock().contains(&cid)
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.order.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_to_tail_rotates() {
        let list = ChannelList::new();
        list.push_back(ChannelId(1));
        list.push_back(ChannelId(2));
        list.push_back(ChannelId(3));

        list.move_to_tail(ChannelId(1));
        assert_eq!(list.snapshot(), vec![ChannelId(2), ChannelId(3), ChannelId(1)]);
    }

    #[test]
    fn test_push_back_does_not_duplicate() {
        let list = ChannelList::new();
        list.push_back(ChannelId(1));
        list.push_back(ChannelId(2));
        list.push_back(ChannelId(1));
        assert_eq!(list.snapshot(), vec![ChannelId(2), ChannelId(1)]);
    }

    #[test]
    fn test_move_absent_is_noop() {
        let list = ChannelList::new();
        list.push_back(ChannelId(1));
        list.move_to_tail(ChannelId(9));
        assert_eq!(list.len(), 1);
        assert!(!list.contains(ChannelId(9)));
    }

    #[test]
    fn test_remove_and_head() {
        let list = ChannelList::new();
        for id in 1..=4 {
            list.push_back(ChannelId(id));
        }
        assert!(list.remove(ChannelId(2)));
        assert!(!list.remove(ChannelId(2)));
        assert_eq!(list.head(2), vec![ChannelId(1), ChannelId(3)]);
    }
}
