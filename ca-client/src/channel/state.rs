//! Per-channel state kept in the context registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ChannelNotify;
use crate::dbr::DbrType;
use crate::ids::IoId;
use crate::transport::Transport;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never connected; searching or claiming.
    NeverConnected,
    /// Lost its connection; searching again.
    PreviouslyConnected,
    /// Bound to a server channel.
    Connected,
}

/// Access rights granted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessRights {
    /// Reads and subscriptions allowed.
    pub read: bool,
    /// Writes allowed.
    pub write: bool,
}

impl AccessRights {
    /// No access.
    pub const NONE: AccessRights = AccessRights {
        read: false,
        write: false,
    };

    /// Read and write access.
    pub const FULL: AccessRights = AccessRights {
        read: true,
        write: true,
    };
}

/// Server-side identity of a channel.
///
/// Held as one value so that type, count and server id are always set and
/// cleared together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerBinding {
    /// Native DBR type of the server channel.
    pub native_type: DbrType,
    /// Native element count.
    pub native_count: u32,
    /// Server channel id.
    pub sid: u32,
}

pub(crate) struct ChannelRecord {
    pub(crate) name: String,
    pub(crate) transport: Arc<dyn Transport>,
    /// Set while connected.
    pub(crate) binding: Option<ServerBinding>,
    /// Learned from a search reply, consumed by connect.
    pub(crate) search_binding: Option<ServerBinding>,
    pub(crate) access: AccessRights,
    pub(crate) previously_connected: bool,
    pub(crate) retry: u32,
    pub(crate) claim_pending: bool,
    pub(crate) event_queue: Vec<IoId>,
    pub(crate) notify: Arc<dyn ChannelNotify>,
}

impl ChannelRecord {
    pub(crate) fn new(name: String, transport: Arc<dyn Transport>, notify: Arc<dyn ChannelNotify>) -> Self {
        Self {
            name,
            transport,
            binding: None,
            search_binding: None,
            access: AccessRights::NONE,
            previously_connected: false,
            retry: 0,
            claim_pending: false,
            event_queue: Vec::new(),
            notify,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match (self.binding.is_some(), self.previously_connected) {
            (true, _) => ConnectionState::Connected,
            (false, true) => ConnectionState::PreviouslyConnected,
            (false, false) => ConnectionState::NeverConnected,
        }
    }
}
