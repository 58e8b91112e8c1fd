//! Channels: named remote data points and their connection state machine.
//!
//! A [`Channel`] is a handle. Its state (name, server binding, access rights,
//! event queue) lives in the [`ClientContext`] registry under the context lock,
//! so the receive path can drive transitions by channel id while callers keep
//! issuing operations.
//!
//! ```text
//! NeverConnected ──search reply + claim──▶ Connected ──disconnect──▶ PreviouslyConnected
//!        │                                   ▲                            │
//!        │                                   └──────── reconnect ─────────┘
//!        └────────────────────── destroy (any state) ──────────────▶ gone
//! ```

use std::sync::Arc;

use crate::context::ClientContext;
use crate::dbr::{DbrType, TYPENOTCONN};
use crate::error::{CaError, CaResult};
use crate::ids::ChannelId;

mod lifecycle;
mod ops;
pub(crate) mod state;

pub(crate) use ops::arm_request;
pub use ops::{validate_put, validate_read};
pub use state::{AccessRights, ConnectionState, ServerBinding};

/// Connection notifications delivered to the channel's owner.
///
/// Called without the context lock held, after the state change has been
/// committed. All methods default to doing nothing.
pub trait ChannelNotify: Send + Sync {
    /// The channel connected (or reconnected) to a server.
    fn connected(&self, _cid: ChannelId) {}

    /// The channel lost its connection.
    fn disconnected(&self, _cid: ChannelId) {}

    /// Access rights changed, including the revocation on disconnect.
    fn access_rights(&self, _cid: ChannelId, _rights: AccessRights) {}
}

/// Notification sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotify;

impl ChannelNotify for NoopNotify {}

/// Handle to a channel registered with a [`ClientContext`].
///
/// Dropping the handle destroys the channel.
pub struct Channel {
    ctx: Arc<ClientContext>,
    id: ChannelId,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Channel {
    /// Create a channel without connection notifications.
    ///
    /// # Errors
    ///
    /// See [`Channel::create_with_notify`].
    pub fn create(ctx: &Arc<ClientContext>, name: &str) -> CaResult<Self> {
        Self::create_with_notify(ctx, name, Arc::new(NoopNotify))
    }

    /// Create a channel and queue it for search.
    ///
    /// # Errors
    ///
    /// `StringTooLong` if the name does not fit a search datagram,
    /// `AllocationFailure` if the name or an id cannot be allocated.
    pub fn create_with_notify(
        ctx: &Arc<ClientContext>,
        name: &str,
        notify: Arc<dyn ChannelNotify>,
    ) -> CaResult<Self> {
        let id = ctx.create_channel(name, notify)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
        })
    }

    /// Local channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Context the channel belongs to.
    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    /// Channel name.
    pub fn name(&self) -> CaResult<String> {
        Ok(self.ctx.lock().channel(self.id)?.name.clone())
    }

    /// Connection state.
    pub fn state(&self) -> CaResult<ConnectionState> {
        Ok(self.ctx.lock().channel(self.id)?.state())
    }

    /// Whether the channel is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), Ok(ConnectionState::Connected))
    }

    /// Access rights currently granted.
    pub fn access_rights(&self) -> CaResult<AccessRights> {
        Ok(self.ctx.lock().channel(self.id)?.access)
    }

    /// Server binding, present only while connected.
    pub fn binding(&self) -> CaResult<Option<ServerBinding>> {
        Ok(self.ctx.lock().channel(self.id)?.binding)
    }

    /// Native DBR type, or [`TYPENOTCONN`] while disconnected.
    ///
    /// # Errors
    ///
    /// `InvalidType` if the server reported a code that does not fit the
    /// signed field, so it cannot be confused with [`TYPENOTCONN`].
    pub fn native_type(&self) -> CaResult<i16> {
        let Some(binding) = self.binding()? else {
            return Ok(TYPENOTCONN);
        };
        let code = binding.native_type.code();
        i16::try_from(code).map_err(|_| CaError::InvalidType { dbr_type: code })
    }

    /// Native DBR type while connected.
    pub fn native_dbr_type(&self) -> CaResult<Option<DbrType>> {
        Ok(self.binding()?.map(|b| b.native_type))
    }

    /// Native element count, or zero while disconnected.
    pub fn native_element_count(&self) -> CaResult<u32> {
        Ok(self.binding()?.map_or(0, |b| b.native_count))
    }

    /// Server channel id while connected.
    pub fn server_id(&self) -> CaResult<Option<u32>> {
        Ok(self.binding()?.map(|b| b.sid))
    }

    /// Counted search attempts, capped at the configured maximum.
    pub fn search_attempts(&self) -> CaResult<u32> {
        Ok(self.ctx.lock().channel(self.id)?.retry)
    }

    /// Whether the channel is waiting on the search transport.
    pub fn is_searching(&self) -> CaResult<bool> {
        let transport = Arc::clone(&self.ctx.lock().channel(self.id)?.transport);
        Ok(std::ptr::addr_eq(
            Arc::as_ptr(&transport),
            Arc::as_ptr(self.ctx.datagram()),
        ))
    }

    /// Host serving the channel, or the search transport's name while
    /// searching.
    pub fn host_name(&self) -> CaResult<String> {
        let transport = Arc::clone(&self.ctx.lock().channel(self.id)?.transport);
        Ok(transport.host_name())
    }

    /// Number of outstanding I/O objects bound to the channel.
    pub fn pending_io(&self) -> CaResult<usize> {
        Ok(self.ctx.lock().channel(self.id)?.event_queue.len())
    }

    /// Destroy the channel. Calling it again, or dropping the handle
    /// afterwards, is a no-op.
    pub fn destroy(&self) {
        self.ctx.destroy_channel(self.id);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.ctx.destroy_channel(self.id);
    }
}
