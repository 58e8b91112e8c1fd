//! Client-wide context: the registry shared by every channel and I/O object.
//!
//! # Locking
//!
//! One mutex guards the id space, the channel table, the I/O table, every
//! channel's event queue and every channel's mutable fields. Two kinds of
//! threads take it: callers issuing operations, and the receive thread that
//! dispatches replies by id.
//!
//! The lock is never held across a transport send or a user notification.
//! Operations follow the same shape everywhere:
//!
//! ```text
//! lock ── validate, register I/O, build header ── unlock
//!   send (unlocked)
//!   on failure: destroy_io(id)   // by id, a no-op if a reply already won
//! ```
//!
//! Channel-list locks inside transports nest inside the context lock, never
//! the other way around.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::channel::state::ChannelRecord;
use crate::config::ClientConfig;
use crate::error::{CaError, CaResult};
use crate::ids::{ChannelId, IdSpace, IoId};
use crate::io::{IoKind, PendingIo};
use crate::transport::Transport;
use crate::wire::CaHeader;

mod dispatch;
mod search;

pub use search::SearchTimer;

/// Counters describing context activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Channels created.
    pub channels_created: u64,
    /// Search requests sent.
    pub searches_sent: u64,
    /// Claim requests sent.
    pub claims_sent: u64,
    /// Claims deferred for lack of buffer space.
    pub claims_deferred: u64,
    /// Connect transitions, reconnects included.
    pub connects: u64,
    /// Disconnect transitions.
    pub disconnects: u64,
    /// Notification I/O objects registered.
    pub ios_installed: u64,
    /// Notification I/O objects completed by a reply.
    pub ios_completed: u64,
    /// By-id destroy requests that found a live object.
    pub ios_destroyed: u64,
    /// By-id destroy requests or replies that found nothing.
    pub stale_ids: u64,
}

/// Tables and counters guarded by the context lock.
pub(crate) struct Registry {
    pub(crate) ids: IdSpace,
    pub(crate) channels: HashMap<ChannelId, ChannelRecord>,
    pub(crate) ios: HashMap<IoId, PendingIo>,
    pub(crate) read_sequence: u32,
    pub(crate) outstanding_io: u32,
    pub(crate) search_timer: SearchTimer,
    pub(crate) stats: ContextStats,
}

impl Registry {
    fn new(config: &ClientConfig) -> Self {
        Self {
            ids: IdSpace::new(),
            channels: HashMap::new(),
            ios: HashMap::new(),
            read_sequence: 0,
            outstanding_io: 0,
            search_timer: SearchTimer::new(config.search_initial_delay, config.search_max_delay),
            stats: ContextStats::default(),
        }
    }

    pub(crate) fn channel(&self, cid: ChannelId) -> CaResult<&ChannelRecord> {
        self.channels.get(&cid).ok_or(CaError::BadChannel)
    }

    pub(crate) fn channel_mut(&mut self, cid: ChannelId) -> CaResult<&mut ChannelRecord> {
        self.channels.get_mut(&cid).ok_or(CaError::BadChannel)
    }

    pub(crate) fn install_channel(&mut self, record: ChannelRecord) -> CaResult<ChannelId> {
        let cid = ChannelId(self.ids.allocate()?);
        self.channels.insert(cid, record);
        self.stats.channels_created += 1;
        Ok(cid)
    }

    /// Register an I/O object in the id table and in its channel's event queue.
    pub(crate) fn install_io(&mut self, cid: ChannelId, kind: IoKind) -> CaResult<IoId> {
        if !self.channels.contains_key(&cid) {
            return Err(CaError::BadChannel);
        }
        let ioid = IoId(self.ids.allocate()?);
        if let IoKind::ReadCopy { .. } = kind {
            self.outstanding_io += 1;
        }
        if let Some(record) = self.channels.get_mut(&cid) {
            record.event_queue.push(ioid);
        }
        self.ios.insert(ioid, PendingIo { channel: cid, kind });
        self.stats.ios_installed += 1;
        Ok(ioid)
    }

    /// Remove an I/O object from both tables. `None` if it is already gone.
    pub(crate) fn uninstall_io(&mut self, ioid: IoId) -> Option<PendingIo> {
        let pending = self.ios.remove(&ioid)?;
        if let Some(record) = self.channels.get_mut(&pending.channel) {
            record.event_queue.retain(|id| *id != ioid);
        }
        self.ids.release(ioid.0);
        if let IoKind::ReadCopy { sequence, .. } = &pending.kind {
            if *sequence == self.read_sequence {
                self.outstanding_io = self.outstanding_io.saturating_sub(1);
            }
        }
        Some(pending)
    }
}

/// Shared state of one client: configuration, datagram transport, registry.
pub struct ClientContext {
    config: ClientConfig,
    datagram: Arc<dyn Transport>,
    registry: Mutex<Registry>,
}

impl ClientContext {
    /// Create a context that searches over `datagram`.
    pub fn new(config: ClientConfig, datagram: Arc<dyn Transport>) -> Arc<Self> {
        let registry = Mutex::new(Registry::new(&config));
        Arc::new(Self {
            config,
            datagram,
            registry,
        })
    }

    /// Context configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Transport used for searches.
    pub fn datagram(&self) -> &Arc<dyn Transport> {
        &self.datagram
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Current read sequence stamp.
    pub fn read_sequence(&self) -> u32 {
        self.lock().read_sequence
    }

    /// Start a new read sequence, abandoning buffer reads from older ones.
    ///
    /// Replies for abandoned reads still tear down their objects but are not
    /// copied into the caller's buffer.
    pub fn advance_read_sequence(&self) -> u32 {
        let mut reg = self.lock();
        reg.read_sequence = reg.read_sequence.wrapping_add(1);
        reg.outstanding_io = 0;
        reg.read_sequence
    }

    /// Buffer reads of the current sequence still waiting for a reply.
    pub fn outstanding_io(&self) -> u32 {
        self.lock().outstanding_io
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Number of live notification I/O objects.
    pub fn io_count(&self) -> usize {
        self.lock().ios.len()
    }

    /// Whether `ioid` names a live notification I/O object.
    pub fn io_is_live(&self, ioid: IoId) -> bool {
        self.lock().ios.contains_key(&ioid)
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> ContextStats {
        self.lock().stats.clone()
    }

    /// Send a request for a freshly registered I/O object, destroying the
    /// object by id if the transport refuses it.
    pub(crate) fn send_or_destroy(
        &self,
        transport: &dyn Transport,
        ioid: IoId,
        header: &CaHeader,
        payload: &[u8],
    ) -> CaResult<()> {
        match transport.send_stream(header, payload, true) {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::debug!(ioid = %ioid, %error, "send failed, destroying I/O by id");
                self.destroy_io(ioid);
                Err(CaError::TransportRejected(error))
            }
        }
    }
}
