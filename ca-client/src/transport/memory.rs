//! In-memory transport that records requests instead of sending them.
//!
//! Send outcomes can be scripted: a queue of one-shot failures, plus a
//! backpressure switch under which non-flushing stream sends report
//! `WouldBlock`, the way a full socket buffer does. A send hook runs after
//! each recorded request with no transport lock held, so tests can inject
//! receive-path events into the window between a send and its follow-up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use parking_lot::Mutex;

use super::{ChannelList, SendError, Transport};
use crate::ids::ChannelId;
use crate::wire::CaHeader;

/// A request captured by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    /// Header as handed to the transport.
    pub header: CaHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Whether it went out as a datagram.
    pub datagram: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    sent: Vec<SentRequest>,
    scripted_failures: VecDeque<SendError>,
    disconnected: Vec<ChannelId>,
}

/// Callback run after a request has been recorded.
pub type SendHook = Arc<dyn Fn(&CaHeader) + Send + Sync>;

/// Transport backed by memory.
pub struct MemoryTransport {
    host: String,
    minor_version: AtomicU16,
    backpressure: AtomicBool,
    claim_retry: AtomicBool,
    channels: ChannelList,
    state: Mutex<MemoryState>,
    hook: Mutex<Option<SendHook>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("host", &self.host)
            .field("minor_version", &self.minor_version)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Create a transport reporting `host` and negotiating `minor_version`.
    pub fn new(host: impl Into<String>, minor_version: u16) -> Self {
        Self {
            host: host.into(),
            minor_version: AtomicU16::new(minor_version),
            backpressure: AtomicBool::new(false),
            claim_retry: AtomicBool::new(false),
            channels: ChannelList::new(),
            state: Mutex::new(MemoryState::default()),
            hook: Mutex::new(None),
        }
    }

    /// Run `hook` after every successfully recorded send.
    pub fn on_send(&self, hook: impl Fn(&CaHeader) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Remove the send hook.
    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }

    /// Change the negotiated minor version.
    pub fn set_minor_version(&self, minor_version: u16) {
        self.minor_version.store(minor_version, Ordering::SeqCst);
    }

    /// Make non-flushing stream sends fail with `WouldBlock`.
    pub fn set_backpressure(&self, on: bool) {
        self.backpressure.store(on, Ordering::SeqCst);
    }

    /// Fail the next send of any kind with `error`.
    pub fn fail_next(&self, error: SendError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    /// Every request sent so far.
    pub fn sent(&self) -> Vec<SentRequest> {
        self.state.lock().sent.clone()
    }

    /// Requests whose command code matches `command`.
    pub fn sent_with_command(&self, command: u16) -> Vec<SentRequest> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|r| r.header.command == command)
            .cloned()
            .collect()
    }

    /// Forget recorded requests.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Channels reported through `disconnect_channel`.
    pub fn disconnected(&self) -> Vec<ChannelId> {
        self.state.lock().disconnected.clone()
    }

    /// Whether a deferred claim is waiting for buffer space.
    pub fn claim_retry_pending(&self) -> bool {
        self.claim_retry.load(Ordering::SeqCst)
    }

    fn record(&self, header: &CaHeader, payload: &[u8], datagram: bool) -> Result<(), SendError> {
        {
            let mut state = self.state.lock();
            if let Some(error) = state.scripted_failures.pop_front() {
                return Err(error);
            }
            state.sent.push(SentRequest {
                header: *header,
                payload: payload.to_vec(),
                datagram,
            });
        }
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(header);
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn send_stream(&self, header: &CaHeader, payload: &[u8], flush: bool) -> Result<(), SendError> {
        if !flush && self.backpressure.load(Ordering::SeqCst) {
            return Err(SendError::WouldBlock);
        }
        self.record(header, payload, false)
    }

    fn send_datagram(&self, header: &CaHeader, payload: &[u8]) -> Result<(), SendError> {
        self.record(header, payload, true)
    }

    fn minor_version(&self) -> u16 {
        self.minor_version.load(Ordering::SeqCst)
    }

    fn host_name(&self) -> String {
        self.host.clone()
    }

    fn disconnect_channel(&self, cid: ChannelId) {
        self.state.lock().disconnected.push(cid);
    }

    fn channel_list(&self) -> &ChannelList {
        &self.channels
    }

    fn request_claim_retry(&self) {
        self.claim_retry.store(true, Ordering::SeqCst);
    }

    fn take_claim_retry(&self) -> bool {
        self.claim_retry.swap(false, Ordering::SeqCst)
    }
}
