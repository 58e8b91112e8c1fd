//! Caller-side handles for outstanding notification I/O.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::MonitorEvent;
use crate::context::ClientContext;
use crate::dbr::{DbrData, DbrType, DbrValue};
use crate::error::{CaError, CaResult};
use crate::ids::{ChannelId, IoId};

/// Completion handle of a read or write with notification.
///
/// Resolves exactly once. If the object is torn down without a result (its
/// channel was destroyed) the handle yields [`CaError::Cancelled`].
#[derive(Debug)]
pub struct Pending<T> {
    id: IoId,
    reply: oneshot::Receiver<CaResult<T>>,
}

/// Handle of a read with notification.
pub type PendingRead = Pending<DbrData>;

/// Handle of a write with notification.
pub type PendingWrite = Pending<()>;

impl<T> Pending<T> {
    pub(crate) fn new(id: IoId, reply: oneshot::Receiver<CaResult<T>>) -> Self {
        Self { id, reply }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> IoId {
        self.id
    }

    /// Result if the request has completed.
    pub fn try_result(&mut self) -> Option<CaResult<T>> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CaError::Cancelled)),
        }
    }

    /// Block the current thread until the request completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_wait(self) -> CaResult<T> {
        self.reply
            .blocking_recv()
            .unwrap_or(Err(CaError::Cancelled))
    }
}

impl<T> Future for Pending<T> {
    type Output = CaResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CaError::Cancelled)))
    }
}

#[derive(Debug, Default)]
enum ReadState {
    #[default]
    Idle,
    Waiting {
        dbr_type: DbrType,
        count: u32,
    },
    Done(DbrData),
    Failed(CaError),
}

/// Caller-owned destination of a read-into-buffer request.
///
/// The buffer is shared with the in-flight request. Callers poll it, usually
/// together with [`ClientContext::outstanding_io`], to learn when every read
/// of the current sequence has landed.
#[derive(Debug, Clone, Default)]
pub struct ReadBuffer {
    slot: Arc<Mutex<ReadState>>,
}

impl ReadBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a result (value or failure) has been stored.
    pub fn is_complete(&self) -> bool {
        matches!(*self.slot.lock(), ReadState::Done(_) | ReadState::Failed(_))
    }

    /// Whether a request is waiting to fill this buffer.
    pub fn is_waiting(&self) -> bool {
        matches!(*self.slot.lock(), ReadState::Waiting { .. })
    }

    /// Outcome of the last request, once complete.
    pub fn status(&self) -> Option<CaResult<()>> {
        match &*self.slot.lock() {
            ReadState::Done(_) => Some(Ok(())),
            ReadState::Failed(error) => Some(Err(error.clone())),
            _ => None,
        }
    }

    /// Raw payload of the last successful read.
    pub fn data(&self) -> Option<DbrData> {
        match &*self.slot.lock() {
            ReadState::Done(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Decoded value of the last successful read.
    pub fn value(&self) -> Option<DbrValue> {
        self.data().and_then(|data| data.value())
    }

    pub(crate) fn begin(&self, dbr_type: DbrType, count: u32) {
        *self.slot.lock() = ReadState::Waiting { dbr_type, count };
    }

    pub(crate) fn fill(&self, data: DbrData) {
        let mut slot = self.slot.lock();
        if let ReadState::Waiting { dbr_type, count } = &*slot {
            if *dbr_type != data.dbr_type || *count != data.count {
                tracing::debug!(
                    requested_type = %dbr_type,
                    requested_count = count,
                    reply_type = %data.dbr_type,
                    reply_count = data.count,
                    "read reply differs from request"
                );
            }
        }
        *slot = ReadState::Done(data);
    }

    pub(crate) fn fail(&self, error: CaError) {
        *self.slot.lock() = ReadState::Failed(error);
    }
}

/// Handle of an armed subscription.
///
/// Dropping the handle does not cancel the subscription; it stays registered
/// with its channel until [`Subscription::cancel`] or channel destruction.
pub struct Subscription {
    ctx: Arc<ClientContext>,
    id: IoId,
    channel: ChannelId,
    events: mpsc::UnboundedReceiver<MonitorEvent>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        ctx: Arc<ClientContext>,
        id: IoId,
        channel: ChannelId,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
    ) -> Self {
        Self {
            ctx,
            id,
            channel,
            events,
        }
    }

    /// Correlation id of the subscription.
    pub fn id(&self) -> IoId {
        self.id
    }

    /// Channel the subscription is bound to.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Next queued event, without waiting.
    pub fn try_next(&mut self) -> Option<MonitorEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event. `None` once the subscription is torn down and
    /// its queue drained.
    pub async fn next(&mut self) -> Option<MonitorEvent> {
        self.events.recv().await
    }

    /// Unregister the subscription, sending a cancel request if the channel is
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the cancel request could not be sent.
    /// The subscription is unregistered either way.
    pub fn cancel(self) -> CaResult<()> {
        self.ctx.cancel_subscription(self.id)
    }
}
