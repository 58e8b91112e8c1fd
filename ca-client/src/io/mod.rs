//! Notification I/O: one outstanding protocol exchange per object.
//!
//! Four kinds share one contract. Each object is registered under the context
//! lock, carries an [`IoId`](crate::ids::IoId) that travels as the wire
//! correlation value, and is torn down exactly once:
//!
//! | Kind | Completion | Disconnect |
//! |------|------------|------------|
//! | read | value sent through a oneshot | fails with `Disconnected` |
//! | read into buffer | value copied into a [`ReadBuffer`] if its read sequence is current | fails with `Disconnected` |
//! | write | ack sent through a oneshot | fails with `Disconnected` |
//! | subscription | every update pushed to an unbounded queue | paused, re-armed on connect |
//!
//! Teardown consumes the [`IoKind`] by value, so a second completion for the
//! same object cannot be expressed.

use tokio::sync::{mpsc, oneshot};

use crate::dbr::{DbrData, DbrType, EventMask};
use crate::error::{CaError, CaResult};
use crate::ids::ChannelId;

mod handles;

pub use handles::{Pending, PendingRead, PendingWrite, ReadBuffer, Subscription};

/// Event delivered to a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// New value from the server.
    Update(DbrData),
    /// The channel lost its connection. The subscription stays registered and
    /// is re-armed when the channel reconnects.
    Disconnected {
        /// Host the channel was connected to.
        host: String,
    },
    /// The server reported an exception, or the subscription was torn down.
    Exception(CaError),
}

/// Reply payload routed to an I/O object by the receive path.
#[derive(Debug, Clone, PartialEq)]
pub enum IoReply {
    /// Data for a read or a subscription update.
    Data(DbrData),
    /// Completion of a write.
    Ack,
}

/// Arm parameters and delivery queue of a subscription.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    pub(crate) dbr_type: DbrType,
    pub(crate) count: u32,
    pub(crate) mask: EventMask,
    pub(crate) events: mpsc::UnboundedSender<MonitorEvent>,
}

/// Per-kind payload of a notification I/O object.
#[derive(Debug)]
pub(crate) enum IoKind {
    Read(oneshot::Sender<CaResult<DbrData>>),
    ReadCopy { target: ReadBuffer, sequence: u32 },
    Write(oneshot::Sender<CaResult<()>>),
    Subscription(SubscriptionState),
}

impl IoKind {
    pub(crate) fn subscription(&self) -> Option<&SubscriptionState> {
        match self {
            IoKind::Subscription(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn is_subscription(&self) -> bool {
        matches!(self, IoKind::Subscription(_))
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            IoKind::Read(_) => "read",
            IoKind::ReadCopy { .. } => "read_copy",
            IoKind::Write(_) => "write",
            IoKind::Subscription(_) => "subscription",
        }
    }

    /// Deliver the terminal event of an object that has already been removed
    /// from the registry.
    ///
    /// `current_sequence` is the context's read sequence at removal; buffer
    /// reads stamped with an older sequence are dropped without touching the
    /// caller's buffer.
    pub(crate) fn finish(self, outcome: CaResult<IoReply>, current_sequence: u32) {
        match self {
            IoKind::Read(reply) => {
                let result = outcome.and_then(|reply| match reply {
                    IoReply::Data(data) => Ok(data),
                    IoReply::Ack => Err(CaError::Internal("read completed without data".into())),
                });
                let _ = reply.send(result);
            }
            IoKind::ReadCopy { target, sequence } => {
                if sequence != current_sequence {
                    tracing::debug!(sequence, current_sequence, "dropping reply for abandoned read");
                    return;
                }
                match outcome {
                    Ok(IoReply::Data(data)) => target.fill(data),
                    Ok(IoReply::Ack) => {
                        target.fail(CaError::Internal("read completed without data".into()))
                    }
                    Err(error) => target.fail(error),
                }
            }
            IoKind::Write(reply) => {
                let _ = reply.send(outcome.map(|_| ()));
            }
            IoKind::Subscription(state) => {
                let event = match outcome {
                    Ok(IoReply::Data(data)) => MonitorEvent::Update(data),
                    Ok(IoReply::Ack) => return,
                    Err(error) => MonitorEvent::Exception(error),
                };
                let _ = state.events.send(event);
            }
        }
    }
}

/// A registered notification I/O object.
#[derive(Debug)]
pub(crate) struct PendingIo {
    pub(crate) channel: ChannelId,
    pub(crate) kind: IoKind,
}
