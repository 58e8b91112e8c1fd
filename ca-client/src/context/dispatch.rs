//! Receive-path routing of I/O replies by correlation id.
//!
//! Replies find their object through the id table only. An id that is no
//! longer registered (the object completed, was cancelled, or its send failed
//! and it was destroyed) is counted and ignored.

use super::ClientContext;
use crate::error::CaError;
use crate::ids::IoId;
use crate::io::{IoReply, MonitorEvent};

impl ClientContext {
    /// Tear down an I/O object by id.
    ///
    /// Safe to call any number of times and with ids that were never issued.
    /// Returns whether a live object was destroyed. One-shot objects report
    /// [`CaError::Cancelled`] to their caller.
    pub fn destroy_io(&self, ioid: IoId) -> bool {
        let (pending, sequence) = {
            let mut reg = self.lock();
            let pending = reg.uninstall_io(ioid);
            if pending.is_some() {
                reg.stats.ios_destroyed += 1;
            } else {
                reg.stats.stale_ids += 1;
            }
            (pending, reg.read_sequence)
        };

        match pending {
            Some(pending) => {
                tracing::debug!(ioid = %ioid, kind = pending.kind.name(), "I/O destroyed");
                pending.kind.finish(Err(CaError::Cancelled), sequence);
                true
            }
            None => false,
        }
    }

    /// Route a successful reply to its I/O object.
    ///
    /// Subscriptions receive an update and stay registered. Every other kind
    /// is unregistered and completed. Returns whether the id was live.
    pub fn complete_io(&self, ioid: IoId, reply: IoReply) -> bool {
        let mut reg = self.lock();
        let Some(pending) = reg.ios.get(&ioid) else {
            reg.stats.stale_ids += 1;
            drop(reg);
            tracing::warn!(ioid = %ioid, "reply for unknown I/O id ignored");
            return false;
        };

        let subscriber = pending.kind.subscription().map(|s| s.events.clone());
        reg.stats.ios_completed += 1;
        match subscriber {
            Some(events) => {
                drop(reg);
                if let IoReply::Data(data) = reply {
                    let _ = events.send(MonitorEvent::Update(data));
                }
            }
            None => {
                let pending = reg.uninstall_io(ioid);
                let sequence = reg.read_sequence;
                drop(reg);
                if let Some(pending) = pending {
                    pending.kind.finish(Ok(reply), sequence);
                }
            }
        }
        true
    }

    /// Route a server exception to its I/O object.
    ///
    /// One-shot objects are unregistered and fail with [`CaError::Remote`];
    /// subscriptions receive an exception event and stay registered.
    pub fn io_exception(&self, ioid: IoId, status: u32, context: &str) -> bool {
        let error = CaError::Remote {
            status,
            context: context.to_string(),
        };

        let mut reg = self.lock();
        let Some(pending) = reg.ios.get(&ioid) else {
            reg.stats.stale_ids += 1;
            drop(reg);
            tracing::warn!(ioid = %ioid, status, "exception for unknown I/O id ignored");
            return false;
        };

        match pending.kind.subscription().map(|s| s.events.clone()) {
            Some(events) => {
                drop(reg);
                let _ = events.send(MonitorEvent::Exception(error));
            }
            None => {
                let pending = reg.uninstall_io(ioid);
                let sequence = reg.read_sequence;
                drop(reg);
                if let Some(pending) = pending {
                    tracing::debug!(ioid = %ioid, status, kind = pending.kind.name(), "I/O failed by server");
                    pending.kind.finish(Err(error), sequence);
                }
            }
        }
        true
    }
}
