//! Channel state transitions driven by callers and by the receive path.

use std::sync::Arc;

use super::state::{AccessRights, ChannelRecord, ServerBinding};
use super::{arm_request, ChannelNotify};
use crate::context::ClientContext;
use crate::dbr::DbrType;
use crate::error::{CaError, CaResult};
use crate::ids::{ChannelId, IoId};
use crate::io::{IoKind, MonitorEvent};
use crate::transport::{SendError, Transport};
use crate::wire::{self, version, HEADER_SIZE, MAX_WIRE_FIELD};

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn wire_len(payload: &[u8]) -> CaResult<u16> {
    u16::try_from(payload.len()).map_err(|_| CaError::StringTooLong)
}

impl ClientContext {
    /// Register a channel and queue it for search.
    pub(crate) fn create_channel(
        &self,
        name: &str,
        notify: Arc<dyn ChannelNotify>,
    ) -> CaResult<ChannelId> {
        let limit = self
            .config()
            .max_datagram_size
            .saturating_sub(HEADER_SIZE)
            .min(MAX_WIRE_FIELD as usize);
        if name.len() + 1 > limit {
            return Err(CaError::StringTooLong);
        }

        let mut owned = String::new();
        owned
            .try_reserve_exact(name.len())
            .map_err(|_| CaError::AllocationFailure)?;
        owned.push_str(name);

        let record = ChannelRecord::new(owned, Arc::clone(self.datagram()), notify);
        let cid = {
            let mut reg = self.lock();
            let cid = reg.install_channel(record)?;
            self.datagram().channel_list().push_back(cid);
            reg.search_timer.reset();
            cid
        };
        tracing::debug!(cid = %cid, channel = name, "channel created");
        Ok(cid)
    }

    /// Send one search request for a channel waiting on the datagram transport.
    ///
    /// # Errors
    ///
    /// `Internal` if the channel is bound to a stream transport, or the
    /// transport error if the datagram could not be sent. A failed send does
    /// not count as an attempt.
    pub fn search_channel(&self, cid: ChannelId) -> CaResult<()> {
        let (header, payload) = {
            let reg = self.lock();
            let record = reg.channel(cid)?;
            if !same_transport(&record.transport, self.datagram()) {
                return Err(CaError::Internal(format!(
                    "search requested for channel {cid} bound to a stream transport"
                )));
            }
            let payload = wire::name_payload(&record.name);
            let header = wire::search(cid, wire_len(&payload)?, self.config().minor_version);
            (header, payload)
        };

        self.datagram().send_datagram(&header, &payload)?;

        let mut reg = self.lock();
        let max = self.config().max_search_tries;
        if let Ok(record) = reg.channel_mut(cid) {
            if record.retry < max {
                record.retry += 1;
            }
            self.datagram().channel_list().move_to_tail(cid);
        }
        reg.stats.searches_sent += 1;
        tracing::trace!(cid = %cid, "search sent");
        Ok(())
    }

    /// Record a search reply and start the claim on `stream`.
    ///
    /// The channel moves from the datagram transport's list to the stream's
    /// list. It is not connected until the claim completes. Replies for
    /// channels that are connected or already claiming are ignored.
    pub fn search_reply(
        &self,
        cid: ChannelId,
        sid: u32,
        native_type: DbrType,
        native_count: u32,
        stream: Arc<dyn Transport>,
    ) -> bool {
        {
            let mut reg = self.lock();
            let Some(record) = reg.channels.get_mut(&cid) else {
                reg.stats.stale_ids += 1;
                drop(reg);
                tracing::warn!(cid = %cid, "search reply for unknown channel ignored");
                return false;
            };
            if record.binding.is_some() || !same_transport(&record.transport, self.datagram()) {
                tracing::debug!(cid = %cid, "duplicate search reply ignored");
                return false;
            }

            record.search_binding = Some(ServerBinding {
                native_type,
                native_count,
                sid,
            });
            record.transport = Arc::clone(&stream);
            record.claim_pending = true;
            self.datagram().channel_list().remove(cid);
            stream.channel_list().push_back(cid);
        }

        tracing::debug!(cid = %cid, sid, host = %stream.host_name(), "search reply");
        self.claim_channel(cid);
        true
    }

    /// Send the claim for a channel with a pending claim.
    ///
    /// The claim is sent without waiting for buffer space. If the transport
    /// cannot take it, the claim stays pending and the transport is asked to
    /// retry through [`ClientContext::flush_claims`]. Peers without connect
    /// confirmation are connected as soon as the claim is sent.
    ///
    /// Returns whether a claim was sent.
    pub fn claim_channel(&self, cid: ChannelId) -> bool {
        let (transport, header, payload, binding) = {
            let mut reg = self.lock();
            let Some(record) = reg.channels.get_mut(&cid) else {
                return false;
            };
            if !std::mem::take(&mut record.claim_pending) || record.binding.is_some() {
                return false;
            }
            let Some(binding) = record.search_binding else {
                return false;
            };

            let peer_minor = record.transport.minor_version();
            let payload = if version::claims_by_name(peer_minor) {
                wire::name_payload(&record.name)
            } else {
                Vec::new()
            };
            let Ok(len) = wire_len(&payload) else {
                return false;
            };
            let header = wire::claim(cid, binding.sid, len, peer_minor, self.config().minor_version);
            (Arc::clone(&record.transport), header, payload, binding)
        };

        match transport.send_stream(&header, &payload, false) {
            Ok(()) => {
                self.lock().stats.claims_sent += 1;
                transport.channel_list().move_to_tail(cid);
                tracing::debug!(cid = %cid, sid = binding.sid, "claim sent");
                if !version::has_connect_confirmation(transport.minor_version()) {
                    self.connect_on(
                        cid,
                        binding.native_type,
                        binding.native_count,
                        binding.sid,
                        Some(&transport),
                    );
                }
                true
            }
            Err(error) => {
                {
                    let mut reg = self.lock();
                    if let Ok(record) = reg.channel_mut(cid) {
                        if same_transport(&record.transport, &transport) && record.binding.is_none() {
                            record.claim_pending = true;
                        }
                    }
                    reg.stats.claims_deferred += 1;
                }
                transport.request_claim_retry();
                match error {
                    SendError::WouldBlock => tracing::debug!(cid = %cid, "claim deferred"),
                    SendError::Fatal(reason) => {
                        tracing::warn!(cid = %cid, %reason, "claim send failed, deferred")
                    }
                }
                false
            }
        }
    }

    /// Retry deferred claims on `transport`, in channel-list order.
    ///
    /// Stops at the first claim that is deferred again. Returns the number of
    /// claims sent.
    pub fn flush_claims(&self, transport: &dyn Transport) -> usize {
        if !transport.take_claim_retry() {
            return 0;
        }

        let mut sent = 0;
        for cid in transport.channel_list().snapshot() {
            let pending = self
                .lock()
                .channels
                .get(&cid)
                .is_some_and(|record| record.claim_pending);
            if !pending {
                continue;
            }
            if !self.claim_channel(cid) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Mark a channel connected and re-arm its subscriptions.
    ///
    /// Only a channel whose search reply bound it to a stream transport can
    /// connect. A confirmation for a channel that is already connected, or one
    /// that is back on the search transport, is logged and ignored. Returns
    /// whether the channel transitioned.
    pub fn connect_channel(
        &self,
        cid: ChannelId,
        native_type: DbrType,
        native_count: u32,
        sid: u32,
    ) -> bool {
        self.connect_on(cid, native_type, native_count, sid, None)
    }

    /// Connect, requiring the channel to still be bound to `claimed_on` when
    /// given.
    fn connect_on(
        &self,
        cid: ChannelId,
        native_type: DbrType,
        native_count: u32,
        sid: u32,
        claimed_on: Option<&Arc<dyn Transport>>,
    ) -> bool {
        let (notify, synthesized, transport, arms) = {
            let mut reg = self.lock();
            let Some(record) = reg.channels.get_mut(&cid) else {
                reg.stats.stale_ids += 1;
                drop(reg);
                tracing::warn!(cid = %cid, "connect for unknown channel ignored");
                return false;
            };
            if let Some(current) = record.binding {
                tracing::warn!(cid = %cid, sid, current_sid = current.sid, "ignored connect for connected channel");
                return false;
            }
            let claiming = record.search_binding.is_some()
                && !same_transport(&record.transport, self.datagram())
                && claimed_on.map_or(true, |t| same_transport(&record.transport, t));
            if !claiming {
                tracing::warn!(cid = %cid, sid, "ignored connect for channel without a claim in progress");
                return false;
            }

            let binding = ServerBinding {
                native_type,
                native_count,
                sid,
            };
            record.binding = Some(binding);
            record.search_binding = None;
            record.claim_pending = false;
            record.previously_connected = true;
            let synthesized = !record.transport.supports_access_rights();
            if synthesized {
                record.access = AccessRights::FULL;
            }
            let notify = Arc::clone(&record.notify);
            let transport = Arc::clone(&record.transport);
            let queue = record.event_queue.clone();

            let arms: Vec<_> = queue
                .into_iter()
                .filter_map(|ioid| {
                    let state = reg.ios.get(&ioid)?.kind.subscription()?;
                    Some((ioid, arm_request(binding, state.dbr_type, state.count, state.mask, ioid)))
                })
                .collect();
            reg.stats.connects += 1;
            (notify, synthesized, transport, arms)
        };

        tracing::debug!(cid = %cid, sid, native_type = %native_type, native_count, "channel connected");
        if synthesized {
            notify.access_rights(cid, AccessRights::FULL);
        }
        notify.connected(cid);

        for (ioid, (header, block)) in arms {
            match transport.send_stream(&header, &block, true) {
                Ok(()) => tracing::debug!(cid = %cid, ioid = %ioid, "subscription armed"),
                Err(error) => {
                    tracing::warn!(cid = %cid, ioid = %ioid, %error, "subscription arm failed")
                }
            }
        }
        true
    }

    /// Apply an access rights message from the server.
    pub fn access_rights_changed(&self, cid: ChannelId, rights: AccessRights) -> bool {
        let notify = {
            let mut reg = self.lock();
            let Some(record) = reg.channels.get_mut(&cid) else {
                return false;
            };
            record.access = rights;
            Arc::clone(&record.notify)
        };
        tracing::debug!(cid = %cid, read = rights.read, write = rights.write, "access rights changed");
        notify.access_rights(cid, rights);
        true
    }

    /// Disconnect a channel from its stream transport and return it to search.
    ///
    /// Reads and writes outstanding on the channel fail with
    /// [`CaError::Disconnected`] and are torn down. Subscriptions receive a
    /// disconnect event and stay registered for re-arm. The owner's disconnect
    /// and access-rights notifications follow, then the old transport is told
    /// the channel is gone.
    pub fn disconnect_channel(&self, cid: ChannelId) -> bool {
        let (notify, old_transport, host, was_connected, torn_down, subscribers, sequence) = {
            let mut reg = self.lock();
            let Some(record) = reg.channels.get_mut(&cid) else {
                return false;
            };
            if same_transport(&record.transport, self.datagram()) {
                return false;
            }

            let was_connected = record.binding.take().is_some();
            record.search_binding = None;
            record.access = AccessRights::NONE;
            record.claim_pending = false;
            record.retry = 0;
            let old_transport = std::mem::replace(&mut record.transport, Arc::clone(self.datagram()));
            let host = old_transport.host_name();
            let notify = Arc::clone(&record.notify);
            let queue = record.event_queue.clone();

            let mut torn_down: Vec<IoKind> = Vec::new();
            let mut subscribers = Vec::new();
            for ioid in queue {
                let Some(pending) = reg.ios.get(&ioid) else {
                    continue;
                };
                match pending.kind.subscription().map(|s| s.events.clone()) {
                    Some(events) => subscribers.push(events),
                    None => torn_down.extend(reg.uninstall_io(ioid).map(|p| p.kind)),
                }
            }

            old_transport.channel_list().remove(cid);
            self.datagram().channel_list().push_back(cid);
            reg.search_timer.reset();
            reg.stats.disconnects += 1;
            let sequence = reg.read_sequence;
            (notify, old_transport, host, was_connected, torn_down, subscribers, sequence)
        };

        tracing::debug!(cid = %cid, %host, torn_down = torn_down.len(), "channel disconnected");
        for kind in torn_down {
            kind.finish(Err(CaError::Disconnected { host: host.clone() }), sequence);
        }
        for events in subscribers {
            let _ = events.send(MonitorEvent::Disconnected { host: host.clone() });
        }
        if was_connected {
            notify.disconnected(cid);
            notify.access_rights(cid, AccessRights::NONE);
        }
        old_transport.disconnect_channel(cid);
        true
    }

    /// Destroy a channel and every I/O object bound to it.
    ///
    /// A connected channel sends a clear-channel request first; failure to
    /// send it does not stop the teardown. Safe to call for ids that are
    /// already destroyed.
    pub fn destroy_channel(&self, cid: ChannelId) -> bool {
        let clear = {
            let reg = self.lock();
            let Ok(record) = reg.channel(cid) else {
                return false;
            };
            record
                .binding
                .map(|binding| (Arc::clone(&record.transport), wire::clear_channel(cid, binding.sid)))
        };
        if let Some((transport, header)) = clear {
            if let Err(error) = transport.send_stream(&header, &[], true) {
                tracing::warn!(cid = %cid, %error, "clear channel request not sent");
            }
        }

        let (record, torn_down, sequence) = {
            let mut reg = self.lock();
            let Some(record) = reg.channels.remove(&cid) else {
                return false;
            };
            let torn_down: Vec<(IoId, IoKind)> = record
                .event_queue
                .iter()
                .filter_map(|ioid| reg.uninstall_io(*ioid).map(|p| (*ioid, p.kind)))
                .collect();
            reg.ids.release(cid.0);
            record.transport.channel_list().remove(cid);
            (record, torn_down, reg.read_sequence)
        };

        tracing::debug!(cid = %cid, channel = %record.name, torn_down = torn_down.len(), "channel destroyed");
        for (ioid, kind) in torn_down {
            tracing::trace!(ioid = %ioid, kind = kind.name(), "I/O torn down with channel");
            kind.finish(Err(CaError::Cancelled), sequence);
        }
        true
    }
}
