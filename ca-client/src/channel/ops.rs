//! Read, write and subscribe requests.
//!
//! Every operation validates, registers its I/O object and builds its header
//! under one lock section, then sends unlocked. A failed send destroys the
//! object by id, since a reply may already have torn it down.
//!
//! Validation reports the first failing check, in this order:
//!
//! 1. connected
//! 2. recognized type (plain only, for writes)
//! 3. access right
//! 4. element count
//! 5. string terminators (string writes)
//! 6. payload size

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::state::{AccessRights, ServerBinding};
use super::Channel;
use crate::context::ClientContext;
use crate::dbr::{DbrType, DbrValue, EventMask, MAX_STRING_SIZE};
use crate::error::{Access, CaError, CaResult};
use crate::ids::IoId;
use crate::io::{IoKind, Pending, PendingRead, PendingWrite, ReadBuffer, Subscription, SubscriptionState};
use crate::wire::{self, version, CaHeader, Command, MAX_WIRE_FIELD, MONITOR_BLOCK_SIZE, NO_COMPLETION_ID};

/// Validate a read request and resolve its wire element count.
///
/// Reads accept compound types. A count of zero means the native count.
///
/// # Errors
///
/// `NotConnected`, `InvalidType`, `AccessDenied` or `CountOutOfRange`, the
/// first that applies.
pub fn validate_read(
    binding: Option<ServerBinding>,
    access: AccessRights,
    dbr_type: DbrType,
    count: u32,
) -> CaResult<(ServerBinding, u16)> {
    let binding = binding.ok_or(CaError::NotConnected)?;
    if !dbr_type.is_valid() {
        return Err(CaError::InvalidType {
            dbr_type: dbr_type.code(),
        });
    }
    if !access.read {
        return Err(CaError::AccessDenied {
            access: Access::Read,
        });
    }
    let resolved = if count == 0 { binding.native_count } else { count };
    if count > binding.native_count || resolved > MAX_WIRE_FIELD {
        return Err(CaError::CountOutOfRange {
            requested: count,
            native: binding.native_count,
        });
    }
    Ok((binding, resolved as u16))
}

/// Validate a write request and compute its wire count and payload size.
///
/// Single-element string writes are sized to the string plus terminator;
/// everything else uses the fixed element size.
///
/// # Errors
///
/// `NotConnected`, `InvalidType`, `AccessDenied`, `CountOutOfRange`,
/// `StringTooLong`, `ValueTooLarge` or `ValueTooShort`, the first that
/// applies.
pub fn validate_put(
    binding: Option<ServerBinding>,
    access: AccessRights,
    dbr_type: DbrType,
    count: u32,
    value: &[u8],
) -> CaResult<(ServerBinding, u16, u16)> {
    let binding = binding.ok_or(CaError::NotConnected)?;
    if !dbr_type.is_valid() || dbr_type.is_compound() {
        return Err(CaError::InvalidType {
            dbr_type: dbr_type.code(),
        });
    }
    if !access.write {
        return Err(CaError::AccessDenied {
            access: Access::Write,
        });
    }
    if count == 0 || count > binding.native_count || count > MAX_WIRE_FIELD {
        return Err(CaError::CountOutOfRange {
            requested: count,
            native: binding.native_count,
        });
    }

    if dbr_type == DbrType::STRING {
        for index in 0..count as usize {
            let start = index * MAX_STRING_SIZE;
            if start >= value.len() {
                break;
            }
            let end = value.len().min(start + MAX_STRING_SIZE);
            if !value[start..end].contains(&0) {
                return Err(CaError::StringTooLong);
            }
        }
    }

    let size = match (dbr_type, count) {
        (DbrType::STRING, 1) => {
            let slot = &value[..value.len().min(MAX_STRING_SIZE)];
            slot.iter().position(|b| *b == 0).map_or(MAX_STRING_SIZE, |len| len + 1)
        }
        _ => dbr_type.size_n(count).ok_or(CaError::InvalidType {
            dbr_type: dbr_type.code(),
        })?,
    };
    if size > MAX_WIRE_FIELD as usize {
        return Err(CaError::ValueTooLarge { size });
    }
    if value.len() < size {
        return Err(CaError::ValueTooShort {
            needed: size,
            have: value.len(),
        });
    }
    Ok((binding, count as u16, size as u16))
}

/// Arm request for a subscription on a connected channel.
///
/// A count of zero, or one above the native count, subscribes to the native
/// count.
pub(crate) fn arm_request(
    binding: ServerBinding,
    dbr_type: DbrType,
    count: u32,
    mask: EventMask,
    ioid: IoId,
) -> (CaHeader, [u8; MONITOR_BLOCK_SIZE]) {
    let count = if count == 0 || count > binding.native_count {
        binding.native_count
    } else {
        count
    };
    let count = count.min(MAX_WIRE_FIELD) as u16;
    wire::event_add(dbr_type, count, binding.sid, ioid, mask)
}

impl Channel {
    /// Read with notification.
    ///
    /// # Errors
    ///
    /// Validation errors per [`validate_read`]; `TransportRejected` if the
    /// request could not be sent, in which case no I/O object remains.
    pub fn read(&self, dbr_type: DbrType, count: u32) -> CaResult<PendingRead> {
        let (tx, rx) = oneshot::channel();
        let (transport, header, ioid) = {
            let mut reg = self.ctx.lock();
            let record = reg.channel(self.id)?;
            let (binding, count) = validate_read(record.binding, record.access, dbr_type, count)?;
            let transport = Arc::clone(&record.transport);
            let ioid = reg.install_io(self.id, IoKind::Read(tx))?;
            let header = wire::read(Command::ReadNotify, dbr_type, count, binding.sid, ioid);
            (transport, header, ioid)
        };

        self.ctx.send_or_destroy(transport.as_ref(), ioid, &header, &[])?;
        tracing::trace!(cid = %self.id, ioid = %ioid, "read sent");
        Ok(Pending::new(ioid, rx))
    }

    /// Read into a caller-owned buffer, stamped with the current read
    /// sequence.
    ///
    /// The reply is copied into `buffer` only if the read sequence has not
    /// advanced in the meantime.
    ///
    /// # Errors
    ///
    /// As for [`Channel::read`].
    pub fn read_into(&self, dbr_type: DbrType, count: u32, buffer: &ReadBuffer) -> CaResult<IoId> {
        let (transport, header, ioid) = {
            let mut reg = self.ctx.lock();
            let record = reg.channel(self.id)?;
            let (binding, count) = validate_read(record.binding, record.access, dbr_type, count)?;
            let transport = Arc::clone(&record.transport);
            let sequence = reg.read_sequence;
            let ioid = reg.install_io(
                self.id,
                IoKind::ReadCopy {
                    target: buffer.clone(),
                    sequence,
                },
            )?;
            buffer.begin(dbr_type, u32::from(count));
            let header = wire::read(Command::Read, dbr_type, count, binding.sid, ioid);
            (transport, header, ioid)
        };

        self.ctx.send_or_destroy(transport.as_ref(), ioid, &header, &[])?;
        Ok(ioid)
    }

    /// Write without completion notification.
    ///
    /// `value` holds `count` elements in network byte order.
    ///
    /// # Errors
    ///
    /// Validation errors per [`validate_put`], or `TransportRejected`.
    pub fn write(&self, dbr_type: DbrType, count: u32, value: &[u8]) -> CaResult<()> {
        let (transport, header, size) = {
            let reg = self.ctx.lock();
            let record = reg.channel(self.id)?;
            let (binding, count, size) =
                validate_put(record.binding, record.access, dbr_type, count, value)?;
            let header = wire::write(Command::Write, dbr_type, count, size, binding.sid, NO_COMPLETION_ID);
            (Arc::clone(&record.transport), header, size)
        };

        transport.send_stream(&header, &value[..usize::from(size)], true)?;
        Ok(())
    }

    /// Write with completion notification.
    ///
    /// # Errors
    ///
    /// `NotConnected`, then `UnsupportedByPeer` if the server predates write
    /// notification, then the remaining checks of [`validate_put`]. On
    /// `TransportRejected` no I/O object remains.
    pub fn write_notify(&self, dbr_type: DbrType, count: u32, value: &[u8]) -> CaResult<PendingWrite> {
        let (tx, rx) = oneshot::channel();
        let (transport, header, size, ioid) = {
            let mut reg = self.ctx.lock();
            let record = reg.channel(self.id)?;
            if record.binding.is_none() {
                return Err(CaError::NotConnected);
            }
            let minor_version = record.transport.minor_version();
            if !version::has_write_notify(minor_version) {
                return Err(CaError::UnsupportedByPeer {
                    feature: "write notify",
                    minor_version,
                });
            }
            let (binding, count, size) =
                validate_put(record.binding, record.access, dbr_type, count, value)?;
            let transport = Arc::clone(&record.transport);
            let ioid = reg.install_io(self.id, IoKind::Write(tx))?;
            let header =
                wire::write(Command::WriteNotify, dbr_type, count, size, binding.sid, ioid.as_u32());
            (transport, header, size, ioid)
        };

        self.ctx
            .send_or_destroy(transport.as_ref(), ioid, &header, &value[..usize::from(size)])?;
        tracing::trace!(cid = %self.id, ioid = %ioid, "write notify sent");
        Ok(Pending::new(ioid, rx))
    }

    /// Write a typed value without completion notification.
    pub fn write_value(&self, value: &DbrValue) -> CaResult<()> {
        self.write(value.dbr_type(), value.count(), &value.encode())
    }

    /// Write a typed value with completion notification.
    pub fn write_value_notify(&self, value: &DbrValue) -> CaResult<PendingWrite> {
        self.write_notify(value.dbr_type(), value.count(), &value.encode())
    }

    /// Subscribe to value changes.
    ///
    /// The subscription is registered even while disconnected and is armed on
    /// every connect. A count of zero follows the native count.
    ///
    /// # Errors
    ///
    /// `InvalidType` for unknown type codes, `BadChannel` for a destroyed
    /// channel, or `TransportRejected` if the immediate arm request could not
    /// be sent, in which case the subscription is not registered.
    pub fn subscribe(&self, dbr_type: DbrType, count: u32, mask: EventMask) -> CaResult<Subscription> {
        if !dbr_type.is_valid() {
            return Err(CaError::InvalidType {
                dbr_type: dbr_type.code(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (arm, ioid) = {
            let mut reg = self.ctx.lock();
            let record = reg.channel(self.id)?;
            let connected = record
                .binding
                .map(|binding| (binding, Arc::clone(&record.transport)));
            let state = SubscriptionState {
                dbr_type,
                count,
                mask,
                events: tx,
            };
            let ioid = reg.install_io(self.id, IoKind::Subscription(state))?;
            let arm = connected.map(|(binding, transport)| {
                (transport, arm_request(binding, dbr_type, count, mask, ioid))
            });
            (arm, ioid)
        };

        if let Some((transport, (header, block))) = arm {
            self.ctx.send_or_destroy(transport.as_ref(), ioid, &header, &block)?;
        }
        tracing::debug!(cid = %self.id, ioid = %ioid, mask = mask.bits(), "subscription registered");
        Ok(Subscription::new(Arc::clone(&self.ctx), ioid, self.id, rx))
    }
}

impl ClientContext {
    /// Unregister a subscription and, if its channel is connected, send the
    /// cancel request.
    pub(crate) fn cancel_subscription(&self, ioid: IoId) -> CaResult<()> {
        let cancel = {
            let mut reg = self.lock();
            match reg.ios.get(&ioid) {
                None => {
                    reg.stats.stale_ids += 1;
                    return Ok(());
                }
                Some(pending) if !pending.kind.is_subscription() => {
                    return Err(CaError::Internal(format!("I/O {ioid} is not a subscription")));
                }
                Some(_) => {}
            }
            let Some(pending) = reg.uninstall_io(ioid) else {
                return Ok(());
            };
            reg.stats.ios_destroyed += 1;
            let IoKind::Subscription(state) = pending.kind else {
                return Ok(());
            };
            reg.channels.get(&pending.channel).and_then(|record| {
                record.binding.map(|binding| {
                    let count = if state.count == 0 || state.count > binding.native_count {
                        binding.native_count
                    } else {
                        state.count
                    };
                    let header = wire::event_cancel(
                        state.dbr_type,
                        count.min(MAX_WIRE_FIELD) as u16,
                        binding.sid,
                        ioid,
                    );
                    (Arc::clone(&record.transport), header)
                })
            })
        };

        tracing::debug!(ioid = %ioid, "subscription cancelled");
        if let Some((transport, header)) = cancel {
            transport.send_stream(&header, &[], true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MemoryTransport;

    fn bound(native_type: DbrType, native_count: u32) -> Option<ServerBinding> {
        Some(ServerBinding {
            native_type,
            native_count,
            sid: 42,
        })
    }

    #[test]
    fn test_read_rejects_disconnected_before_bad_type() {
        let result = validate_read(None, AccessRights::FULL, DbrType(99), 1);
        assert_eq!(result, Err(CaError::NotConnected));
    }

    #[test]
    fn test_read_type_before_access() {
        let result = validate_read(bound(DbrType::DOUBLE, 1), AccessRights::NONE, DbrType(99), 1);
        assert_eq!(result, Err(CaError::InvalidType { dbr_type: 99 }));
    }

    #[test]
    fn test_read_accepts_compound_type() {
        let (_, count) =
            validate_read(bound(DbrType::DOUBLE, 1), AccessRights::FULL, DbrType(20), 1).expect("valid");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_read_zero_count_means_native() {
        let (_, count) =
            validate_read(bound(DbrType::DOUBLE, 7), AccessRights::FULL, DbrType::DOUBLE, 0).expect("valid");
        assert_eq!(count, 7);
    }

    #[test]
    fn test_read_count_above_native() {
        let result = validate_read(bound(DbrType::DOUBLE, 2), AccessRights::FULL, DbrType::DOUBLE, 3);
        assert_eq!(
            result,
            Err(CaError::CountOutOfRange {
                requested: 3,
                native: 2
            })
        );
    }

    #[test]
    fn test_put_rejects_compound_type() {
        let result = validate_put(bound(DbrType::DOUBLE, 1), AccessRights::FULL, DbrType(20), 1, &[0; 8]);
        assert_eq!(result, Err(CaError::InvalidType { dbr_type: 20 }));
    }

    #[test]
    fn test_put_access_before_count() {
        let result = validate_put(bound(DbrType::DOUBLE, 1), AccessRights::NONE, DbrType::DOUBLE, 0, &[]);
        assert_eq!(
            result,
            Err(CaError::AccessDenied {
                access: Access::Write
            })
        );
    }

    #[test]
    fn test_put_zero_count_rejected() {
        let result = validate_put(bound(DbrType::DOUBLE, 1), AccessRights::FULL, DbrType::DOUBLE, 0, &[0; 8]);
        assert!(matches!(result, Err(CaError::CountOutOfRange { requested: 0, .. })));
    }

    #[test]
    fn test_single_string_uses_actual_length() {
        let (_, count, size) =
            validate_put(bound(DbrType::STRING, 1), AccessRights::FULL, DbrType::STRING, 1, b"abc\0")
                .expect("valid");
        assert_eq!(count, 1);
        assert_eq!(size, 4);
    }

    #[test]
    fn test_unterminated_string_rejected() {
        let value = DbrValue::String(vec!["ok".into(), "y".repeat(MAX_STRING_SIZE)]).encode();
        let result = validate_put(bound(DbrType::STRING, 2), AccessRights::FULL, DbrType::STRING, 2, &value);
        assert_eq!(result, Err(CaError::StringTooLong));
    }

    #[test]
    fn test_string_array_uses_slot_width() {
        let value = DbrValue::String(vec!["a".into(), "b".into()]).encode();
        let (_, _, size) =
            validate_put(bound(DbrType::STRING, 2), AccessRights::FULL, DbrType::STRING, 2, &value)
                .expect("valid");
        assert_eq!(size as usize, 2 * MAX_STRING_SIZE);
    }

    #[test]
    fn test_put_value_too_large() {
        let value = vec![0u8; 8];
        let result = validate_put(bound(DbrType::DOUBLE, 9000), AccessRights::FULL, DbrType::DOUBLE, 9000, &value);
        assert_eq!(result, Err(CaError::ValueTooLarge { size: 72000 }));
    }

    #[test]
    fn test_put_value_too_short() {
        let result = validate_put(bound(DbrType::LONG, 2), AccessRights::FULL, DbrType::LONG, 2, &[0; 4]);
        assert_eq!(result, Err(CaError::ValueTooShort { needed: 8, have: 4 }));
    }

    #[test]
    fn test_read_into_leaves_buffer_idle_when_ids_run_out() {
        let udp = Arc::new(MemoryTransport::new("udp", 8));
        let tcp = Arc::new(MemoryTransport::new("ioc", 13));
        let ctx = ClientContext::new(ClientConfig::default(), udp);
        let channel = Channel::create(&ctx, "PV1").expect("create");
        ctx.search_reply(channel.id(), 4, DbrType::LONG, 1, tcp);
        ctx.connect_channel(channel.id(), DbrType::LONG, 1, 4);
        ctx.access_rights_changed(channel.id(), AccessRights::FULL);

        while ctx.lock().ids.allocate().is_ok() {}

        let buffer = ReadBuffer::new();
        assert_eq!(
            channel.read_into(DbrType::LONG, 1, &buffer),
            Err(CaError::AllocationFailure)
        );
        assert!(!buffer.is_waiting());
        assert_eq!(buffer.status(), None);
        assert_eq!(ctx.outstanding_io(), 0);
    }

    #[test]
    fn test_arm_request_clamps_count() {
        let binding = ServerBinding {
            native_type: DbrType::DOUBLE,
            native_count: 5,
            sid: 3,
        };
        let (header, _) = arm_request(binding, DbrType::DOUBLE, 0, EventMask::VALUE, IoId(8));
        assert_eq!(header.count, 5);
        let (header, _) = arm_request(binding, DbrType::DOUBLE, 9, EventMask::VALUE, IoId(8));
        assert_eq!(header.count, 5);
        let (header, _) = arm_request(binding, DbrType::DOUBLE, 2, EventMask::VALUE, IoId(8));
        assert_eq!(header.count, 2);
    }
}
