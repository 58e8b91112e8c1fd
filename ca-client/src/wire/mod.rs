//! Channel Access message header and request builders.
//!
//! Header format (16 bytes, network byte order):
//! `[command:2][payload_size:2][data_type:2][count:2][cid:4][available:4]`
//!
//! - **command**: protocol command code
//! - **payload_size**: bytes following the header
//! - **data_type / count**: DBR type and element count of the payload
//! - **cid**: client channel id or server channel id, depending on command
//! - **available**: correlation id for I/O, otherwise command specific

use crate::dbr::{DbrType, EventMask};
use crate::ids::{ChannelId, IoId};

pub mod version;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of the monitor block carried by an event-add request.
pub const MONITOR_BLOCK_SIZE: usize = 16;

/// Largest element count or payload size the 16-bit header fields can carry.
pub const MAX_WIRE_FIELD: u32 = 0xffff;

/// Correlation value of a write that expects no completion.
pub const NO_COMPLETION_ID: u32 = u32::MAX;

/// `data_type` of a search request: servers that lack the channel stay silent.
pub const DONT_REPLY: u16 = 5;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the header.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },
}

/// Protocol command codes used by the client core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Arm a subscription.
    EventAdd = 1,
    /// Cancel a subscription.
    EventCancel = 2,
    /// Read without completion callback (read-into-buffer).
    Read = 3,
    /// Write without completion.
    Write = 4,
    /// Broadcast channel search.
    Search = 6,
    /// Release a server channel.
    ClearChannel = 12,
    /// Read with completion callback.
    ReadNotify = 15,
    /// Claim a channel on a stream connection.
    ClaimChannel = 18,
    /// Write with completion callback.
    WriteNotify = 19,
}

impl Command {
    /// Raw wire code.
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaHeader {
    /// Command code.
    pub command: u16,
    /// Payload size in bytes.
    pub payload_size: u16,
    /// DBR type code.
    pub data_type: u16,
    /// Element count.
    pub count: u16,
    /// Channel identifier field.
    pub cid: u32,
    /// Correlation or command specific field.
    pub available: u32,
}

impl CaHeader {
    /// Serialize header into buffer (must be at least HEADER_SIZE bytes).
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than HEADER_SIZE.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.command.to_be_bytes());
        buf[2..4].copy_from_slice(&self.payload_size.to_be_bytes());
        buf[4..6].copy_from_slice(&self.data_type.to_be_bytes());
        buf[6..8].copy_from_slice(&self.count.to_be_bytes());
        buf[8..12].copy_from_slice(&self.cid.to_be_bytes());
        buf[12..16].copy_from_slice(&self.available.to_be_bytes());
    }

    /// Deserialize header from buffer.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if buffer is smaller than HEADER_SIZE.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        Ok(Self {
            command: u16::from_be_bytes([buf[0], buf[1]]),
            payload_size: u16::from_be_bytes([buf[2], buf[3]]),
            data_type: u16::from_be_bytes([buf[4], buf[5]]),
            count: u16::from_be_bytes([buf[6], buf[7]]),
            cid: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            available: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Header followed by payload, ready for a socket.
    pub fn encode_with(&self, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_SIZE + payload.len()];
        self.serialize_into(&mut data[..HEADER_SIZE]);
        data[HEADER_SIZE..].copy_from_slice(payload);
        data
    }
}

/// Name bytes followed by the terminator, as carried by search and claim.
pub fn name_payload(name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + 1);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload
}

/// Search request for a channel name.
///
/// The channel id is used both as correlation value and as client id; the
/// element count field advertises the client's minor version.
pub fn search(cid: ChannelId, name_len: u16, minor_version: u16) -> CaHeader {
    CaHeader {
        command: Command::Search.code(),
        payload_size: name_len,
        data_type: DONT_REPLY,
        count: minor_version,
        cid: cid.as_u32(),
        available: cid.as_u32(),
    }
}

/// Claim request sent once a search reply names the serving host.
///
/// Peers that resolve names at claim time get the client id and the name;
/// older peers get the server id learned from the search reply and no name.
/// The `available` field carries the client's minor version.
pub fn claim(cid: ChannelId, sid: u32, name_len: u16, peer_minor: u16, minor_version: u16) -> CaHeader {
    let (cid, payload_size) = if version::claims_by_name(peer_minor) {
        (cid.as_u32(), name_len)
    } else {
        (sid, 0)
    };
    CaHeader {
        command: Command::ClaimChannel.code(),
        payload_size,
        cid,
        available: u32::from(minor_version),
        ..CaHeader::default()
    }
}

/// Release the server side of a channel.
pub fn clear_channel(cid: ChannelId, sid: u32) -> CaHeader {
    CaHeader {
        command: Command::ClearChannel.code(),
        cid: sid,
        available: cid.as_u32(),
        ..CaHeader::default()
    }
}

/// Read request; `ReadNotify` for callbacks, `Read` for buffer copies.
pub fn read(command: Command, dbr_type: DbrType, count: u16, sid: u32, ioid: IoId) -> CaHeader {
    CaHeader {
        command: command.code(),
        payload_size: 0,
        data_type: dbr_type.code(),
        count,
        cid: sid,
        available: ioid.as_u32(),
    }
}

/// Write request carrying `payload_size` bytes.
pub fn write(
    command: Command,
    dbr_type: DbrType,
    count: u16,
    payload_size: u16,
    sid: u32,
    correlation: u32,
) -> CaHeader {
    CaHeader {
        command: command.code(),
        payload_size,
        data_type: dbr_type.code(),
        count,
        cid: sid,
        available: correlation,
    }
}

/// Subscription arm request and its monitor block.
pub fn event_add(
    dbr_type: DbrType,
    count: u16,
    sid: u32,
    subid: IoId,
    mask: EventMask,
) -> (CaHeader, [u8; MONITOR_BLOCK_SIZE]) {
    let header = CaHeader {
        command: Command::EventAdd.code(),
        payload_size: MONITOR_BLOCK_SIZE as u16,
        data_type: dbr_type.code(),
        count,
        cid: sid,
        available: subid.as_u32(),
    };

    // low, high and timeout deadbands are unused; mask then padding
    let mut block = [0u8; MONITOR_BLOCK_SIZE];
    block[12..14].copy_from_slice(&mask.bits().to_be_bytes());
    (header, block)
}

/// Subscription cancel request.
pub fn event_cancel(dbr_type: DbrType, count: u16, sid: u32, subid: IoId) -> CaHeader {
    CaHeader {
        command: Command::EventCancel.code(),
        payload_size: 0,
        data_type: dbr_type.code(),
        count,
        cid: sid,
        available: subid.as_u32(),
    }
}
