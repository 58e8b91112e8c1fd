//! DBR data type codes and payload encoding.
//!
//! Type codes 0-6 are the plain value types. Codes 7-34 wrap a value with
//! status, time, graphic or control metadata ("compound" types), which servers
//! accept for reads and subscriptions but never for writes. Codes 35-38 are
//! special plain types used for alarm acknowledgement and record class names.

use bitflags::bitflags;

/// Fixed slot width of one string element, terminator included.
pub const MAX_STRING_SIZE: usize = 40;

/// Native type reported for a channel that is not connected.
pub const TYPENOTCONN: i16 = -1;

/// A DBR request type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbrType(pub u16);

impl DbrType {
    /// Fixed-width string.
    pub const STRING: DbrType = DbrType(0);
    /// 16-bit signed integer (also `DBR_INT`).
    pub const SHORT: DbrType = DbrType(1);
    /// 32-bit float.
    pub const FLOAT: DbrType = DbrType(2);
    /// 16-bit enumeration index.
    pub const ENUM: DbrType = DbrType(3);
    /// 8-bit character.
    pub const CHAR: DbrType = DbrType(4);
    /// 32-bit signed integer.
    pub const LONG: DbrType = DbrType(5);
    /// 64-bit float.
    pub const DOUBLE: DbrType = DbrType(6);
    /// Status-wrapped string, the first compound type.
    pub const STS_STRING: DbrType = DbrType(7);
    /// Control-wrapped double, the last of the wrapped families.
    pub const CTRL_DOUBLE: DbrType = DbrType(34);
    /// Acknowledge transient alarms.
    pub const PUT_ACKT: DbrType = DbrType(35);
    /// Acknowledge alarm severity.
    pub const PUT_ACKS: DbrType = DbrType(36);
    /// String with status and acknowledgement fields.
    pub const STSACK_STRING: DbrType = DbrType(37);
    /// Record class name.
    pub const CLASS_NAME: DbrType = DbrType(38);

    /// Highest recognized type code.
    pub const LAST: DbrType = DbrType::CLASS_NAME;

    /// Raw wire code.
    pub fn code(self) -> u16 {
        self.0
    }

    /// Whether this is a recognized type code.
    pub fn is_valid(self) -> bool {
        self.0 <= Self::LAST.0
    }

    /// Whether the value is preceded by metadata in the payload.
    pub fn is_compound(self) -> bool {
        (Self::STS_STRING.0..=Self::CTRL_DOUBLE.0).contains(&self.0) || self == Self::STSACK_STRING
    }

    /// Size in bytes of one element of a plain type.
    ///
    /// Returns `None` for compound or unrecognized types.
    pub fn element_size(self) -> Option<usize> {
        let size = match self {
            Self::STRING | Self::CLASS_NAME => MAX_STRING_SIZE,
            Self::SHORT | Self::ENUM | Self::PUT_ACKT | Self::PUT_ACKS => 2,
            Self::FLOAT | Self::LONG => 4,
            Self::CHAR => 1,
            Self::DOUBLE => 8,
            _ => return None,
        };
        Some(size)
    }

    /// Payload size of `count` elements of a plain type.
    pub fn size_n(self, count: u32) -> Option<usize> {
        self.element_size().map(|size| size * count.max(1) as usize)
    }
}

impl std::fmt::Display for DbrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::STRING => "DBR_STRING",
            Self::SHORT => "DBR_SHORT",
            Self::FLOAT => "DBR_FLOAT",
            Self::ENUM => "DBR_ENUM",
            Self::CHAR => "DBR_CHAR",
            Self::LONG => "DBR_LONG",
            Self::DOUBLE => "DBR_DOUBLE",
            Self::PUT_ACKT => "DBR_PUT_ACKT",
            Self::PUT_ACKS => "DBR_PUT_ACKS",
            Self::STSACK_STRING => "DBR_STSACK_STRING",
            Self::CLASS_NAME => "DBR_CLASS_NAME",
            other if other.is_compound() => return write!(f, "DBR_COMPOUND({})", other.0),
            other => return write!(f, "DBR_INVALID({})", other.0),
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Events a subscription asks the server to report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u16 {
        /// Value changed by more than the monitor deadband.
        const VALUE = 1 << 0;
        /// Value changed by more than the archive deadband.
        const LOG = 1 << 1;
        /// Alarm state changed.
        const ALARM = 1 << 2;
    }
}

/// Typed plain value, used to build write payloads and to decode replies.
#[derive(Debug, Clone, PartialEq)]
pub enum DbrValue {
    /// `DBR_STRING` elements.
    String(Vec<String>),
    /// `DBR_SHORT` elements.
    Short(Vec<i16>),
    /// `DBR_FLOAT` elements.
    Float(Vec<f32>),
    /// `DBR_ENUM` elements.
    Enum(Vec<u16>),
    /// `DBR_CHAR` elements.
    Char(Vec<u8>),
    /// `DBR_LONG` elements.
    Long(Vec<i32>),
    /// `DBR_DOUBLE` elements.
    Double(Vec<f64>),
}

impl DbrValue {
    /// Type code matching this value.
    pub fn dbr_type(&self) -> DbrType {
        match self {
            DbrValue::String(_) => DbrType::STRING,
            DbrValue::Short(_) => DbrType::SHORT,
            DbrValue::Float(_) => DbrType::FLOAT,
            DbrValue::Enum(_) => DbrType::ENUM,
            DbrValue::Char(_) => DbrType::CHAR,
            DbrValue::Long(_) => DbrType::LONG,
            DbrValue::Double(_) => DbrType::DOUBLE,
        }
    }

    /// Number of elements.
    pub fn count(&self) -> u32 {
        let len = match self {
            DbrValue::String(v) => v.len(),
            DbrValue::Short(v) => v.len(),
            DbrValue::Float(v) => v.len(),
            DbrValue::Enum(v) => v.len(),
            DbrValue::Char(v) => v.len(),
            DbrValue::Long(v) => v.len(),
            DbrValue::Double(v) => v.len(),
        };
        len as u32
    }

    /// Encode into network byte order.
    ///
    /// Strings are copied into 40-byte slots and NUL padded. A string that
    /// fills its slot is left unterminated so that write validation rejects it.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DbrValue::String(values) => {
                let mut out = vec![0u8; values.len() * MAX_STRING_SIZE];
                for (slot, value) in out.chunks_mut(MAX_STRING_SIZE).zip(values) {
                    let bytes = value.as_bytes();
                    let len = bytes.len().min(MAX_STRING_SIZE);
                    slot[..len].copy_from_slice(&bytes[..len]);
                }
                out
            }
            DbrValue::Short(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Float(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Enum(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Char(values) => values.clone(),
            DbrValue::Long(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrValue::Double(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
        }
    }

    /// Decode `count` elements of a plain type from network byte order.
    ///
    /// Returns `None` for compound types or when the payload is short.
    pub fn decode(dbr_type: DbrType, count: u32, payload: &[u8]) -> Option<DbrValue> {
        let count = count as usize;
        match dbr_type {
            DbrType::STRING => {
                let mut values = Vec::with_capacity(count);
                for i in 0..count {
                    let start = i * MAX_STRING_SIZE;
                    // A single string may arrive in its shortened encoding.
                    let end = payload.len().min(start + MAX_STRING_SIZE);
                    let slot = payload.get(start..end)?;
                    let len = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
                    values.push(String::from_utf8_lossy(&slot[..len]).into_owned());
                }
                Some(DbrValue::String(values))
            }
            DbrType::SHORT => decode_fixed(payload, count, i16::from_be_bytes).map(DbrValue::Short),
            DbrType::FLOAT => decode_fixed(payload, count, f32::from_be_bytes).map(DbrValue::Float),
            DbrType::ENUM => decode_fixed(payload, count, u16::from_be_bytes).map(DbrValue::Enum),
            DbrType::CHAR => payload.get(..count).map(|b| DbrValue::Char(b.to_vec())),
            DbrType::LONG => decode_fixed(payload, count, i32::from_be_bytes).map(DbrValue::Long),
            DbrType::DOUBLE => {
                decode_fixed(payload, count, f64::from_be_bytes).map(DbrValue::Double)
            }
            _ => None,
        }
    }
}

fn decode_fixed<T, const N: usize>(
    payload: &[u8],
    count: usize,
    from_be: fn([u8; N]) -> T,
) -> Option<Vec<T>> {
    let bytes = payload.get(..count * N)?;
    Some(
        bytes
            .chunks_exact(N)
            .map(|chunk| {
                let mut raw = [0u8; N];
                raw.copy_from_slice(chunk);
                from_be(raw)
            })
            .collect(),
    )
}

/// Raw reply payload delivered to a read or subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct DbrData {
    /// Type of the payload.
    pub dbr_type: DbrType,
    /// Element count of the payload.
    pub count: u32,
    /// Payload bytes in network byte order.
    pub payload: Vec<u8>,
}

impl DbrData {
    /// Create a reply payload.
    pub fn new(dbr_type: DbrType, count: u32, payload: Vec<u8>) -> Self {
        Self {
            dbr_type,
            count,
            payload,
        }
    }

    /// Build a reply payload from a typed value.
    pub fn from_value(value: &DbrValue) -> Self {
        Self::new(value.dbr_type(), value.count(), value.encode())
    }

    /// Decode the payload when it holds a plain type.
    pub fn value(&self) -> Option<DbrValue> {
        DbrValue::decode(self.dbr_type, self.count, &self.payload)
    }
}
