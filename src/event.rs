//! Events and their per-distinct-template summaries.
//!
//! An [`Event`] is the recorder's opaque, self-describing payload: a record
//! tag plus an inline byte blob. Deduplication happens at the
//! [`EventSummary`] level, keyed on a byte-wise comparison of the full
//! template (spec: "two events are the same EventSummary iff their full
//! `event_size` bytes compare equal").

use crate::linked_vector::LinkedDurationVector;
use crate::{PallasError, Result};

/// Maximum number of bytes in an Event's inline payload (253), chosen so
/// that `record (2) + event_size (1) + payload` never exceeds 256 bytes.
pub const MAX_PAYLOAD_LEN: usize = 253;

/// A single recorded event: a record tag plus an opaque byte payload. The
/// recorder serialises whatever fields a specific record type needs
/// (MPI_SEND, ENTER, ...) into `payload`; the core never interprets it.
#[derive(Debug, Clone)]
pub struct Event {
    /// Caller-defined record tag (e.g. distinguishes MPI_SEND from ENTER).
    pub record: u16,
    /// Total template size in bytes: `3 + payload.len()`. Invariant:
    /// `event_size <= 256`.
    pub event_size: u8,
    /// Opaque, recorder-defined payload bytes.
    pub payload: Vec<u8>,
}

impl Event {
    /// Builds an Event, computing `event_size` from the payload length.
    /// Panics (fatal-bug class) if the payload doesn't fit.
    pub fn new(record: u16, payload: Vec<u8>) -> Self {
        assert!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "event payload {} bytes exceeds max {MAX_PAYLOAD_LEN}",
            payload.len()
        );
        let event_size = (3 + payload.len()) as u8;
        Event { record, event_size, payload }
    }

    /// The full template bytes used as the dedup key: `record` (LE) +
    /// `event_size` + `payload`, truncated to `event_size` bytes.
    pub fn template_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.event_size as usize);
        bytes.extend_from_slice(&self.record.to_le_bytes());
        bytes.push(self.event_size);
        bytes.extend_from_slice(&self.payload);
        bytes.truncate(self.event_size as usize);
        bytes
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.template_bytes() == other.template_bytes()
    }
}
impl Eq for Event {}

/// A scalar value attached to an occurrence via an [`AttributeList`].
/// Mirrors the original's `AttributeValue` union, minus the
/// definition-table reference variants that are out of scope for this
/// crate's occurrence-level attribute records (those live in the
/// `Attribute`/`Region`/... definition tables themselves, see
/// [`crate::definitions`]).
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Unsigned 8-bit integer.
    Uint8(u8),
    /// Unsigned 16-bit integer.
    Uint16(u16),
    /// Unsigned 32-bit integer.
    Uint32(u32),
    /// Unsigned 64-bit integer.
    Uint64(u64),
    /// Signed 8-bit integer.
    Int8(i8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// A reference into the String definition table.
    StringRef(u32),
}

impl AttributeValue {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Uint8(_) => 1,
            Self::Uint16(_) => 2,
            Self::Uint32(_) => 3,
            Self::Uint64(_) => 4,
            Self::Int8(_) => 5,
            Self::Int16(_) => 6,
            Self::Int32(_) => 7,
            Self::Int64(_) => 8,
            Self::Float(_) => 9,
            Self::Double(_) => 10,
            Self::StringRef(_) => 11,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Uint8(v) => out.push(*v),
            Self::Uint16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int8(v) => out.push(*v as u8),
            Self::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::StringRef(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn read_payload(tag: u8, bytes: &[u8]) -> Result<(Self, usize)> {
        macro_rules! take {
            ($ty:ty, $n:expr, $ctor:expr) => {{
                if bytes.len() < $n {
                    return Err(PallasError::Corruption("truncated attribute value".into()));
                }
                let arr: [u8; $n] = bytes[..$n].try_into().unwrap();
                (($ctor)(<$ty>::from_le_bytes(arr)), $n)
            }};
        }
        let (value, consumed) = match tag {
            1 => {
                if bytes.is_empty() {
                    return Err(PallasError::Corruption("truncated attribute value".into()));
                }
                (AttributeValue::Uint8(bytes[0]), 1)
            }
            2 => take!(u16, 2, AttributeValue::Uint16),
            3 => take!(u32, 4, AttributeValue::Uint32),
            4 => take!(u64, 8, AttributeValue::Uint64),
            5 => {
                if bytes.is_empty() {
                    return Err(PallasError::Corruption("truncated attribute value".into()));
                }
                (AttributeValue::Int8(bytes[0] as i8), 1)
            }
            6 => take!(i16, 2, AttributeValue::Int16),
            7 => take!(i32, 4, AttributeValue::Int32),
            8 => take!(i64, 8, AttributeValue::Int64),
            9 => take!(f32, 4, AttributeValue::Float),
            10 => take!(f64, 8, AttributeValue::Double),
            11 => take!(u32, 4, AttributeValue::StringRef),
            other => return Err(PallasError::Corruption(format!("unknown attribute type tag {other}"))),
        };
        Ok((value, consumed))
    }
}

/// One `(attribute_ref, value)` pair, repeated in an [`AttributeList`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEntry {
    /// Reference into the Attribute definition table.
    pub attribute_ref: u32,
    /// The value attached for this occurrence.
    pub value: AttributeValue,
}

/// The attributes attached to one occurrence of an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeList {
    /// Entries in insertion order.
    pub entries: Vec<AttributeEntry>,
}

impl AttributeList {
    /// Serialises this list as `(attribute_ref: u32, type_tag: u8,
    /// value_bytes)*`, matching the original's length-prefixed-run
    /// encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for e in &self.entries {
            out.extend_from_slice(&e.attribute_ref.to_le_bytes());
            out.push(e.value.type_tag());
            e.value.write_payload(&mut out);
        }
        out
    }

    /// Parses a run of entries from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes.len() - pos < 5 {
                return Err(PallasError::Corruption("truncated attribute list".into()));
            }
            let attribute_ref = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            let tag = bytes[pos + 4];
            let (value, consumed) = AttributeValue::read_payload(tag, &bytes[pos + 5..])?;
            entries.push(AttributeEntry { attribute_ref, value });
            pos += 5 + consumed;
        }
        Ok(Self { entries })
    }
}

/// One entry in the append-only attribute log: the occurrence index it was
/// stamped with, plus its encoded `AttributeList` bytes.
struct AttributeLogEntry {
    occurrence_index: u64,
    bytes: Vec<u8>,
}

/// Per-distinct-event structure: the event template, an occurrence count,
/// a per-occurrence duration vector, and an append-only attribute log.
pub struct EventSummary {
    /// Dense id within the owning Thread.
    pub id: u32,
    /// The template bytes for this distinct event.
    pub event: Event,
    /// Number of times this event has occurred.
    pub nb_occurrences: u64,
    /// Per-occurrence duration, in nanoseconds.
    pub durations: LinkedDurationVector,
    log: Vec<AttributeLogEntry>,
}

impl EventSummary {
    pub(crate) fn new(id: u32, event: Event) -> Self {
        Self {
            id,
            event,
            nb_occurrences: 0,
            durations: LinkedDurationVector::new(),
            log: Vec::new(),
        }
    }

    /// Appends an `AttributeList` for the most recent occurrence.
    /// `occurrence_index` must be monotonically increasing across calls
    /// (reader lookup relies on this).
    pub fn record_attributes(&mut self, occurrence_index: u64, attrs: AttributeList) {
        if attrs.entries.is_empty() {
            return;
        }
        self.log.push(AttributeLogEntry { occurrence_index, bytes: attrs.encode() });
    }

    /// Looks up the attribute list stamped with exactly `occurrence_index`,
    /// walking forward from the last remembered position. Returns `None`
    /// when there's a gap (no attributes recorded for that occurrence).
    pub fn attribute_list(&self, occurrence_index: u64) -> Result<Option<AttributeList>> {
        match self
            .log
            .binary_search_by_key(&occurrence_index, |e| e.occurrence_index)
        {
            Ok(idx) => Ok(Some(AttributeList::decode(&self.log[idx].bytes)?)),
            Err(_) => Ok(None),
        }
    }

    /// Serialises the whole attribute log as a single buffer, for storage.
    pub fn attribute_buffer(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.log {
            out.extend_from_slice(&entry.occurrence_index.to_le_bytes());
            out.extend_from_slice(&(entry.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&entry.bytes);
        }
        out
    }

    /// Rebuilds the attribute log from a buffer produced by
    /// `attribute_buffer`.
    pub fn load_attribute_buffer(&mut self, buf: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            if buf.len() - pos < 12 {
                return Err(PallasError::Corruption("truncated attribute buffer".into()));
            }
            let occurrence_index = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            let len = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
            pos += 12;
            if buf.len() - pos < len {
                return Err(PallasError::Corruption("truncated attribute buffer entry".into()));
            }
            let bytes = buf[pos..pos + len].to_vec();
            pos += len;
            self.log.push(AttributeLogEntry { occurrence_index, bytes });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_bytes_is_dedup_key() {
        let a = Event::new(7, vec![1, 2, 3]);
        let b = Event::new(7, vec![1, 2, 3]);
        let c = Event::new(7, vec![1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn attribute_list_roundtrip() {
        let list = AttributeList {
            entries: vec![
                AttributeEntry { attribute_ref: 1, value: AttributeValue::Uint32(42) },
                AttributeEntry { attribute_ref: 2, value: AttributeValue::Double(3.5) },
            ],
        };
        let encoded = list.encode();
        let decoded = AttributeList::decode(&encoded).unwrap();
        assert_eq!(list, decoded);
    }

    #[test]
    fn attribute_lookup_scenario_f() {
        // Record E five times, attaching attributes only to occurrences 1 and 3.
        let mut summary = EventSummary::new(0, Event::new(1, vec![]));
        for occ in 0..5u64 {
            summary.nb_occurrences += 1;
            if occ == 1 || occ == 3 {
                let list = AttributeList {
                    entries: vec![AttributeEntry {
                        attribute_ref: 9,
                        value: AttributeValue::Uint64(occ),
                    }],
                };
                summary.record_attributes(occ, list);
            }
        }
        let l1 = summary.attribute_list(1).unwrap().unwrap();
        assert_eq!(l1.entries[0].value, AttributeValue::Uint64(1));
        assert!(summary.attribute_list(2).unwrap().is_none());
        let l3 = summary.attribute_list(3).unwrap().unwrap();
        assert_eq!(l3.entries[0].value, AttributeValue::Uint64(3));
    }

    #[test]
    fn attribute_buffer_roundtrip() {
        let mut summary = EventSummary::new(0, Event::new(1, vec![]));
        summary.record_attributes(
            2,
            AttributeList { entries: vec![AttributeEntry { attribute_ref: 4, value: AttributeValue::Int8(-3) }] },
        );
        let buf = summary.attribute_buffer();
        let mut reloaded = EventSummary::new(0, Event::new(1, vec![]));
        reloaded.load_attribute_buffer(&buf).unwrap();
        assert_eq!(
            reloaded.attribute_list(2).unwrap(),
            summary.attribute_list(2).unwrap()
        );
    }
}
