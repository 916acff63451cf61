//! Flow items and the binary record format
//!
//! A flow record is laid out as
//! `epoch:u64 LE | sequence:u64 LE | tid:varint | length:u32 LE | payload`.
//! The TID is not part of the logical [`FlowItem`]: it is derived from the
//! record's runtime type through the [`TypeRegistry`] when the item is
//! encoded.

use crate::error::{HubError, Result};
use crate::registry::{PersistentData, Pooled, Tid, TypeRegistry};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// Largest payload accepted when decoding (64 MiB)
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Epoch and sequence bytes at the start of every record
pub const FIXED_HEADER_LEN: usize = 16;

/// Logical position of an item: epoch first, then sequence
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub epoch: u64,
    pub sequence: u64,
}

impl Position {
    /// Precedes every published item (sequences start at 1)
    pub const ZERO: Position = Position {
        epoch: 0,
        sequence: 0,
    };

    pub fn new(epoch: u64, sequence: u64) -> Self {
        Self { epoch, sequence }
    }

    /// Next position within the same epoch
    pub fn next(self) -> Self {
        Self {
            epoch: self.epoch,
            sequence: self.sequence + 1,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.sequence)
    }
}

/// The ordered, immutable unit moving through the hub and the flow log
#[derive(Debug, Clone)]
pub struct FlowItem<T> {
    pub epoch: u64,
    pub sequence: u64,
    pub data: T,
}

impl<T> FlowItem<T> {
    pub fn new(epoch: u64, sequence: u64, data: T) -> Self {
        Self {
            epoch,
            sequence,
            data,
        }
    }

    pub fn at(position: Position, data: T) -> Self {
        Self::new(position.epoch, position.sequence, data)
    }

    pub fn position(&self) -> Position {
        Position::new(self.epoch, self.sequence)
    }

    /// Strict ordering by epoch, then sequence
    pub fn less<U>(&self, than: &FlowItem<U>) -> bool {
        self.position() < than.position()
    }
}

impl<T: PersistentData> FlowItem<T> {
    /// Append this item's record encoding to `buf`
    pub fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<()> {
        let tid = registry
            .tid_of::<T>()
            .ok_or_else(|| HubError::UnregisteredType(std::any::type_name::<T>().to_string()))?;
        encode_record(buf, self.position(), tid, &self.data.serialize())
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub position: Position,
    pub tid: Tid,
    pub len: u32,
}

/// Append one record to `buf`
pub fn encode_record(
    buf: &mut BytesMut,
    position: Position,
    tid: Tid,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN as usize {
        return Err(HubError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    buf.reserve(FIXED_HEADER_LEN + 5 + 4 + payload.len());
    buf.put_u64_le(position.epoch);
    buf.put_u64_le(position.sequence);
    put_varint(buf, tid.0);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Decode one record from an in-memory buffer, leasing the instance from `registry`
pub fn decode_item(buf: &mut impl Buf, registry: &TypeRegistry) -> Result<FlowItem<Pooled>> {
    if buf.remaining() < FIXED_HEADER_LEN {
        return Err(HubError::Decode("Truncated record header".to_string()));
    }
    let epoch = buf.get_u64_le();
    let sequence = buf.get_u64_le();
    let tid = Tid(get_varint(buf)?);

    if buf.remaining() < 4 {
        return Err(HubError::Decode("Truncated payload length".to_string()));
    }
    let len = buf.get_u32_le();
    check_len(len)?;
    if buf.remaining() < len as usize {
        return Err(HubError::Decode(format!(
            "Truncated payload: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }

    let payload = buf.copy_to_bytes(len as usize);
    let mut data = registry.new_instance(tid)?;
    data.deserialize(&payload)?;
    Ok(FlowItem::new(epoch, sequence, data))
}

/// Read a record header from a byte stream
///
/// Returns `UnexpectedEof` from the reader untouched so callers can tell a
/// clean end of log from a torn record.
pub fn read_header<R: Read>(reader: &mut R) -> std::io::Result<RecordHeader> {
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    reader.read_exact(&mut fixed)?;
    let mut fixed = &fixed[..];
    let epoch = fixed.get_u64_le();
    let sequence = fixed.get_u64_le();

    let tid = read_varint(reader)?;

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    check_len(len).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(RecordHeader {
        position: Position::new(epoch, sequence),
        tid: Tid(tid),
        len,
    })
}

fn check_len(len: u32) -> Result<()> {
    if len > MAX_PAYLOAD_LEN {
        return Err(HubError::Decode(format!(
            "Payload too large: {} bytes (max {})",
            len, MAX_PAYLOAD_LEN
        )));
    }
    Ok(())
}

/// LEB128 encode
pub fn put_varint(buf: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut impl Buf) -> Result<u32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        if !buf.has_remaining() {
            return Err(HubError::Decode("Truncated TID".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(HubError::Decode("TID varint overflow".to_string()))
}

fn read_varint<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7f) as u32) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "TID varint overflow",
    ))
}
