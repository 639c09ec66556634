//! Generic bus message with a fixed 18-byte header and a typed payload.
//!
//! Every message starts with the same little-endian header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | u16  | Message type tag |
//! | 2      | u16  | Version number |
//! | 4      | u32  | Total serialized size |
//! | 8      | u64  | Timestamp, ns since 1970 UTC |
//! | 16     | u16  | Bus channel |
//!
//! The type tag selects the payload that follows the header. The tag values
//! below are the wire format: `Unknown=0, CAN_DataFrame=1, CAN_RemoteFrame=2,
//! CAN_ErrorFrame=3, CAN_OverloadFrame=4, CAN_BusWakeUp=5, CAN_SingleWire=6`.
//! Only the CAN data frame carries a payload today; the other types are
//! header-only records.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::can::CanDataFrame;
use crate::error::{BusError, BusResult};
use crate::little_endian::LittleBuffer;
use crate::logsink::bus_error;

/// Serialized size of the common message header.
pub const HEADER_SIZE: u32 = 18;

/// Shared handle to an enqueued message.
///
/// Fan-out hands the same handle to every subscriber; received messages must
/// not be mutated.
pub type MessageHandle = Arc<BusMessage>;

/// Message type tag (wire value, `u16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BusMessageType {
    Unknown = 0,
    CanDataFrame = 1,
    CanRemoteFrame = 2,
    CanErrorFrame = 3,
    CanOverloadFrame = 4,
    CanBusWakeUp = 5,
    CanSingleWire = 6,
}

impl BusMessageType {
    /// Decode a wire tag. Returns `None` for tags outside the known set.
    pub fn from_u16(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Self::Unknown),
            1 => Some(Self::CanDataFrame),
            2 => Some(Self::CanRemoteFrame),
            3 => Some(Self::CanErrorFrame),
            4 => Some(Self::CanOverloadFrame),
            5 => Some(Self::CanBusWakeUp),
            6 => Some(Self::CanSingleWire),
            _ => None,
        }
    }

    /// Wire tag of this type.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Type-specific payload of a bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Header-only message.
    None,
    /// CAN or CAN FD data frame.
    CanData(CanDataFrame),
}

/// A bus message: common header plus typed payload.
///
/// The `size` and `valid` fields are interior cells: serialization updates
/// them on a shared receiver, and `size()` always reflects the current
/// serialized form.
#[derive(Debug)]
pub struct BusMessage {
    message_type: BusMessageType,
    version: u16,
    timestamp: u64,
    bus_channel: u16,
    size: AtomicU32,
    valid: AtomicBool,
    payload: MessagePayload,
}

impl BusMessage {
    /// Create a new message of the given type with default field values.
    ///
    /// This is the factory the transports use when decoding raw frames: the
    /// tag selects the payload variant.
    pub fn new(message_type: BusMessageType) -> Self {
        let (payload, size) = match message_type {
            BusMessageType::CanDataFrame => {
                let frame = CanDataFrame::default();
                let size = frame.serialized_size();
                (MessagePayload::CanData(frame), size)
            }
            _ => (MessagePayload::None, HEADER_SIZE),
        };

        Self {
            message_type,
            version: 0,
            timestamp: 0,
            bus_channel: 0,
            size: AtomicU32::new(size),
            valid: AtomicBool::new(true),
            payload,
        }
    }

    /// Read the type tag out of a raw frame without building a message.
    pub(crate) fn peek_type(source: &[u8]) -> BusResult<u16> {
        let tag: LittleBuffer<u16> = LittleBuffer::from_slice(source, 0)?;
        Ok(tag.value())
    }

    pub fn message_type(&self) -> BusMessageType {
        self.message_type
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn set_version(&mut self, version: u16) {
        self.version = version;
    }

    /// Timestamp in nanoseconds since 1970-01-01 UTC.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Bus channel number. Only the low 8 bits are meaningful today.
    pub fn bus_channel(&self) -> u16 {
        self.bus_channel
    }

    pub fn set_bus_channel(&mut self, channel: u16) {
        self.bus_channel = channel;
    }

    /// Total serialized size of the message in bytes.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Relaxed);
    }

    /// False when the last (de)serialization of this message failed.
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed);
    }

    /// Payload of the message.
    pub fn payload(&self) -> &MessagePayload {
        &self.payload
    }

    /// The CAN data frame payload, if this is a data frame message.
    pub fn can_data(&self) -> Option<&CanDataFrame> {
        match &self.payload {
            MessagePayload::CanData(frame) => Some(frame),
            MessagePayload::None => None,
        }
    }

    pub(crate) fn can_data_mut(&mut self) -> Option<&mut CanDataFrame> {
        match &mut self.payload {
            MessagePayload::CanData(frame) => Some(frame),
            MessagePayload::None => None,
        }
    }

    /// Serialize the message into `dest`, resizing it to exactly `size()`.
    ///
    /// On failure the message is marked invalid and an error is logged; the
    /// destination content is unspecified in that case.
    pub fn to_raw(&self, dest: &mut Vec<u8>) {
        self.set_valid(true);
        if let MessagePayload::CanData(frame) = &self.payload {
            self.set_size(frame.serialized_size());
        }

        if let Err(err) = self.encode(dest) {
            bus_error!("Message serialization error. Error: {err}");
            self.set_valid(false);
        }
    }

    fn encode(&self, dest: &mut Vec<u8>) -> BusResult<()> {
        let size = self.size();
        if size < HEADER_SIZE {
            return Err(BusError::Encode(format!(
                "invalid message size {size}, the header alone is {HEADER_SIZE} bytes"
            )));
        }

        dest.clear();
        dest.resize(size as usize, 0);

        LittleBuffer::new(self.message_type.as_u16()).write_into(dest, 0)?;
        LittleBuffer::new(self.version).write_into(dest, 2)?;
        LittleBuffer::new(size).write_into(dest, 4)?;
        LittleBuffer::new(self.timestamp).write_into(dest, 8)?;
        LittleBuffer::new(self.bus_channel).write_into(dest, 16)?;

        match &self.payload {
            MessagePayload::CanData(frame) => frame.write_payload(dest),
            MessagePayload::None => Ok(()),
        }
    }

    /// Parse the message from a raw frame.
    ///
    /// The message is marked invalid when the source is shorter than the
    /// header, the declared size exceeds the source, or the payload parse
    /// fails. An invalid message is still a legal in-memory value.
    pub fn from_raw(&mut self, source: &[u8]) {
        self.set_valid(true);
        if let Err(err) = self.decode(source) {
            bus_error!("Message deserialization error. Error: {err}");
            self.set_valid(false);
        }
    }

    fn decode(&mut self, source: &[u8]) -> BusResult<()> {
        if source.len() < HEADER_SIZE as usize {
            return Err(BusError::Decode(format!(
                "the input array is too small ({}/{HEADER_SIZE})",
                source.len()
            )));
        }

        let version: LittleBuffer<u16> = LittleBuffer::from_slice(source, 2)?;
        let size: LittleBuffer<u32> = LittleBuffer::from_slice(source, 4)?;
        let timestamp: LittleBuffer<u64> = LittleBuffer::from_slice(source, 8)?;
        let channel: LittleBuffer<u16> = LittleBuffer::from_slice(source, 16)?;

        let declared = size.value();
        if declared as usize > source.len() {
            return Err(BusError::Decode(format!(
                "declared size {declared} exceeds the {} byte source",
                source.len()
            )));
        }

        self.version = version.value();
        self.timestamp = timestamp.value();
        self.bus_channel = channel.value();
        self.set_size(declared);

        match &mut self.payload {
            MessagePayload::CanData(frame) => frame.read_payload(source),
            MessagePayload::None => Ok(()),
        }
    }

    /// Human-readable one-liner for the text listener bridge.
    ///
    /// Returns an empty string when `log_level` is above 1, which tells the
    /// listener to skip the message entirely.
    pub fn to_text(&self, log_level: u64) -> String {
        if log_level > 1 {
            return String::new();
        }

        match &self.payload {
            MessagePayload::CanData(frame) => {
                let data: Vec<String> = frame
                    .data_bytes()
                    .iter()
                    .map(|byte| format!("{byte:02X}"))
                    .collect();
                format!(
                    "Type: CanDataFrame, CanId: {}, Data: {}",
                    frame.can_id(),
                    data.join(" ")
                )
            }
            MessagePayload::None => format!(
                "Type: {:?}, Size: {}, Version: {}, Channel: {}",
                self.message_type,
                self.size(),
                self.version,
                self.bus_channel
            ),
        }
    }
}

impl Clone for BusMessage {
    fn clone(&self) -> Self {
        Self {
            message_type: self.message_type,
            version: self.version,
            timestamp: self.timestamp,
            bus_channel: self.bus_channel,
            size: AtomicU32::new(self.size()),
            valid: AtomicBool::new(self.valid()),
            payload: self.payload.clone(),
        }
    }
}

impl PartialEq for BusMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message_type == other.message_type
            && self.version == other.version
            && self.timestamp == other.timestamp
            && self.bus_channel == other.bus_channel
            && self.size() == other.size()
            && self.payload == other.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_on_the_wire() {
        assert_eq!(BusMessageType::Unknown.as_u16(), 0);
        assert_eq!(BusMessageType::CanDataFrame.as_u16(), 1);
        assert_eq!(BusMessageType::CanSingleWire.as_u16(), 6);
        assert_eq!(BusMessageType::from_u16(1), Some(BusMessageType::CanDataFrame));
        assert_eq!(BusMessageType::from_u16(7), None);
    }

    #[test]
    fn test_header_round_trip() {
        crate::logsink::install_null_sink();
        let mut msg = BusMessage::new(BusMessageType::Unknown);
        msg.set_version(3);
        msg.set_timestamp(1_700_000_000_000_000_000);
        msg.set_bus_channel(11);

        let mut raw = Vec::new();
        msg.to_raw(&mut raw);
        assert!(msg.valid());
        assert_eq!(raw.len(), HEADER_SIZE as usize);

        let mut back = BusMessage::new(BusMessageType::Unknown);
        back.from_raw(&raw);
        assert!(back.valid());
        assert_eq!(back, msg);
    }

    #[test]
    fn test_header_layout() {
        crate::logsink::install_null_sink();
        let mut msg = BusMessage::new(BusMessageType::CanBusWakeUp);
        msg.set_version(0x0102);
        msg.set_bus_channel(0x0304);

        let mut raw = Vec::new();
        msg.to_raw(&mut raw);

        assert_eq!(&raw[0..2], &[5, 0]);
        assert_eq!(&raw[2..4], &[0x02, 0x01]);
        assert_eq!(&raw[4..8], &[18, 0, 0, 0]);
        assert_eq!(&raw[16..18], &[0x04, 0x03]);
    }

    #[test]
    fn test_short_source_marks_invalid() {
        crate::logsink::install_null_sink();
        let mut msg = BusMessage::new(BusMessageType::Unknown);
        msg.from_raw(&[0u8; 17]);
        assert!(!msg.valid());
    }

    #[test]
    fn test_declared_size_beyond_source_marks_invalid() {
        crate::logsink::install_null_sink();
        let mut raw = Vec::new();
        BusMessage::new(BusMessageType::Unknown).to_raw(&mut raw);
        // Corrupt the declared size upwards.
        raw[4] = 0xFF;

        let mut msg = BusMessage::new(BusMessageType::Unknown);
        msg.from_raw(&raw);
        assert!(!msg.valid());
    }

    #[test]
    fn test_to_text_obeys_log_level() {
        let msg = BusMessage::new(BusMessageType::Unknown);
        assert!(!msg.to_text(0).is_empty());
        assert!(!msg.to_text(1).is_empty());
        assert!(msg.to_text(2).is_empty());
    }
}
