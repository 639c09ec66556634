//! CAN / CAN FD data frame payload.
//!
//! The payload starts at byte 18, directly after the common message header,
//! and uses little-endian byte order:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 18     | u32  | Message ID, bit 31 = extended (29-bit) ID |
//! | 22     | u8   | DLC |
//! | 23     | u8   | Data length |
//! | 24     | u32  | CRC |
//! | 28     | u8   | Flags: bit0=dir, bit1=srr, bit2=edl, bit3=brs, bit4=esi, bit5=rtr, bit6=r0, bit7=r1 |
//! | 29     | u8   | Flags: bit0=wake_up, bit1=single_wire |
//! | 30     | u32  | Frame duration (ns) |
//! | 34     | …    | Data bytes (data length of them) |

use crate::error::{BusError, BusResult};
use crate::little_endian::LittleBuffer;
use crate::message::BusMessage;

/// Serialized size of a data frame with an empty payload.
pub const CAN_DATA_FRAME_SIZE: u32 = 34;

/// Bit 31 of the message ID marks a 29-bit extended CAN ID.
pub const EXTENDED_ID_BIT: u32 = 0x8000_0000;

const STANDARD_ID_MASK: u32 = 0x7FF;

/// Payload sizes addressable by the 4-bit data length code.
pub const DLC_TO_LENGTH: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

// Flag bit positions, identical in memory and on the wire.
const DIR_BIT: u16 = 0;
const SRR_BIT: u16 = 1;
const EDL_BIT: u16 = 2;
const BRS_BIT: u16 = 3;
const ESI_BIT: u16 = 4;
const RTR_BIT: u16 = 5;
const R0_BIT: u16 = 6;
const R1_BIT: u16 = 7;
const WAKE_UP_BIT: u16 = 8;
const SINGLE_WIRE_BIT: u16 = 9;

/// CAN data frame payload fields.
///
/// The message ID follows the DBC convention: the CAN ID with bit 31 set
/// when the ID uses 29-bit addressing. Assigning an ID whose CAN part does
/// not fit in 11 bits sets the extended bit automatically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanDataFrame {
    message_id: u32,
    dlc: u8,
    crc: u32,
    flags: u16,
    frame_duration: u32,
    data_bytes: Vec<u8>,
}

impl CanDataFrame {
    /// Message ID including the extended-ID bit.
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn set_message_id(&mut self, message_id: u32) {
        self.message_id = message_id;
        if message_id & !EXTENDED_ID_BIT > STANDARD_ID_MASK {
            self.message_id |= EXTENDED_ID_BIT;
        }
    }

    /// 11/29-bit CAN ID without the extended-ID bit.
    pub fn can_id(&self) -> u32 {
        self.message_id & !EXTENDED_ID_BIT
    }

    pub fn set_can_id(&mut self, can_id: u32) {
        let can_id = can_id & !EXTENDED_ID_BIT;
        self.message_id &= EXTENDED_ID_BIT;
        self.message_id |= can_id;
        if can_id > STANDARD_ID_MASK {
            self.message_id |= EXTENDED_ID_BIT;
        }
    }

    /// True when the CAN ID uses 29-bit addressing.
    pub fn extended_id(&self) -> bool {
        self.message_id & EXTENDED_ID_BIT != 0
    }

    pub fn set_extended_id(&mut self, extended: bool) {
        if extended {
            self.message_id |= EXTENDED_ID_BIT;
        } else {
            self.message_id &= !EXTENDED_ID_BIT;
        }
    }

    /// Data length code. Equal to the data length only for classic CAN.
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Set the DLC directly. `set_data_bytes` keeps the DLC in sync, so this
    /// is rarely needed.
    pub fn set_dlc(&mut self, dlc: u8) {
        self.dlc = dlc;
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }

    /// Number of payload bytes (0..=64).
    pub fn data_length(&self) -> u8 {
        self.data_bytes.len() as u8
    }

    /// Resize the payload and derive the smallest DLC that can carry it.
    pub fn set_data_length(&mut self, data_length: u8) {
        self.data_bytes.resize(data_length as usize, 0);

        let mut dlc = 0u8;
        for table_length in DLC_TO_LENGTH {
            if data_length as usize <= table_length {
                break;
            }
            dlc += 1;
        }
        self.dlc = dlc;
    }

    /// Payload bytes.
    pub fn data_bytes(&self) -> &[u8] {
        &self.data_bytes
    }

    /// Set the payload bytes, updating the data length and DLC.
    pub fn set_data_bytes(&mut self, data: &[u8]) {
        self.set_data_length(data.len() as u8);
        for (position, byte) in data.iter().take(self.data_bytes.len()).enumerate() {
            self.data_bytes[position] = *byte;
        }
    }

    /// Payload size the DLC addresses, or 0 for an out-of-range code.
    pub fn dlc_to_length(dlc: u8) -> usize {
        DLC_TO_LENGTH.get(dlc as usize).copied().unwrap_or(0)
    }

    fn flag(&self, bit: u16) -> bool {
        self.flags & (1 << bit) != 0
    }

    fn set_flag(&mut self, bit: u16, value: bool) {
        if value {
            self.flags |= 1 << bit;
        } else {
            self.flags &= !(1 << bit);
        }
    }

    /// Direction: true when the frame was transmitted, false when received.
    pub fn dir(&self) -> bool {
        self.flag(DIR_BIT)
    }

    pub fn set_dir(&mut self, transmit: bool) {
        self.set_flag(DIR_BIT, transmit);
    }

    pub fn srr(&self) -> bool {
        self.flag(SRR_BIT)
    }

    pub fn set_srr(&mut self, srr: bool) {
        self.set_flag(SRR_BIT, srr);
    }

    /// Extended data length (CAN FD).
    pub fn edl(&self) -> bool {
        self.flag(EDL_BIT)
    }

    pub fn set_edl(&mut self, edl: bool) {
        self.set_flag(EDL_BIT, edl);
    }

    /// Bit rate switch (CAN FD).
    pub fn brs(&self) -> bool {
        self.flag(BRS_BIT)
    }

    pub fn set_brs(&mut self, brs: bool) {
        self.set_flag(BRS_BIT, brs);
    }

    /// Error state indicator (CAN FD).
    pub fn esi(&self) -> bool {
        self.flag(ESI_BIT)
    }

    pub fn set_esi(&mut self, esi: bool) {
        self.set_flag(ESI_BIT, esi);
    }

    /// Remote frame request.
    pub fn rtr(&self) -> bool {
        self.flag(RTR_BIT)
    }

    pub fn set_rtr(&mut self, rtr: bool) {
        self.set_flag(RTR_BIT, rtr);
    }

    pub fn r0(&self) -> bool {
        self.flag(R0_BIT)
    }

    pub fn set_r0(&mut self, flag: bool) {
        self.set_flag(R0_BIT, flag);
    }

    pub fn r1(&self) -> bool {
        self.flag(R1_BIT)
    }

    pub fn set_r1(&mut self, flag: bool) {
        self.set_flag(R1_BIT, flag);
    }

    /// Bus wake-up status.
    pub fn wake_up(&self) -> bool {
        self.flag(WAKE_UP_BIT)
    }

    pub fn set_wake_up(&mut self, wake_up: bool) {
        self.set_flag(WAKE_UP_BIT, wake_up);
    }

    /// Single-wire CAN bus.
    pub fn single_wire(&self) -> bool {
        self.flag(SINGLE_WIRE_BIT)
    }

    pub fn set_single_wire(&mut self, single_wire: bool) {
        self.set_flag(SINGLE_WIRE_BIT, single_wire);
    }

    /// Frame duration in nanoseconds.
    pub fn frame_duration(&self) -> u32 {
        self.frame_duration
    }

    pub fn set_frame_duration(&mut self, duration: u32) {
        self.frame_duration = duration;
    }

    pub(crate) fn serialized_size(&self) -> u32 {
        CAN_DATA_FRAME_SIZE + self.data_bytes.len() as u32
    }

    pub(crate) fn write_payload(&self, dest: &mut [u8]) -> BusResult<()> {
        if dest.len() != self.serialized_size() as usize {
            return Err(BusError::Encode(format!(
                "mismatching message sizes ({}/{})",
                dest.len(),
                self.serialized_size()
            )));
        }

        LittleBuffer::new(self.message_id).write_into(dest, 18)?;
        dest[22] = self.dlc;
        dest[23] = self.data_length();
        LittleBuffer::new(self.crc).write_into(dest, 24)?;
        dest[28] = (self.flags & 0xFF) as u8;
        dest[29] = (self.flags >> 8) as u8;
        LittleBuffer::new(self.frame_duration).write_into(dest, 30)?;
        dest[34..].copy_from_slice(&self.data_bytes);
        Ok(())
    }

    pub(crate) fn read_payload(&mut self, source: &[u8]) -> BusResult<()> {
        if source.len() < CAN_DATA_FRAME_SIZE as usize {
            return Err(BusError::Decode(format!(
                "CAN data frame message is too small ({}/{CAN_DATA_FRAME_SIZE})",
                source.len()
            )));
        }

        let message_id: LittleBuffer<u32> = LittleBuffer::from_slice(source, 18)?;
        self.set_message_id(message_id.value());

        self.dlc = source[22];
        let data_length = source[23] as usize;

        let crc: LittleBuffer<u32> = LittleBuffer::from_slice(source, 24)?;
        self.crc = crc.value();

        self.flags = source[28] as u16 | ((source[29] as u16) << 8);

        let duration: LittleBuffer<u32> = LittleBuffer::from_slice(source, 30)?;
        self.frame_duration = duration.value();

        let end = 34 + data_length;
        let data = source.get(34..end).ok_or_else(|| {
            BusError::Decode(format!(
                "data out-of-bound, length {data_length} in a {} byte frame",
                source.len()
            ))
        })?;
        self.data_bytes.clear();
        self.data_bytes.extend_from_slice(data);
        Ok(())
    }
}

/// CAN accessors on the generic message.
///
/// Getters return the field defaults and setters are ignored when the
/// message does not carry a CAN data frame payload. The setters that change
/// the payload size keep the message `size` cell in sync.
impl BusMessage {
    pub fn message_id(&self) -> u32 {
        self.can_data().map_or(0, CanDataFrame::message_id)
    }

    pub fn set_message_id(&mut self, message_id: u32) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_message_id(message_id);
        }
    }

    pub fn can_id(&self) -> u32 {
        self.can_data().map_or(0, CanDataFrame::can_id)
    }

    pub fn set_can_id(&mut self, can_id: u32) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_can_id(can_id);
        }
    }

    pub fn extended_id(&self) -> bool {
        self.can_data().is_some_and(CanDataFrame::extended_id)
    }

    pub fn set_extended_id(&mut self, extended: bool) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_extended_id(extended);
        }
    }

    pub fn dlc(&self) -> u8 {
        self.can_data().map_or(0, CanDataFrame::dlc)
    }

    pub fn set_dlc(&mut self, dlc: u8) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_dlc(dlc);
        }
    }

    pub fn crc(&self) -> u32 {
        self.can_data().map_or(0, CanDataFrame::crc)
    }

    pub fn set_crc(&mut self, crc: u32) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_crc(crc);
        }
    }

    pub fn data_length(&self) -> u8 {
        self.can_data().map_or(0, CanDataFrame::data_length)
    }

    pub fn set_data_length(&mut self, data_length: u8) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_data_length(data_length);
            let size = frame.serialized_size();
            self.set_size(size);
        }
    }

    pub fn data_bytes(&self) -> &[u8] {
        self.can_data().map_or(&[], CanDataFrame::data_bytes)
    }

    pub fn set_data_bytes(&mut self, data: &[u8]) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_data_bytes(data);
            let size = frame.serialized_size();
            self.set_size(size);
        }
    }

    pub fn frame_duration(&self) -> u32 {
        self.can_data().map_or(0, CanDataFrame::frame_duration)
    }

    pub fn set_frame_duration(&mut self, duration: u32) {
        if let Some(frame) = self.can_data_mut() {
            frame.set_frame_duration(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BusMessage, BusMessageType};

    fn data_frame() -> BusMessage {
        BusMessage::new(BusMessageType::CanDataFrame)
    }

    #[test]
    fn test_extended_id_derived_from_wide_can_id() {
        let mut frame = CanDataFrame::default();
        frame.set_message_id(0x123);
        assert!(!frame.extended_id());
        assert_eq!(frame.can_id(), 0x123);

        frame.set_message_id(0x800);
        assert!(frame.extended_id());
        assert_eq!(frame.can_id(), 0x800);

        frame.set_can_id(0x1FFF_FFFF);
        assert!(frame.extended_id());
        assert_eq!(frame.can_id(), 0x1FFF_FFFF);
    }

    #[test]
    fn test_dlc_is_smallest_sufficient_code() {
        let mut frame = CanDataFrame::default();
        for (dlc, length) in DLC_TO_LENGTH.iter().enumerate() {
            frame.set_data_length(*length as u8);
            assert_eq!(frame.dlc(), dlc as u8, "exact table length {length}");
        }

        // Lengths between table entries round up to the next code.
        frame.set_data_length(9);
        assert_eq!(frame.dlc(), 9); // table[9] == 12
        frame.set_data_length(33);
        assert_eq!(frame.dlc(), 14); // table[14] == 48

        assert_eq!(CanDataFrame::dlc_to_length(8), 8);
        assert_eq!(CanDataFrame::dlc_to_length(15), 64);
        assert_eq!(CanDataFrame::dlc_to_length(16), 0);
    }

    #[test]
    fn test_round_trip_every_field() {
        crate::logsink::install_null_sink();
        let mut msg = data_frame();
        msg.set_timestamp(123_456_789);
        msg.set_bus_channel(2);
        msg.set_message_id(1234 | EXTENDED_ID_BIT);
        msg.set_crc(0x12345);
        msg.set_frame_duration(123);
        msg.set_data_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        {
            let frame = msg.can_data_mut().expect("data frame payload");
            frame.set_dir(true);
            frame.set_srr(true);
            frame.set_edl(true);
            frame.set_brs(true);
            frame.set_esi(true);
            frame.set_rtr(true);
            frame.set_r0(true);
            frame.set_r1(true);
            frame.set_wake_up(true);
            frame.set_single_wire(true);
        }

        let mut raw = Vec::new();
        msg.to_raw(&mut raw);
        assert!(msg.valid());
        assert_eq!(raw.len(), 34 + 8);
        assert_eq!(msg.size(), 42);

        let mut back = data_frame();
        back.from_raw(&raw);
        assert!(back.valid());
        assert_eq!(back, msg);

        let frame = back.can_data().expect("data frame payload");
        assert_eq!(frame.message_id(), 1234 | EXTENDED_ID_BIT);
        assert_eq!(frame.can_id(), 1234);
        assert!(frame.extended_id());
        assert_eq!(frame.crc(), 0x12345);
        assert_eq!(frame.frame_duration(), 123);
        assert_eq!(frame.data_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(frame.dir() && frame.srr() && frame.edl() && frame.brs() && frame.esi());
        assert!(frame.rtr() && frame.r0() && frame.r1());
        assert!(frame.wake_up() && frame.single_wire());
    }

    #[test]
    fn test_flag_byte_layout() {
        crate::logsink::install_null_sink();
        let mut msg = data_frame();
        {
            let frame = msg.can_data_mut().expect("data frame payload");
            frame.set_dir(true);
            frame.set_rtr(true);
            frame.set_r1(true);
            frame.set_single_wire(true);
        }

        let mut raw = Vec::new();
        msg.to_raw(&mut raw);
        assert_eq!(raw[28], 0b1010_0001); // dir, rtr, r1
        assert_eq!(raw[29], 0b0000_0010); // single_wire
    }

    #[test]
    fn test_truncated_payload_marks_invalid() {
        crate::logsink::install_null_sink();
        let mut msg = data_frame();
        msg.set_data_bytes(&[1, 2, 3, 4]);
        let mut raw = Vec::new();
        msg.to_raw(&mut raw);

        // Chop off the data bytes but keep the declared length.
        raw.truncate(34);
        raw[4] = 34; // keep the declared size consistent with the source

        let mut back = data_frame();
        back.from_raw(&raw);
        assert!(!back.valid());
    }

    #[test]
    fn test_size_tracks_data_length() {
        let mut msg = data_frame();
        assert_eq!(msg.size(), CAN_DATA_FRAME_SIZE);
        msg.set_data_length(64);
        assert_eq!(msg.size(), CAN_DATA_FRAME_SIZE + 64);
        assert_eq!(msg.dlc(), 15);
    }
}
