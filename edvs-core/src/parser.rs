#![allow(clippy::unusual_byte_groupings)]
//! Low-level parsing of eDVS wire records.
//!
//! Every record starts with two header bytes followed by an optional
//! big-endian timestamp field whose width depends on the [`TimestampMode`]:
//!
//! ```text
//! pixel event:   1yyyyyyy pxxxxxxx [timestamp]
//! special block: 00000000 00000000 ----llll [timestamp] [payload]
//! ```
//!
//! The length nibble of a special block counts the timestamp and payload bytes
//! together. The encoders here produce byte streams in the same layout and are
//! used to simulate devices.

use crate::types::{RawEvent, SpecialBlock, TimestampMode};
use byteorder::{BigEndian, ByteOrder};

/// Bit 7 of the first header byte marks a pixel event.
pub const EVENT_MARKER: u8 = 0x80;

const LOWER_BITS_MASK: u8 = 0x7F;
const LENGTH_NIBBLE_MASK: u8 = 0x0F;

/// Returns true if the first header byte carries the event marker.
#[inline]
pub fn has_event_marker(a: u8) -> bool {
    a & EVENT_MARKER != 0
}

/// Returns true if the two header bytes open a special block.
#[inline]
pub fn is_special_header(a: u8, b: u8) -> bool {
    a == 0 && b == 0
}

/// Extracts the Y coordinate from the first header byte.
#[inline]
pub fn event_get_y(a: u8) -> u8 {
    a & LOWER_BITS_MASK // bits 6:0
}

/// Extracts the X coordinate from the second header byte.
#[inline]
pub fn event_get_x(b: u8) -> u8 {
    b & LOWER_BITS_MASK // bits 6:0
}

/// Extracts the polarity from the second header byte.
#[inline]
pub fn event_get_polarity(b: u8) -> bool {
    b & EVENT_MARKER != 0 // bit 7
}

/// Extracts the raw length nibble (timestamp + payload bytes) of a special block.
#[inline]
pub fn special_get_length(c: u8) -> u8 {
    c & LENGTH_NIBBLE_MASK // bits 3:0
}

/// Number of payload bytes announced by a length nibble.
///
/// Returns `None` if the nibble is smaller than the timestamp field it must
/// include.
#[inline]
pub fn special_payload_len(nibble: u8, mode: TimestampMode) -> Option<usize> {
    (nibble as usize).checked_sub(mode.timestamp_bytes())
}

/// Reads a big-endian timestamp of the mode's width from the front of `bytes`.
///
/// `bytes` must hold at least [`TimestampMode::timestamp_bytes`] bytes.
#[inline]
pub fn read_timestamp(bytes: &[u8], mode: TimestampMode) -> u32 {
    match mode {
        TimestampMode::None => 0,
        TimestampMode::Bits16 => BigEndian::read_u16(bytes) as u32,
        TimestampMode::Bits24 => BigEndian::read_u24(bytes),
        TimestampMode::Bits32 => BigEndian::read_u32(bytes),
    }
}

/// Appends a big-endian timestamp of the mode's width, dropping high bits that do not fit.
pub fn write_timestamp(out: &mut Vec<u8>, timestamp: u32, mode: TimestampMode) {
    let mut buf = [0u8; 4];
    match mode {
        TimestampMode::None => {}
        TimestampMode::Bits16 => BigEndian::write_u16(&mut buf, timestamp as u16),
        TimestampMode::Bits24 => BigEndian::write_u24(&mut buf, timestamp & 0x00FF_FFFF),
        TimestampMode::Bits32 => BigEndian::write_u32(&mut buf, timestamp),
    }
    out.extend_from_slice(&buf[..mode.timestamp_bytes()]);
}

/// Encodes a pixel event record.
pub fn encode_event(out: &mut Vec<u8>, event: &RawEvent, mode: TimestampMode) {
    let a = EVENT_MARKER | (event.y & LOWER_BITS_MASK);
    let b = (event.x & LOWER_BITS_MASK) | if event.polarity { EVENT_MARKER } else { 0 };
    out.push(a);
    out.push(b);
    write_timestamp(out, event.device_timestamp, mode);
}

/// Encodes a special block record.
///
/// The payload is cut to what the 4-bit length field can announce for this mode.
pub fn encode_special(out: &mut Vec<u8>, block: &SpecialBlock, mode: TimestampMode) {
    let max_payload = LENGTH_NIBBLE_MASK as usize - mode.timestamp_bytes();
    let payload = &block.payload()[..block.payload().len().min(max_payload)];
    out.push(0);
    out.push(0);
    out.push((mode.timestamp_bytes() + payload.len()) as u8);
    write_timestamp(out, block.device_timestamp, mode);
    out.extend_from_slice(payload);
}
