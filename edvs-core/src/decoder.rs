//! Stateful eDVS frame decoder.
//!
//! This module turns a byte stream into pixel events and special blocks. Bytes
//! belonging to an incomplete trailing record are carried over to the next
//! call, so the stream may be fed in arbitrarily sized chunks.

use crate::parser;
use crate::types::{RawEvent, SpecialBlock, TimestampMode};
use tracing::{debug, warn};

/// Counters for anomalies the decoder recovered from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Bytes skipped because the event marker bit was missing
    pub framing_slips: u64,
    /// Special blocks whose length nibble was smaller than the timestamp field
    pub malformed_specials: u64,
    /// Pixel events decoded so far
    pub events: u64,
    /// Special blocks decoded so far
    pub specials: u64,
}

/// Output of one [`FrameDecoder::decode`] call.
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Decoded pixel events in arrival order
    pub events: Vec<RawEvent>,
    /// Decoded special blocks in arrival order
    pub specials: Vec<SpecialBlock>,
    /// Bytes of carry + input that were consumed by complete records or skipped
    pub consumed: usize,
}

/// Decodes all complete records at the front of `buffer`.
///
/// Returns the number of bytes consumed. Everything after that offset is the
/// start of a record that is not yet complete. A first header byte without the
/// event marker is a framing slip: exactly one byte is skipped and decoding
/// resumes at the next byte.
pub fn decode_frames(
    buffer: &[u8],
    mode: TimestampMode,
    events: &mut Vec<RawEvent>,
    specials: &mut Vec<SpecialBlock>,
    stats: &mut DecodeStats,
) -> usize {
    let ts_bytes = mode.timestamp_bytes();
    let event_len = mode.event_len();
    let mut i = 0;

    while buffer.len() - i >= 2 {
        let a = buffer[i];
        let b = buffer[i + 1];

        if parser::is_special_header(a, b) {
            // Header, length nibble and timestamp must be present to size the record
            if buffer.len() - i < 3 + ts_bytes {
                break;
            }
            let nibble = parser::special_get_length(buffer[i + 2]);
            let announced = parser::special_payload_len(nibble, mode);
            let payload_len = announced.unwrap_or(0);
            let record_len = 3 + ts_bytes + payload_len;
            if buffer.len() - i < record_len {
                break;
            }
            if announced.is_none() {
                stats.malformed_specials += 1;
                warn!(
                    nibble,
                    timestamp_bytes = ts_bytes,
                    "special block length shorter than timestamp field, assuming empty payload"
                );
            }
            let ts_start = i + 3;
            let timestamp = parser::read_timestamp(&buffer[ts_start..], mode);
            let payload_start = ts_start + ts_bytes;
            specials.push(SpecialBlock::new(
                timestamp,
                &buffer[payload_start..payload_start + payload_len],
            ));
            stats.specials += 1;
            i += record_len;
            continue;
        }

        if !parser::has_event_marker(a) {
            // The link dropped a byte somewhere, realign on the next one
            stats.framing_slips += 1;
            debug!(offset = i, byte = a, "missing event marker, skipping one byte");
            i += 1;
            continue;
        }

        if buffer.len() - i < event_len {
            break;
        }
        let timestamp = parser::read_timestamp(&buffer[i + 2..], mode);
        events.push(RawEvent::new(
            timestamp,
            parser::event_get_x(b),
            parser::event_get_y(a),
            parser::event_get_polarity(b),
        ));
        stats.events += 1;
        i += event_len;
    }

    i
}

/// Stateful decoder for one byte stream.
///
/// Owns the carry buffer holding the tail of an incomplete record between
/// calls. A decoder is never shared between sources.
#[derive(Debug)]
pub struct FrameDecoder {
    mode: TimestampMode,
    carry: Vec<u8>,
    stats: DecodeStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(TimestampMode::default())
    }
}

impl FrameDecoder {
    /// Creates a decoder for the given timestamp width.
    pub fn new(mode: TimestampMode) -> Self {
        Self {
            mode,
            carry: Vec::new(),
            stats: DecodeStats::default(),
        }
    }

    /// Timestamp width this decoder expects.
    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    /// Number of bytes waiting for the rest of their record.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Recovery counters accumulated since creation or the last reset.
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Drops carried bytes and counters.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.stats = DecodeStats::default();
    }

    /// Decodes `bytes` appended to the carried tail of previous calls.
    pub fn decode(&mut self, bytes: &[u8]) -> DecodedFrames {
        let mut frames = DecodedFrames::default();
        frames.consumed = self.decode_into(bytes, &mut frames.events, &mut frames.specials);
        frames
    }

    /// Like [`decode`](Self::decode), appending to caller-owned buffers.
    ///
    /// Returns the number of carry + input bytes consumed.
    pub fn decode_into(
        &mut self,
        bytes: &[u8],
        events: &mut Vec<RawEvent>,
        specials: &mut Vec<SpecialBlock>,
    ) -> usize {
        self.carry.extend_from_slice(bytes);
        let slips_before = self.stats.framing_slips;

        let consumed = decode_frames(&self.carry, self.mode, events, specials, &mut self.stats);
        self.carry.drain(..consumed);

        let skipped = self.stats.framing_slips - slips_before;
        if skipped > 0 {
            warn!(skipped, "skipped bytes while resynchronizing on event marker");
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{encode_event, encode_special};

    fn encode_all(events: &[RawEvent], mode: TimestampMode) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            encode_event(&mut out, event, mode);
        }
        out
    }

    fn sample_events() -> Vec<RawEvent> {
        vec![
            RawEvent::new(100, 10, 20, true),
            RawEvent::new(150, 127, 0, false),
            RawEvent::new(0xFFFFFF, 0, 127, true),
            RawEvent::new(3, 64, 64, false),
        ]
    }

    #[test]
    fn test_decode_simple_sequence() {
        // 1yyyyyyy pxxxxxxx tttttttt tttttttt tttttttt
        let bytes = [0x80 | 50, 0x80 | 100, 0x00, 0x01, 0x00];
        let mut decoder = FrameDecoder::new(TimestampMode::Bits24);
        let frames = decoder.decode(&bytes);

        assert_eq!(frames.events, vec![RawEvent::new(256, 100, 50, true)]);
        assert!(frames.specials.is_empty());
        assert_eq!(frames.consumed, 5);
        assert_eq!(decoder.carry_len(), 0);
    }

    #[test]
    fn test_decode_without_timestamps() {
        let events = vec![RawEvent::new(0, 1, 2, false), RawEvent::new(0, 3, 4, true)];
        let bytes = encode_all(&events, TimestampMode::None);
        let mut decoder = FrameDecoder::new(TimestampMode::None);
        let frames = decoder.decode(&bytes);
        assert_eq!(frames.events, events);
        assert_eq!(frames.consumed, 4);
    }

    #[test]
    fn test_decode_exact_records_leave_no_carry() {
        for mode in [
            TimestampMode::Bits16,
            TimestampMode::Bits24,
            TimestampMode::Bits32,
        ] {
            let events: Vec<RawEvent> = sample_events()
                .into_iter()
                .map(|mut e| {
                    e.device_timestamp &= (mode.wrap_limit() - 1) as u32;
                    e
                })
                .collect();
            let bytes = encode_all(&events, mode);
            let mut decoder = FrameDecoder::new(mode);
            let frames = decoder.decode(&bytes);
            assert_eq!(frames.events, events, "mode {:?}", mode);
            assert_eq!(frames.consumed, bytes.len());
            assert_eq!(decoder.carry_len(), 0);
        }
    }

    #[test]
    fn test_decode_carries_partial_record() {
        let events = sample_events();
        let bytes = encode_all(&events, TimestampMode::Bits24);
        let mut decoder = FrameDecoder::new(TimestampMode::Bits24);

        let first = decoder.decode(&bytes[..7]);
        assert_eq!(first.events, events[..1].to_vec());
        assert_eq!(first.consumed, 5);
        assert_eq!(decoder.carry_len(), 2);

        let second = decoder.decode(&bytes[7..]);
        assert_eq!(second.events, events[1..].to_vec());
        assert_eq!(decoder.carry_len(), 0);
    }

    #[test]
    fn test_decode_recovers_from_framing_slip() {
        let events = sample_events();
        let mut bytes = encode_all(&events[..1], TimestampMode::Bits24);
        bytes.push(0x12); // spurious byte without the marker bit
        bytes.extend(encode_all(&events[1..], TimestampMode::Bits24));

        let mut decoder = FrameDecoder::new(TimestampMode::Bits24);
        let frames = decoder.decode(&bytes);
        assert_eq!(frames.events, events);
        assert_eq!(decoder.stats().framing_slips, 1);
        assert_eq!(frames.consumed, bytes.len());
    }

    #[test]
    fn test_decode_special_block() {
        let mode = TimestampMode::Bits24;
        let mut bytes = Vec::new();
        encode_event(&mut bytes, &RawEvent::new(10, 1, 1, true), mode);
        encode_special(&mut bytes, &SpecialBlock::new(11, &[0xAA, 0xBB, 0xCC]), mode);
        encode_event(&mut bytes, &RawEvent::new(12, 2, 2, false), mode);

        let mut decoder = FrameDecoder::new(mode);
        let frames = decoder.decode(&bytes);
        assert_eq!(frames.events.len(), 2);
        assert_eq!(frames.specials.len(), 1);
        assert_eq!(frames.specials[0].device_timestamp, 11);
        assert_eq!(frames.specials[0].payload(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(decoder.stats().specials, 1);
        assert_eq!(decoder.carry_len(), 0);
    }

    #[test]
    fn test_decode_special_split_across_calls() {
        let mode = TimestampMode::Bits16;
        let mut bytes = Vec::new();
        encode_special(&mut bytes, &SpecialBlock::new(0x0203, &[1, 2, 3, 4]), mode);

        let mut decoder = FrameDecoder::new(mode);
        assert!(decoder.decode(&bytes[..6]).specials.is_empty());
        let frames = decoder.decode(&bytes[6..]);
        assert_eq!(frames.specials.len(), 1);
        assert_eq!(frames.specials[0].payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_malformed_special_assumes_empty_payload() {
        let mode = TimestampMode::Bits24;
        // length nibble 1 cannot cover a 3 byte timestamp
        let mut bytes = vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x07];
        encode_event(&mut bytes, &RawEvent::new(9, 3, 4, true), mode);

        let mut decoder = FrameDecoder::new(mode);
        let frames = decoder.decode(&bytes);
        assert_eq!(decoder.stats().malformed_specials, 1);
        assert_eq!(frames.specials.len(), 1);
        assert!(frames.specials[0].payload().is_empty());
        assert_eq!(frames.specials[0].device_timestamp, 7);
        assert_eq!(frames.events, vec![RawEvent::new(9, 3, 4, true)]);
    }

    #[test]
    fn test_decoder_reset() {
        let mut decoder = FrameDecoder::new(TimestampMode::Bits24);
        decoder.decode(&[0x80, 0x80, 0x00]);
        assert_eq!(decoder.carry_len(), 3);
        decoder.reset();
        assert_eq!(decoder.carry_len(), 0);
        assert_eq!(decoder.stats(), DecodeStats::default());
    }
}
