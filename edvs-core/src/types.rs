//! Core types for eDVS event data.
//!
//! This module defines the raw records produced by the frame decoder, the
//! reconciled events consumed downstream, and the device modes that select the
//! wire layout and the timestamp reconciliation policy.

/// Maximum number of payload bytes carried by a special block.
pub const MAX_SPECIAL_PAYLOAD: usize = 16;

/// A pixel event exactly as it arrived on the wire.
///
/// The timestamp is device-local and wraps at the width selected by the
/// [`TimestampMode`]. Raw events are not globally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Device timestamp in microseconds (wrapping)
    pub device_timestamp: u32,
    /// X coordinate of the pixel (0-127)
    pub x: u8,
    /// Y coordinate of the pixel (0-127)
    pub y: u8,
    /// Event polarity: true = ON (increase in brightness)
    pub polarity: bool,
}

impl RawEvent {
    /// Creates a new raw event.
    #[inline]
    pub fn new(device_timestamp: u32, x: u8, y: u8, polarity: bool) -> Self {
        Self {
            device_timestamp,
            x,
            y,
            polarity,
        }
    }
}

/// An out-of-band device message interleaved with the pixel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialBlock {
    /// Device timestamp in microseconds (wrapping)
    pub device_timestamp: u32,
    /// Id of the source that produced the block
    pub id: u8,
    len: u8,
    data: [u8; MAX_SPECIAL_PAYLOAD],
}

impl SpecialBlock {
    /// Creates a special block, truncating the payload to [`MAX_SPECIAL_PAYLOAD`] bytes.
    pub fn new(device_timestamp: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_SPECIAL_PAYLOAD);
        let mut data = [0u8; MAX_SPECIAL_PAYLOAD];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            device_timestamp,
            id: 0,
            len: len as u8,
            data,
        }
    }

    /// Tags the block with a source id.
    #[inline]
    pub fn with_id(mut self, id: u8) -> Self {
        self.id = id;
        self
    }

    /// Payload bytes following the timestamp field.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// A reconciled event with a monotonic host timestamp.
///
/// Within one source, `timestamp` never decreases across consecutive events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Event {
    /// Host timestamp in microseconds
    pub timestamp: u64,
    /// X coordinate of the pixel
    pub x: u16,
    /// Y coordinate of the pixel
    pub y: u16,
    /// Event polarity: true = ON (increase in brightness)
    pub polarity: bool,
    /// Id of the source that produced the event
    pub id: u8,
}

impl Event {
    /// Creates a new event.
    #[inline]
    pub fn new(timestamp: u64, x: u16, y: u16, polarity: bool, id: u8) -> Self {
        Self {
            timestamp,
            x,
            y,
            polarity,
            id,
        }
    }

    /// Lifts a raw event to host time.
    #[inline]
    pub fn from_raw(raw: &RawEvent, timestamp: u64, id: u8) -> Self {
        Self::new(timestamp, raw.x as u16, raw.y as u16, raw.polarity, id)
    }
}

/// Width of the timestamp field the device appends to every record.
///
/// Selected on the device with the `!E0`..`!E3` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TimestampMode {
    /// No timestamp field (E0)
    None = 0,
    /// 16 bit timestamps (E1)
    Bits16 = 1,
    /// 24 bit timestamps (E2)
    #[default]
    Bits24 = 2,
    /// 32 bit timestamps (E3)
    Bits32 = 3,
}

impl TimestampMode {
    /// Parses a mode from its device number (0-3).
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Bits16),
            2 => Some(Self::Bits24),
            3 => Some(Self::Bits32),
            _ => None,
        }
    }

    /// Number of trailing timestamp bytes per record.
    #[inline]
    pub fn timestamp_bytes(self) -> usize {
        match self {
            Self::None => 0,
            Self::Bits16 => 2,
            Self::Bits24 => 3,
            Self::Bits32 => 4,
        }
    }

    /// Value at which the device counter wraps back to zero (0 when there is no counter).
    #[inline]
    pub fn wrap_limit(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Bits16 => 1 << 16,
            Self::Bits24 => 1 << 24,
            Self::Bits32 => 1 << 32,
        }
    }

    /// Size of one pixel event record in bytes.
    #[inline]
    pub fn event_len(self) -> usize {
        2 + self.timestamp_bytes()
    }

    /// Device command selecting this mode.
    pub fn command(self) -> &'static str {
        match self {
            Self::None => "!E0",
            Self::Bits16 => "!E1",
            Self::Bits24 => "!E2",
            Self::Bits32 => "!E3",
        }
    }
}

/// Policy for turning device timestamps into host timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Device timestamps are passed through without unwrapping
    Raw,
    /// Device deltas are accumulated across wraps
    #[default]
    Incremental,
    /// Each batch is rescaled so that its last event lands on the host clock
    SystemTime,
}

/// Role of a device in synchronized multi-sensor capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncRole {
    /// Free running, no synchronization
    #[default]
    Standalone,
    /// Gives the start signal to all slaves
    Master,
    /// Waits for the master's start signal
    Slave,
}

impl SyncRole {
    /// Command arming the device for its role, if any.
    pub fn arm_command(self) -> Option<&'static str> {
        match self {
            Self::Standalone => None,
            Self::Master => Some("!ETM0"),
            Self::Slave => Some("!ETS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_mode_parsing() {
        assert_eq!(TimestampMode::from_u8(0), Some(TimestampMode::None));
        assert_eq!(TimestampMode::from_u8(2), Some(TimestampMode::Bits24));
        assert_eq!(TimestampMode::from_u8(3), Some(TimestampMode::Bits32));
        assert_eq!(TimestampMode::from_u8(4), None);
    }

    #[test]
    fn test_timestamp_mode_layout() {
        assert_eq!(TimestampMode::None.event_len(), 2);
        assert_eq!(TimestampMode::Bits16.event_len(), 4);
        assert_eq!(TimestampMode::Bits24.event_len(), 5);
        assert_eq!(TimestampMode::Bits32.event_len(), 6);
        assert_eq!(TimestampMode::Bits24.wrap_limit(), 16_777_216);
        assert_eq!(TimestampMode::Bits16.command(), "!E1");
    }

    #[test]
    fn test_special_block_truncates_payload() {
        let block = SpecialBlock::new(7, &[1u8; 20]);
        assert_eq!(block.payload().len(), MAX_SPECIAL_PAYLOAD);

        let block = SpecialBlock::new(7, &[1, 2, 3]);
        assert_eq!(block.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_event_from_raw() {
        let raw = RawEvent::new(500, 12, 99, true);
        let event = Event::from_raw(&raw, 1234, 3);
        assert_eq!(event, Event::new(1234, 12, 99, true, 3));
    }
}
