//! The polling contract shared by live readers, file playback and the merger.

use crate::output::OutputError;
use crate::types::{Event, SpecialBlock, SyncRole};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::warn;

/// Special blocks a source keeps until they are taken. Older ones are dropped.
pub const MAX_PENDING_SPECIALS: usize = 4096;

/// Errors surfaced to the consumer of an event source.
///
/// Decoding and reconciliation anomalies are recovered locally and never
/// appear here. A source that returned an error should be recreated.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Device link closed")]
    Disconnected,

    #[error("Source does not accept commands")]
    NotWritable,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<OutputError> for StreamError {
    fn from(e: OutputError) -> Self {
        match e {
            OutputError::Io(e) => StreamError::Transport(e),
            OutputError::InvalidFormat(msg) => {
                StreamError::Transport(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
            }
        }
    }
}

/// A pollable producer of host-time ordered events.
pub trait EventSource: Send {
    /// Returns all events that became available since the last call.
    ///
    /// Never blocks on I/O. Events are in non-decreasing timestamp order.
    fn poll(&mut self) -> Result<Vec<Event>, StreamError>;

    /// Timestamp of the most recently returned event, `None` before the first one.
    fn last_delivered(&self) -> Option<u64>;

    /// True once a finite source has delivered everything. Live devices never are.
    fn is_exhausted(&self) -> bool;

    /// Special blocks received since the last call, tagged with the source id.
    ///
    /// At most [`MAX_PENDING_SPECIALS`] are kept between calls.
    fn take_specials(&mut self) -> Vec<SpecialBlock> {
        Vec::new()
    }

    /// Synchronization role of the underlying device.
    fn sync_role(&self) -> SyncRole {
        SyncRole::Standalone
    }

    /// Starts event delivery.
    fn start(&mut self) -> Result<(), StreamError>;

    /// Sends a command line to the device.
    fn write(&mut self, command: &str) -> Result<(), StreamError>;

    /// Stops event delivery and releases the transport.
    fn stop(&mut self) -> Result<(), StreamError>;
}

/// Terminates a device command with a newline if it lacks one.
pub fn command_line(command: &str) -> Vec<u8> {
    let mut line = command.as_bytes().to_vec();
    if !line.ends_with(b"\n") {
        line.push(b'\n');
    }
    line
}

/// Bounded buffer of special blocks awaiting [`EventSource::take_specials`].
#[derive(Debug, Default)]
pub(crate) struct SpecialQueue {
    blocks: VecDeque<SpecialBlock>,
    dropped: u64,
}

impl SpecialQueue {
    pub(crate) fn extend<I: IntoIterator<Item = SpecialBlock>>(&mut self, blocks: I) {
        for block in blocks {
            if self.blocks.len() == MAX_PENDING_SPECIALS {
                self.blocks.pop_front();
                if self.dropped == 0 {
                    warn!(
                        capacity = MAX_PENDING_SPECIALS,
                        "special blocks are not being consumed, dropping the oldest"
                    );
                }
                self.dropped += 1;
            }
            self.blocks.push_back(block);
        }
    }

    pub(crate) fn take(&mut self) -> Vec<SpecialBlock> {
        self.blocks.drain(..).collect()
    }

    /// Blocks discarded because the queue was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}
