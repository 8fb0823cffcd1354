//! Synchronous acquisition from one device.
//!
//! A [`DeviceStream`] owns the transport, the frame decoder and the timestamp
//! reconciler of a single sensor. Each read pulls whatever bytes the transport
//! has, decodes complete records and returns them with host timestamps.

use crate::decoder::{DecodeStats, FrameDecoder};
use crate::reconcile::{ReconcileStats, TimestampReconciler};
use crate::source::{command_line, EventSource, SpecialQueue, StreamError};
use crate::transport::ByteSource;
use crate::types::{ClockMode, Event, RawEvent, SpecialBlock, SyncRole, TimestampMode};
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Resets the device.
pub const CMD_RESET: &str = "R";
/// Starts event transmission.
pub const CMD_START: &str = "E+";
/// Stops event transmission.
pub const CMD_STOP: &str = "E-";
/// Master start signal for synchronized capture.
pub const CMD_MASTER_GO: &str = "!ETM+";

const START_ECHO: &[u8] = b"E+\n";
const RESET_SETTLE: Duration = Duration::from_millis(200);
const ECHO_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Smallest read buffer that still fits the largest record.
const MIN_BUFFER_SIZE: usize = 32;

/// Device acquisition settings.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Timestamp width selected on the device
    pub timestamp_mode: TimestampMode,
    /// Device to host timestamp policy
    pub clock_mode: ClockMode,
    /// Role in synchronized capture
    pub sync_role: SyncRole,
    /// Bytes requested from the transport per read
    pub buffer_size: usize,
    /// Send a reset and wait for the device to settle before configuring it
    pub reset_on_open: bool,
    /// Wait for the device to echo the start command before decoding
    pub await_start_echo: bool,
    /// Upper bound for one blocking read on network and serial links
    pub read_timeout: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            timestamp_mode: TimestampMode::Bits24,
            clock_mode: ClockMode::Incremental,
            sync_role: SyncRole::Standalone,
            buffer_size: 8192,
            reset_on_open: true,
            await_start_echo: false,
            read_timeout: Some(Duration::from_millis(100)),
        }
    }
}

impl DeviceConfig {
    /// Checks that the settings can be used to open a device.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(StreamError::InvalidConfig(format!(
                "buffer size {} is below the minimum of {} bytes",
                self.buffer_size, MIN_BUFFER_SIZE
            )));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(StreamError::InvalidConfig(
                "read timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Events and special blocks produced by one read.
#[derive(Debug, Default)]
pub struct Batch {
    /// Reconciled pixel events
    pub events: Vec<Event>,
    /// Special blocks with device timestamps
    pub specials: Vec<SpecialBlock>,
}

impl Batch {
    /// True if the read produced nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.specials.is_empty()
    }
}

/// Read errors that only mean "no bytes right now".
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// One device link with its decoder and reconciler.
pub struct DeviceStream {
    source: Box<dyn ByteSource>,
    decoder: FrameDecoder,
    reconciler: TimestampReconciler,
    config: DeviceConfig,
    source_id: u8,
    buffer: Vec<u8>,
    epoch: Option<Instant>,
    last_delivered: Option<u64>,
    specials: SpecialQueue,
    stopped: bool,
}

impl DeviceStream {
    /// Configures the device behind `source`: reset, timestamp width and sync role.
    pub fn open(source: Box<dyn ByteSource>, config: DeviceConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let mut stream = Self {
            source,
            decoder: FrameDecoder::new(config.timestamp_mode),
            reconciler: TimestampReconciler::new(config.clock_mode, config.timestamp_mode),
            buffer: vec![0u8; config.buffer_size],
            config,
            source_id: 0,
            epoch: None,
            last_delivered: None,
            specials: SpecialQueue::default(),
            stopped: false,
        };

        if stream.config.reset_on_open {
            stream.send(CMD_RESET)?;
            thread::sleep(RESET_SETTLE);
        }
        stream.send(stream.config.timestamp_mode.command())?;
        if let Some(arm) = stream.config.sync_role.arm_command() {
            info!(role = ?stream.config.sync_role, "arming device");
            stream.send(arm)?;
        }
        Ok(stream)
    }

    /// Tags all further events with `id`.
    pub fn set_source_id(&mut self, id: u8) {
        self.source_id = id;
    }

    /// Id events are tagged with.
    pub fn source_id(&self) -> u8 {
        self.source_id
    }

    /// Settings the device was opened with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Creates an independent handle for sending commands to the device.
    pub fn command_handle(&self) -> Result<Box<dyn ByteSource>, StreamError> {
        Ok(self.source.try_clone()?)
    }

    /// Decoder recovery counters.
    pub fn decode_stats(&self) -> DecodeStats {
        self.decoder.stats()
    }

    /// Reconciler counters.
    pub fn reconcile_stats(&self) -> ReconcileStats {
        self.reconciler.stats()
    }

    fn send(&mut self, command: &str) -> Result<(), StreamError> {
        debug!(command, "sending device command");
        self.source.write_all(&command_line(command))?;
        Ok(())
    }

    /// Microseconds since streaming started.
    fn host_clock(&mut self) -> u64 {
        self.epoch.get_or_insert_with(Instant::now).elapsed().as_micros() as u64
    }

    /// Starts transmission; a master also gives the start signal.
    pub fn start_streaming(&mut self) -> Result<(), StreamError> {
        self.epoch = Some(Instant::now());
        if self.config.sync_role == SyncRole::Master {
            info!("master giving start signal");
            self.send(CMD_MASTER_GO)?;
        }
        info!(id = self.source_id, "starting event transmission");
        self.send(CMD_START)?;
        if self.config.await_start_echo {
            self.wait_for(START_ECHO)?;
        }
        Ok(())
    }

    /// Discards incoming bytes until `pattern` has been seen.
    fn wait_for(&mut self, pattern: &[u8]) -> Result<(), StreamError> {
        let deadline = Instant::now() + ECHO_TIMEOUT;
        let mut matched = 0;
        let mut byte = [0u8; 1];
        while matched < pattern.len() {
            match self.source.read(&mut byte) {
                Ok(0) => return Err(StreamError::Disconnected),
                Ok(_) => {
                    if byte[0] == pattern[matched] {
                        matched += 1;
                    } else {
                        matched = usize::from(byte[0] == pattern[0]);
                    }
                }
                Err(e) if is_transient(&e) => {
                    if Instant::now() >= deadline {
                        return Err(StreamError::Transport(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "device did not acknowledge start command",
                        )));
                    }
                    thread::sleep(IDLE_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reads once from the transport and returns the reconciled records.
    ///
    /// Returns an empty batch if the transport had no bytes (or only part of
    /// a record) ready.
    pub fn read_batch(&mut self) -> Result<Batch, StreamError> {
        let mut batch = Batch::default();
        if self.stopped {
            return Ok(batch);
        }

        let n = match self.source.read(&mut self.buffer) {
            Ok(0) => return Err(StreamError::Disconnected),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(batch),
            Err(e) => return Err(e.into()),
        };

        let mut raw: Vec<RawEvent> = Vec::with_capacity(n / self.config.timestamp_mode.event_len());
        self.decoder
            .decode_into(&self.buffer[..n], &mut raw, &mut batch.specials);
        let id = self.source_id;
        for block in &mut batch.specials {
            block.id = id;
        }
        if raw.is_empty() {
            return Ok(batch);
        }

        let host_now = match self.config.clock_mode {
            ClockMode::SystemTime => Some(self.host_clock()),
            _ => None,
        };
        let host = self.reconciler.reconcile(&raw, host_now);
        batch.events = raw
            .iter()
            .zip(host)
            .map(|(r, t)| Event::from_raw(r, t, id))
            .collect();
        Ok(batch)
    }
}

impl EventSource for DeviceStream {
    fn poll(&mut self) -> Result<Vec<Event>, StreamError> {
        let batch = self.read_batch()?;
        self.specials.extend(batch.specials);
        if let Some(last) = batch.events.last() {
            self.last_delivered = Some(last.timestamp);
        }
        Ok(batch.events)
    }

    fn last_delivered(&self) -> Option<u64> {
        self.last_delivered
    }

    fn is_exhausted(&self) -> bool {
        false
    }

    fn take_specials(&mut self) -> Vec<SpecialBlock> {
        self.specials.take()
    }

    fn sync_role(&self) -> SyncRole {
        self.config.sync_role
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.start_streaming()
    }

    fn write(&mut self, command: &str) -> Result<(), StreamError> {
        self.send(command)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        info!(id = self.source_id, "stopping event transmission");
        self.send(CMD_STOP)?;
        self.source.close()?;
        Ok(())
    }
}
