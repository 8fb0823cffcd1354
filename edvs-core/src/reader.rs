//! Threaded reader for one live device.
//!
//! A worker thread owns the [`DeviceStream`] and performs the blocking reads.
//! Completed batches are moved to the consumer through a bounded channel which
//! [`poll`](EventSource::poll) drains without blocking.

use crate::device::{Batch, DeviceConfig, DeviceStream, CMD_STOP};
use crate::source::{command_line, EventSource, SpecialQueue, StreamError};
use crate::transport::ByteSource;
use crate::types::{Event, SpecialBlock, SyncRole};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Id events of this reader are tagged with
    pub source_id: u8,
    /// Maximum number of batches buffered between worker and consumer
    pub channel_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            source_id: 0,
            channel_capacity: 256,
        }
    }
}

type BatchResult = Result<Batch, StreamError>;

/// Polls one live device through a dedicated worker thread.
pub struct SingleStreamReader {
    source_id: u8,
    sync_role: SyncRole,
    capacity: usize,
    // Present until the worker takes it over
    device: Option<DeviceStream>,
    commands: Box<dyn ByteSource>,
    batches: Option<Receiver<BatchResult>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    last_delivered: Option<u64>,
    specials: SpecialQueue,
    // Failure that arrived behind events, reported by the next poll
    pending_error: Option<StreamError>,
    stopped: bool,
}

impl SingleStreamReader {
    /// Opens and configures the device behind `source`. Streaming begins with
    /// [`start`](EventSource::start).
    pub fn open(
        source: Box<dyn ByteSource>,
        device: DeviceConfig,
        reader: ReaderConfig,
    ) -> Result<Self, StreamError> {
        if reader.channel_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        let mut stream = DeviceStream::open(source, device)?;
        stream.set_source_id(reader.source_id);
        let commands = stream.command_handle()?;
        Ok(Self {
            source_id: reader.source_id,
            sync_role: stream.config().sync_role,
            capacity: reader.channel_capacity,
            device: Some(stream),
            commands,
            batches: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            last_delivered: None,
            specials: SpecialQueue::default(),
            pending_error: None,
            stopped: false,
        })
    }

    /// Id events of this reader are tagged with.
    pub fn source_id(&self) -> u8 {
        self.source_id
    }

    /// Whether the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Worker loop: read, decode, reconcile, hand off.
fn run_worker(mut device: DeviceStream, running: Arc<AtomicBool>, batches: Sender<BatchResult>) {
    let id = device.source_id();
    while running.load(Ordering::Acquire) {
        match device.read_batch() {
            Ok(batch) if batch.is_empty() => thread::sleep(IDLE_BACKOFF),
            Ok(batch) => {
                if batches.send(Ok(batch)).is_err() {
                    // consumer is gone
                    break;
                }
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    error!(id, error = %e, "device read failed");
                    let _ = batches.send(Err(e));
                }
                break;
            }
        }
    }
    running.store(false, Ordering::Release);
    let decode = device.decode_stats();
    let reconcile = device.reconcile_stats();
    info!(
        id,
        events = decode.events,
        framing_slips = decode.framing_slips,
        malformed_specials = decode.malformed_specials,
        wraps = reconcile.wraps,
        degenerate_batches = reconcile.degenerate_batches,
        "reader worker exited"
    );
}

impl EventSource for SingleStreamReader {
    fn poll(&mut self) -> Result<Vec<Event>, StreamError> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        let Some(batches) = &self.batches else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        let mut failure = None;
        loop {
            match batches.try_recv() {
                Ok(Ok(batch)) => {
                    events.extend(batch.events);
                    self.specials.extend(batch.specials);
                }
                Ok(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.stopped && events.is_empty() {
                        failure = Some(StreamError::Disconnected);
                    }
                    break;
                }
            }
        }

        if let Some(last) = events.last() {
            self.last_delivered = Some(last.timestamp);
        }
        match failure {
            Some(e) if events.is_empty() => Err(e),
            Some(e) => {
                warn!(id = self.source_id, error = %e, "reader failed after delivering events");
                self.pending_error = Some(e);
                Ok(events)
            }
            None => Ok(events),
        }
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
        self.sync_role
    }

    /// Starts the device and the worker. A failed start leaves the reader
    /// open so that it can be started again.
    fn start(&mut self) -> Result<(), StreamError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut device) = self.device.take() else {
            return Err(StreamError::Disconnected);
        };
        if let Err(e) = device.start_streaming() {
            warn!(id = self.source_id, error = %e, "device did not start");
            self.device = Some(device);
            return Err(e);
        }

        let (tx, rx) = bounded(self.capacity);
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let worker = thread::Builder::new()
            .name(format!("edvs-reader-{}", self.source_id))
            .spawn(move || run_worker(device, running, tx))?;
        self.worker = Some(worker);
        self.batches = Some(rx);
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), StreamError> {
        self.commands.write_all(&command_line(command))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.running.store(false, Ordering::Release);
        let result = self.commands.write_all(&command_line(CMD_STOP));
        // unblocks a worker waiting on a full channel
        self.batches = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(id = self.source_id, "reader worker panicked");
            }
        }
        self.device = None;
        if self.specials.dropped() > 0 {
            warn!(
                id = self.source_id,
                dropped = self.specials.dropped(),
                "special blocks were dropped unread"
            );
        }
        self.commands.close()?;
        result.map_err(StreamError::from)
    }
}

impl Drop for SingleStreamReader {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(id = self.source_id, error = %e, "failed to stop reader cleanly");
        }
    }
}
