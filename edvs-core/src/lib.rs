//! Event stream acquisition for eDVS neuromorphic sensors.
//!
//! This crate decodes the compact eDVS wire format, turns wrapping device
//! timestamps into monotonic host timestamps and merges several independently
//! clocked sensors into one time-ordered event stream.
//!
//! # Example
//!
//! ```no_run
//! use edvs_core::{open_streams, DeviceConfig, EventSource, SourceSpec};
//!
//! let specs = vec![SourceSpec::Network { addr: "192.168.201.62:56000".into() }];
//! let mut merger = open_streams(&specs, &DeviceConfig::default()).unwrap();
//! merger.start().unwrap();
//! loop {
//!     for event in merger.poll().unwrap() {
//!         println!("{} {} {} {}", event.timestamp, event.x, event.y, event.polarity);
//!     }
//! }
//! ```
//!
//! # Features
//!
//! - Frame decoding with resynchronization after framing slips
//! - Special data blocks embedded in the event stream
//! - Incremental and system-clock anchored timestamp reconciliation
//! - TCP and serial (8N1, hardware handshake) device links
//! - One worker thread per live device, non-blocking polling
//! - Common-time merge of multiple devices, including master/slave start order
//! - Paced playback and CSV export of recorded event files

pub mod decoder;
pub mod device;
pub mod merge;
pub mod output;
pub mod parser;
pub mod playback;
pub mod reader;
pub mod reconcile;
pub mod source;
pub mod stream;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use decoder::{DecodeStats, FrameDecoder};
pub use device::{DeviceConfig, DeviceStream};
pub use merge::StreamMerger;
pub use output::{EventFileReader, EventFileWriter, FieldOrder, OutputError, RecordLayout};
pub use playback::{FileEventPlayback, PlaybackConfig, PlaybackPace};
pub use reader::{ReaderConfig, SingleStreamReader};
pub use reconcile::TimestampReconciler;
pub use source::{EventSource, StreamError};
pub use stream::{open_stream, open_streams, SourceSpec};
pub use transport::{ByteSource, MemoryTransport, SerialTransport, TcpTransport};
pub use types::{ClockMode, Event, RawEvent, SpecialBlock, SyncRole, TimestampMode};
