//! Opening sources from descriptors.

use crate::device::DeviceConfig;
use crate::merge::StreamMerger;
use crate::playback::{FileEventPlayback, PlaybackConfig};
use crate::reader::{ReaderConfig, SingleStreamReader};
use crate::source::{EventSource, StreamError};
use crate::transport::{ByteSource, SerialTransport, TcpTransport};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

/// Where a stream of events comes from.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// Sensor reachable over TCP, `host:port`
    Network { addr: String },
    /// Sensor attached to a serial port, 8N1 with hardware handshake
    Serial { path: PathBuf, baud_rate: u32 },
    /// Previously recorded event file
    FileReplay {
        path: PathBuf,
        playback: PlaybackConfig,
    },
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { addr } => write!(f, "tcp://{}", addr),
            Self::Serial { path, baud_rate } => {
                write!(f, "serial:{}?baudrate={}", path.display(), baud_rate)
            }
            Self::FileReplay { path, .. } => write!(f, "file:{}", path.display()),
        }
    }
}

/// Opens one source. Live devices get their own reader thread; events are
/// tagged with `source_id`.
pub fn open_stream(
    spec: &SourceSpec,
    device: &DeviceConfig,
    source_id: u8,
) -> Result<Box<dyn EventSource>, StreamError> {
    info!(source = %spec, id = source_id, "opening source");
    let transport: Box<dyn ByteSource> = match spec {
        SourceSpec::Network { addr } => {
            Box::new(TcpTransport::connect(addr.as_str(), device.read_timeout)?)
        }
        SourceSpec::Serial { path, baud_rate } => Box::new(SerialTransport::open(
            path,
            *baud_rate,
            device.read_timeout,
        )?),
        SourceSpec::FileReplay { path, playback } => {
            return Ok(Box::new(FileEventPlayback::open(path, *playback)?));
        }
    };
    let reader = ReaderConfig {
        source_id,
        ..ReaderConfig::default()
    };
    Ok(Box::new(SingleStreamReader::open(
        transport,
        device.clone(),
        reader,
    )?))
}

/// Opens every source and merges them. Source `i` is tagged with id `i`.
pub fn open_streams(
    specs: &[SourceSpec],
    device: &DeviceConfig,
) -> Result<StreamMerger, StreamError> {
    if specs.len() > crate::merge::MAX_SOURCES {
        return Err(StreamError::InvalidConfig(format!(
            "too many sources: {}",
            specs.len()
        )));
    }
    let sources = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| open_stream(spec, device, i as u8))
        .collect::<Result<Vec<_>, _>>()?;
    StreamMerger::new(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::write_events;
    use crate::playback::PlaybackPace;
    use crate::types::Event;

    #[test]
    fn test_open_streams_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        write_events(&a, &[Event::new(10, 0, 0, true, 0), Event::new(30, 0, 0, true, 0)]).unwrap();
        write_events(&b, &[Event::new(20, 1, 1, false, 0)]).unwrap();

        let playback = PlaybackConfig {
            pace: PlaybackPace::Fixed { dt_us: 1000 },
            ..PlaybackConfig::default()
        };
        let specs = vec![
            SourceSpec::FileReplay { path: a, playback },
            SourceSpec::FileReplay { path: b, playback },
        ];
        let mut merger = open_streams(&specs, &DeviceConfig::default()).unwrap();
        merger.start().unwrap();

        let events = merger.poll().unwrap();
        let tagged: Vec<(u64, u8)> = events.iter().map(|e| (e.timestamp, e.id)).collect();
        assert_eq!(tagged, vec![(10, 0), (20, 1), (30, 0)]);
        assert!(merger.is_exhausted());
    }

    #[test]
    fn test_missing_file_fails() {
        let spec = SourceSpec::FileReplay {
            path: PathBuf::from("/nonexistent/recording.bin"),
            playback: PlaybackConfig::default(),
        };
        assert!(matches!(
            open_stream(&spec, &DeviceConfig::default(), 0),
            Err(StreamError::Transport(_))
        ));
    }

    #[test]
    fn test_source_display() {
        let spec = SourceSpec::Network {
            addr: "192.168.1.5:56000".to_string(),
        };
        assert_eq!(spec.to_string(), "tcp://192.168.1.5:56000");

        let spec = SourceSpec::Serial {
            path: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: crate::transport::DEFAULT_BAUD_RATE,
        };
        assert_eq!(spec.to_string(), "serial:/dev/ttyUSB0?baudrate=4000000");
    }

    #[test]
    fn test_missing_serial_port_fails() {
        let spec = SourceSpec::Serial {
            path: PathBuf::from("/nonexistent/ttyUSB9"),
            baud_rate: 2_000_000,
        };
        assert!(matches!(
            open_stream(&spec, &DeviceConfig::default(), 0),
            Err(StreamError::Transport(_))
        ));
    }
}
