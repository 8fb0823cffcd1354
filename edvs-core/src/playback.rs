//! Replay of recorded event files through the polling contract.
//!
//! Playback follows a virtual clock that starts at the first event's timestamp.
//! Each poll advances the clock and returns every event strictly before it,
//! either paced by the wall clock or by a fixed step per poll.

use crate::output::{EventFileReader, RecordLayout};
use crate::source::{EventSource, StreamError};
use crate::types::Event;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

const READ_CHUNK: usize = 1024;

/// How the playback clock advances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackPace {
    /// Follow the wall clock, scaled by `time_scale` (2.0 plays twice as fast)
    Realtime { time_scale: f32 },
    /// Advance by `dt_us` microseconds on every poll
    Fixed { dt_us: u64 },
}

impl Default for PlaybackPace {
    fn default() -> Self {
        Self::Realtime { time_scale: 1.0 }
    }
}

/// Playback settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackConfig {
    /// Clock pacing
    pub pace: PlaybackPace,
    /// Record layout of the file
    pub layout: RecordLayout,
}

impl PlaybackConfig {
    /// Checks the pacing parameters.
    pub fn validate(&self) -> Result<(), StreamError> {
        match self.pace {
            PlaybackPace::Realtime { time_scale } if time_scale <= 0.0 || !time_scale.is_finite() => {
                Err(StreamError::InvalidConfig(format!(
                    "time scale must be positive, got {}",
                    time_scale
                )))
            }
            PlaybackPace::Fixed { dt_us: 0 } => Err(StreamError::InvalidConfig(
                "fixed playback step must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Replays a recorded event file.
pub struct FileEventPlayback<R: Read = File> {
    reader: EventFileReader<R>,
    config: PlaybackConfig,
    pending: VecDeque<Event>,
    eof: bool,
    // Timestamp of the first event in the file
    origin: Option<u64>,
    clock: u64,
    started: Option<Instant>,
    last_delivered: Option<u64>,
}

impl FileEventPlayback<File> {
    /// Opens an event file for playback.
    pub fn open<P: AsRef<Path>>(path: P, config: PlaybackConfig) -> Result<Self, StreamError> {
        info!(
            path = %path.as_ref().display(),
            pace = ?config.pace,
            layout = ?config.layout,
            "opening event file"
        );
        Self::from_reader(File::open(path)?, config)
    }
}

impl<R: Read + Send> FileEventPlayback<R> {
    /// Plays events read from `reader`.
    pub fn from_reader(reader: R, config: PlaybackConfig) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            reader: EventFileReader::new(reader).with_layout(config.layout),
            config,
            pending: VecDeque::new(),
            eof: false,
            origin: None,
            clock: 0,
            started: None,
            last_delivered: None,
        })
    }

    /// Reads the next chunk if nothing is buffered.
    fn refill(&mut self) -> Result<(), StreamError> {
        if !self.pending.is_empty() || self.eof {
            return Ok(());
        }
        let mut chunk = Vec::with_capacity(READ_CHUNK);
        if self.reader.read_chunk(&mut chunk, READ_CHUNK)? == 0 {
            debug!("end of event file");
            self.eof = true;
        }
        self.pending.extend(chunk);
        Ok(())
    }

    /// Advances the virtual clock for this poll.
    fn advance_clock(&mut self, origin: u64) {
        match self.config.pace {
            PlaybackPace::Fixed { dt_us } => {
                self.clock = self.clock.max(origin) + dt_us;
            }
            PlaybackPace::Realtime { time_scale } => {
                let started = *self.started.get_or_insert_with(Instant::now);
                let elapsed = started.elapsed().as_micros() as f64 * time_scale as f64;
                self.clock = self.clock.max(origin + elapsed as u64);
            }
        }
    }
}

impl<R: Read + Send> EventSource for FileEventPlayback<R> {
    fn poll(&mut self) -> Result<Vec<Event>, StreamError> {
        self.refill()?;
        let origin = match (self.origin, self.pending.front()) {
            (Some(origin), _) => origin,
            (None, Some(first)) => *self.origin.insert(first.timestamp),
            (None, None) => return Ok(Vec::new()),
        };
        self.advance_clock(origin);

        let mut events = Vec::new();
        loop {
            while let Some(event) = self.pending.front() {
                if event.timestamp >= self.clock {
                    break;
                }
                events.extend(self.pending.pop_front());
            }
            if !self.pending.is_empty() || self.eof {
                break;
            }
            self.refill()?;
        }

        if let Some(last) = events.last() {
            self.last_delivered = Some(last.timestamp);
        }
        Ok(events)
    }

    fn last_delivered(&self) -> Option<u64> {
        self.last_delivered
    }

    fn is_exhausted(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.started = Some(Instant::now());
        Ok(())
    }

    fn write(&mut self, _command: &str) -> Result<(), StreamError> {
        Err(StreamError::NotWritable)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.pending.clear();
        self.eof = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::EventFileWriter;

    fn recording(timestamps: &[u64]) -> Vec<u8> {
        let events: Vec<Event> = timestamps
            .iter()
            .map(|&t| Event::new(t, 1, 2, true, 0))
            .collect();
        let mut bytes = Vec::new();
        let mut writer = EventFileWriter::new(&mut bytes);
        writer.write_events(&events).unwrap();
        writer.flush().unwrap();
        drop(writer);
        bytes
    }

    fn times(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.timestamp).collect()
    }

    #[test]
    fn test_fixed_pace_releases_by_step() {
        let bytes = recording(&[1000, 1005, 1010, 1025, 1040]);
        let config = PlaybackConfig {
            pace: PlaybackPace::Fixed { dt_us: 10 },
            ..PlaybackConfig::default()
        };
        let mut playback = FileEventPlayback::from_reader(&bytes[..], config).unwrap();
        playback.start().unwrap();

        assert_eq!(times(&playback.poll().unwrap()), vec![1000, 1005]);
        assert_eq!(times(&playback.poll().unwrap()), vec![1010]);
        assert_eq!(playback.last_delivered(), Some(1010));
        assert_eq!(times(&playback.poll().unwrap()), vec![1025]);
        // clock at 1040 releases only events strictly before it
        assert!(playback.poll().unwrap().is_empty());
        assert!(!playback.is_exhausted());
        assert_eq!(times(&playback.poll().unwrap()), vec![1040]);
        assert!(playback.is_exhausted());

        // exhausted: nothing more, watermark unchanged
        assert!(playback.poll().unwrap().is_empty());
        assert_eq!(playback.last_delivered(), Some(1040));
    }

    #[test]
    fn test_realtime_pace_fast_forward() {
        let bytes = recording(&[0, 10, 20]);
        let config = PlaybackConfig {
            pace: PlaybackPace::Realtime { time_scale: 1.0e6 },
            ..PlaybackConfig::default()
        };
        let mut playback = FileEventPlayback::from_reader(&bytes[..], config).unwrap();
        playback.start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(times(&playback.poll().unwrap()), vec![0, 10, 20]);
        assert!(playback.is_exhausted());
    }

    #[test]
    fn test_padded_file_playback() {
        let mut bytes = Vec::new();
        for t in [200u64, 230] {
            bytes.extend_from_slice(&t.to_le_bytes());
            bytes.extend_from_slice(&[1, 0, 2, 0, 0, 0, 0, 0]);
        }
        let config = PlaybackConfig {
            pace: PlaybackPace::Fixed { dt_us: 100 },
            layout: RecordLayout::Padded,
        };
        let mut playback = FileEventPlayback::from_reader(&bytes[..], config).unwrap();
        let events = playback.poll().unwrap();
        assert_eq!(events, vec![Event::new(200, 1, 2, false, 0), Event::new(230, 1, 2, false, 0)]);
        assert!(playback.is_exhausted());
    }

    #[test]
    fn test_empty_file_is_exhausted() {
        let config = PlaybackConfig {
            pace: PlaybackPace::Fixed { dt_us: 5 },
            ..PlaybackConfig::default()
        };
        let mut playback = FileEventPlayback::from_reader(&[][..], config).unwrap();
        assert!(playback.poll().unwrap().is_empty());
        assert!(playback.is_exhausted());
        assert_eq!(playback.last_delivered(), None);
    }

    #[test]
    fn test_playback_rejects_commands_and_bad_pace() {
        let config = PlaybackConfig {
            pace: PlaybackPace::Fixed { dt_us: 5 },
            ..PlaybackConfig::default()
        };
        let mut playback = FileEventPlayback::from_reader(&[][..], config).unwrap();
        assert!(matches!(playback.write("E+"), Err(StreamError::NotWritable)));

        let bad = PlaybackConfig {
            pace: PlaybackPace::Realtime { time_scale: 0.0 },
            ..PlaybackConfig::default()
        };
        assert!(FileEventPlayback::from_reader(&[][..], bad).is_err());
    }
}
