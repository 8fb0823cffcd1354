//! Event file formats.
//!
//! Supports the headerless binary event file used for recording and playback,
//! and CSV export with configurable field order.

use crate::types::Event;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Size of one binary event record in bytes.
///
/// Layout (little-endian): timestamp u64 | x u16 | y u16 | polarity u8 | id u8
pub const EVENT_RECORD_SIZE: usize = 14;

/// Record size of files written with the C struct layout, which pads the
/// 14 data bytes to 16.
pub const PADDED_RECORD_SIZE: usize = 16;

/// Record layout of a binary event file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordLayout {
    /// 14 byte records without padding
    #[default]
    Packed,
    /// 16 byte records, two trailing pad bytes ignored
    Padded,
}

impl RecordLayout {
    /// Bytes per record.
    pub fn record_size(self) -> usize {
        match self {
            Self::Packed => EVENT_RECORD_SIZE,
            Self::Padded => PADDED_RECORD_SIZE,
        }
    }
}

/// Errors that can occur while reading or writing event files.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Field ordering for CSV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrder {
    /// x, y, p, t (default)
    #[default]
    XYPT,
    /// t, x, y, p
    TXYP,
    /// x, y, t, p
    XYTP,
    /// Custom order specified by indices
    Custom([usize; 4]),
}

/// Column index of a field name: x=0, y=1, polarity=2, timestamp=3.
fn field_index(name: &str) -> Option<usize> {
    match name {
        "x" => Some(0),
        "y" => Some(1),
        "p" | "pol" | "polarity" => Some(2),
        "t" | "time" | "timestamp" => Some(3),
        _ => None,
    }
}

impl std::str::FromStr for FieldOrder {
    type Err = OutputError;

    /// Parses a comma separated field list such as "x,y,p,t" or "t,x,y,p".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: Vec<String> = s.split(',').map(|n| n.trim().to_lowercase()).collect();
        let [first, second, third, fourth] = names.as_slice() else {
            return Err(OutputError::InvalidFormat(format!(
                "expected 4 fields (x, y, p, t), got {}",
                names.len()
            )));
        };

        let mut indices = [0usize; 4];
        let mut seen = 0u8;
        for (slot, name) in indices.iter_mut().zip([first, second, third, fourth]) {
            let index = field_index(name).ok_or_else(|| {
                OutputError::InvalidFormat(format!("unknown field '{}', use x, y, p, t", name))
            })?;
            if seen & (1 << index) != 0 {
                return Err(OutputError::InvalidFormat(format!("field '{}' given twice", name)));
            }
            seen |= 1 << index;
            *slot = index;
        }

        Ok(match indices {
            [0, 1, 2, 3] => Self::XYPT,
            [3, 0, 1, 2] => Self::TXYP,
            [0, 1, 3, 2] => Self::XYTP,
            _ => Self::Custom(indices),
        })
    }
}

impl FieldOrder {
    fn indices(&self) -> [usize; 4] {
        match self {
            Self::XYPT => [0, 1, 2, 3],
            Self::TXYP => [3, 0, 1, 2],
            Self::XYTP => [0, 1, 3, 2],
            Self::Custom(indices) => *indices,
        }
    }

    /// Returns the header line for this field order.
    pub fn header(&self) -> String {
        const NAMES: [&str; 4] = ["x", "y", "polarity", "timestamp"];
        self.indices().map(|i| NAMES[i]).join(",")
    }
}

/// CSV output writer for events.
pub struct CsvWriter<W: Write> {
    writer: BufWriter<W>,
    field_order: FieldOrder,
    with_id: bool,
}

impl<W: Write> CsvWriter<W> {
    /// Creates a new CSV writer.
    pub fn new(writer: W, field_order: FieldOrder) -> Self {
        Self {
            writer: BufWriter::new(writer),
            field_order,
            with_id: false,
        }
    }

    /// Appends the source id as a fifth column.
    pub fn with_id(mut self, with_id: bool) -> Self {
        self.with_id = with_id;
        self
    }

    /// Writes the column header line.
    pub fn write_header(&mut self) -> Result<(), OutputError> {
        let mut header = self.field_order.header();
        if self.with_id {
            header.push_str(",id");
        }
        writeln!(self.writer, "{}", header)?;
        Ok(())
    }

    /// Writes a batch of events.
    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }

    #[inline]
    fn write_event(&mut self, event: &Event) -> Result<(), OutputError> {
        let values = [
            event.x as u64,
            event.y as u64,
            event.polarity as u64,
            event.timestamp,
        ];
        let [a, b, c, d] = self.field_order.indices();
        write!(
            self.writer,
            "{},{},{},{}",
            values[a], values[b], values[c], values[d]
        )?;
        if self.with_id {
            write!(self.writer, ",{}", event.id)?;
        }
        writeln!(self.writer)?;
        Ok(())
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writer for the binary event file format.
pub struct EventFileWriter<W: Write> {
    writer: BufWriter<W>,
    written: u64,
}

impl EventFileWriter<File> {
    /// Creates (or truncates) an event file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, OutputError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> EventFileWriter<W> {
    /// Creates a new binary writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(1 << 20, writer),
            written: 0,
        }
    }

    /// Number of events written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes a batch of events.
    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            self.writer.write_u64::<LittleEndian>(event.timestamp)?;
            self.writer.write_u16::<LittleEndian>(event.x)?;
            self.writer.write_u16::<LittleEndian>(event.y)?;
            self.writer.write_u8(event.polarity as u8)?;
            self.writer.write_u8(event.id)?;
        }
        self.written += events.len() as u64;
        Ok(())
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Sequential reader for the binary event file format.
pub struct EventFileReader<R: Read> {
    reader: BufReader<R>,
    layout: RecordLayout,
}

impl EventFileReader<File> {
    /// Opens an event file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OutputError> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read> EventFileReader<R> {
    /// Creates a new binary reader for packed records.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            layout: RecordLayout::Packed,
        }
    }

    /// Selects the record layout of the input.
    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Reads the next event, or `None` at the end of the file.
    ///
    /// A truncated trailing record is reported as an error.
    pub fn read_event(&mut self) -> Result<Option<Event>, OutputError> {
        let size = self.layout.record_size();
        let mut record = [0u8; PADDED_RECORD_SIZE];
        let mut filled = 0;
        while filled < size {
            match self.reader.read(&mut record[filled..size]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            n if n == size => {
                let mut cursor = &record[..];
                let timestamp = cursor.read_u64::<LittleEndian>()?;
                let x = cursor.read_u16::<LittleEndian>()?;
                let y = cursor.read_u16::<LittleEndian>()?;
                let polarity = cursor.read_u8()? != 0;
                let id = cursor.read_u8()?;
                Ok(Some(Event::new(timestamp, x, y, polarity, id)))
            }
            n => Err(OutputError::InvalidFormat(format!(
                "Truncated event record: {} of {} bytes",
                n, size
            ))),
        }
    }

    /// Reads up to `max` events into `out`, returning how many were read.
    pub fn read_chunk(&mut self, out: &mut Vec<Event>, max: usize) -> Result<usize, OutputError> {
        let mut n = 0;
        while n < max {
            match self.read_event()? {
                Some(event) => {
                    out.push(event);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

/// Reads all events of a binary event file.
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<Event>, OutputError> {
    let mut reader = EventFileReader::open(path)?;
    let mut events = Vec::new();
    while let Some(event) = reader.read_event()? {
        events.push(event);
    }
    Ok(events)
}

/// Writes events to a binary event file.
pub fn write_events<P: AsRef<Path>>(path: P, events: &[Event]) -> Result<(), OutputError> {
    let mut writer = EventFileWriter::create(path)?;
    writer.write_events(events)?;
    writer.flush()?;
    Ok(())
}

/// Writes events to a CSV file.
pub fn write_csv<P: AsRef<Path>>(
    path: P,
    events: &[Event],
    field_order: FieldOrder,
    with_id: bool,
) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = CsvWriter::new(file, field_order).with_id(with_id);
    writer.write_header()?;
    writer.write_events(events)?;
    writer.flush()?;
    Ok(())
}
