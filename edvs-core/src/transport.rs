//! Byte transports carrying the device link.
//!
//! The decoder only depends on the [`ByteSource`] capability: read whatever
//! bytes are available and write command strings. A transport can be cloned
//! into an independent handle so that commands can be sent while a worker
//! thread is blocked reading.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A bidirectional byte link to a device.
///
/// `read` returns `Ok(0)` only when the link is closed for good. Transports
/// with a read timeout report an expired timeout as
/// [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`].
pub trait ByteSource: Send {
    /// Reads available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `bytes` to the device.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Creates an independent handle to the same link.
    fn try_clone(&self) -> io::Result<Box<dyn ByteSource>>;

    /// Closes the link. Reads on other handles return afterwards.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// TCP connection to a network attached sensor.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connects to `addr`, bounding each blocking read by `read_timeout`.
    pub fn connect<A: ToSocketAddrs>(addr: A, read_timeout: Option<Duration>) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(read_timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl ByteSource for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteSource>> {
        Ok(Box::new(Self {
            stream: self.stream.try_clone()?,
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Baud rate of eDVS boards with the FTDI 4 Mbit/s link.
pub const DEFAULT_BAUD_RATE: u32 = 4_000_000;

/// Reads on a serial port are always bounded so that a reader can be stopped.
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Sensor attached to a serial port.
///
/// The line runs 8N1 with RTS/CTS hardware handshake. An expired read
/// timeout surfaces as [`io::ErrorKind::TimedOut`].
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Opens and configures the port at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        baud_rate: u32,
        read_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_string_lossy();
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(read_timeout.unwrap_or(SERIAL_READ_TIMEOUT))
            .open()?;
        Ok(Self::from_port(port))
    }

    /// Wraps an already configured port.
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.port.name())
            .field("baud_rate", &self.port.baud_rate().ok())
            .finish()
    }
}

impl ByteSource for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteSource>> {
        Ok(Box::new(Self {
            port: self.port.try_clone()?,
        }))
    }
}

#[derive(Debug, Default)]
struct MemoryLink {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    closed: bool,
}

/// In-memory link for replaying captured device bytes and simulating devices.
///
/// Clones share the same buffers. Reads return at most `chunk_size` bytes and
/// report [`io::ErrorKind::WouldBlock`] while no bytes are queued, until the
/// link is closed.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    link: Arc<Mutex<MemoryLink>>,
    chunk_size: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates an empty link.
    pub fn new() -> Self {
        Self {
            link: Arc::new(Mutex::new(MemoryLink::default())),
            chunk_size: usize::MAX,
        }
    }

    /// Creates a link with `bytes` already queued.
    pub fn with_bytes(bytes: &[u8]) -> Self {
        let transport = Self::new();
        transport.push(bytes);
        transport
    }

    /// Limits the number of bytes returned per read.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLink> {
        // A panicking test thread must not hide the link from the others
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues bytes as if the device had sent them.
    pub fn push(&self, bytes: &[u8]) {
        self.lock().incoming.extend(bytes);
    }

    /// Number of queued bytes not yet read.
    pub fn pending(&self) -> usize {
        self.lock().incoming.len()
    }

    /// Everything written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Commands written so far, one per line.
    pub fn commands(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Whether the link was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl ByteSource for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk_size = self.chunk_size;
        let mut link = self.lock();
        if link.incoming.is_empty() {
            return if link.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(chunk_size).min(link.incoming.len());
        for (dst, src) in buf.iter_mut().zip(link.incoming.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut link = self.lock();
        if link.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        link.written.extend_from_slice(bytes);
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteSource>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> io::Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
