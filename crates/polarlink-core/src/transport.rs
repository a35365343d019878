//! Transport abstraction
//!
//! One open serial link, with timeout-bounded blocking reads. The
//! [`Transport`] trait is the seam the protocol session talks through, so
//! tests can substitute an in-memory device for real hardware.

use serialport::SerialPort;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::serial::{clear_buffers, configure_port, open_port, CommSettings};

/// Milliseconds the break condition is held during a reset
const BREAK_DURATION_MS: u64 = 300;

/// Poll interval while waiting for reply bytes
const POLL_INTERVAL_MS: u64 = 2;

/// A bidirectional byte channel to one tracking device.
///
/// All reads block the calling thread up to the caller-supplied timeout.
/// No method retries on its own; retry policy belongs to the session.
pub trait Transport: Send {
    /// Write the whole buffer and wait until it is on the wire
    fn write_all(&mut self, buf: &[u8]) -> Result<(), ProtocolError>;

    /// Read bytes until `terminator` is seen (inclusive) or `timeout` elapses.
    ///
    /// A timeout with nothing received is [`ProtocolError::Timeout`]; a
    /// timeout after partial data is [`ProtocolError::TruncatedReply`].
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError>;

    /// Read exactly `buf.len()` bytes or fail with the same timeout rules
    /// as [`Transport::read_until`]
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ProtocolError>;

    /// Reconfigure the host side of the link
    fn configure(&mut self, settings: &CommSettings) -> Result<(), ProtocolError>;

    /// Discard anything buffered in either direction
    fn clear_buffers(&mut self) -> Result<(), ProtocolError>;

    /// Assert a serial break, which resets the device to its power-up
    /// communication settings
    fn send_break(&mut self) -> Result<(), ProtocolError>;

    /// Release the underlying handle. Safe to call more than once.
    fn close(&mut self);

    /// Whether the link is still open
    fn is_open(&self) -> bool;
}

/// [`Transport`] backed by a real serial port
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    baud: u32,
}

impl SerialTransport {
    /// Open the named serial device at the given settings
    pub fn open(name: &str, settings: &CommSettings) -> Result<Self, ProtocolError> {
        let mut port = open_port(name, Some(settings.baud.bits_per_second()))?;
        configure_port(port.as_mut(), settings)?;
        clear_buffers(port.as_mut())?;
        debug!(device = name, baud = settings.baud.bits_per_second(), "serial link open");
        Ok(Self {
            port: Some(port),
            name: name.to_string(),
            baud: settings.baud.bits_per_second(),
        })
    }

    /// Name of the underlying device
    pub fn name(&self) -> &str {
        &self.name
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, ProtocolError> {
        self.port.as_mut().ok_or(ProtocolError::LinkClosed)
    }

    /// Pull available bytes into `out`, bounded by `limit` bytes total.
    /// Returns how many bytes were appended this call.
    fn read_available(
        port: &mut Box<dyn SerialPort>,
        out: &mut Vec<u8>,
        limit: usize,
    ) -> Result<usize, ProtocolError> {
        let available = port
            .bytes_to_read()
            .map_err(|e| ProtocolError::Serial(e.to_string()))? as usize;
        if available == 0 {
            return Ok(0);
        }

        let mut buffer = [0u8; 512];
        let to_read = available.min(buffer.len()).min(limit - out.len());
        match port.read(&mut buffer[..to_read]) {
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                Ok(n)
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(ProtocolError::Serial(e.to_string())),
        }
    }
}

impl Transport for SerialTransport {
    /// Write the data and wait out its transmission time.
    ///
    /// flush() on a serial port calls tcdrain, which can block indefinitely
    /// on some USB adapters; writing into the kernel buffer and sleeping for
    /// the line time avoids that.
    #[cfg(target_family = "unix")]
    fn write_all(&mut self, buf: &[u8]) -> Result<(), ProtocolError> {
        let baud = self.baud.max(1) as u64;
        let port = self.port_mut()?;
        std::io::Write::write_all(port, buf)?;

        // Each byte is 10 bits on the wire (start + 8 data + stop)
        let bits = (buf.len() * 10) as u64;
        let transmit_ms = bits * 1_000 / baud;
        std::thread::sleep(Duration::from_millis(transmit_ms.max(1) + 5));
        trace!(bytes = buf.len(), "wrote command frame");
        Ok(())
    }

    #[cfg(not(target_family = "unix"))]
    fn write_all(&mut self, buf: &[u8]) -> Result<(), ProtocolError> {
        let port = self.port_mut()?;
        std::io::Write::write_all(port, buf)?;
        std::io::Write::flush(port)?;
        trace!(bytes = buf.len(), "wrote command frame");
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let port = self.port_mut()?;
        let mut reply = Vec::new();
        let start = Instant::now();

        loop {
            let scan_from = reply.len();
            let n = Self::read_available(port, &mut reply, crate::MAX_REPLY_SIZE)?;
            if n > 0 {
                if let Some(pos) = reply[scan_from..].iter().position(|&b| b == terminator) {
                    reply.truncate(scan_from + pos + 1);
                    trace!(bytes = reply.len(), "reply complete");
                    return Ok(reply);
                }
                if reply.len() >= crate::MAX_REPLY_SIZE {
                    return Err(ProtocolError::TruncatedReply(reply.len()));
                }
            }

            if start.elapsed() > timeout {
                return if reply.is_empty() {
                    Err(ProtocolError::Timeout)
                } else {
                    Err(ProtocolError::TruncatedReply(reply.len()))
                };
            }
            if n == 0 {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ProtocolError> {
        let port = self.port_mut()?;
        let mut received = Vec::with_capacity(buf.len());
        let start = Instant::now();

        while received.len() < buf.len() {
            let n = Self::read_available(port, &mut received, buf.len())?;
            if n == 0 {
                if start.elapsed() > timeout {
                    return if received.is_empty() {
                        Err(ProtocolError::Timeout)
                    } else {
                        Err(ProtocolError::TruncatedReply(received.len()))
                    };
                }
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }

        buf.copy_from_slice(&received);
        Ok(())
    }

    fn configure(&mut self, settings: &CommSettings) -> Result<(), ProtocolError> {
        let baud = settings.baud.bits_per_second();
        let port = self.port_mut()?;
        configure_port(port.as_mut(), settings)?;
        self.baud = baud;
        debug!(baud, "host link parameters changed");
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), ProtocolError> {
        let port = self.port_mut()?;
        clear_buffers(port.as_mut())
    }

    fn send_break(&mut self) -> Result<(), ProtocolError> {
        let port = self.port_mut()?;
        port.set_break()
            .map_err(|e| ProtocolError::Serial(e.to_string()))?;
        std::thread::sleep(Duration::from_millis(BREAK_DURATION_MS));
        port.clear_break()
            .map_err(|e| ProtocolError::Serial(e.to_string()))?;
        debug!("serial break sent");
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(device = %self.name, "serial link closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
