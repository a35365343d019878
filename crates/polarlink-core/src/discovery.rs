//! Device discovery
//!
//! Finds a tracking device among the host's serial ports. A device that was
//! left configured by a previous session may be listening at any supported
//! rate, so the probe sweeps the whole baud table and reports the rate that
//! answered.

use std::time::Duration;
use tracing::{debug, info};

use crate::error::ProtocolError;
use crate::frame::{self, TERMINATOR};
use crate::serial::{self, BaudRate, CommSettings};
use crate::transport::{SerialTransport, Transport};
use crate::PROBE_TIMEOUT_MS;

/// Baud rates the probe tries, in order
pub const PROBE_BAUD_RATES: [BaudRate; 6] = [
    BaudRate::Baud9600,
    BaudRate::Baud14400,
    BaudRate::Baud19200,
    BaudRate::Baud38400,
    BaudRate::Baud57600,
    BaudRate::Baud115200,
];

/// Candidate serial device names, best candidates first, at most
/// `max_ports` of them
pub fn candidate_devices(max_ports: usize) -> Vec<String> {
    serial::list_ports()
        .into_iter()
        .map(|p| p.name)
        .take(max_ports)
        .collect()
}

/// Probe the named serial device for a tracker.
///
/// Returns the first baud rate at which the device produced a
/// valid-framed reply, or [`ProtocolError::NoResponse`] if it never did.
pub fn probe(device: &str) -> Result<BaudRate, ProtocolError> {
    probe_with(|baud| {
        SerialTransport::open(device, &CommSettings::new(baud))
            .map(|t| Box::new(t) as Box<dyn Transport>)
    })
}

/// Probe through a transport factory.
///
/// Each attempt opens a fresh transport and releases it before the next
/// baud rate is tried, so a failed probe never leaves the port held.
pub fn probe_with<F>(mut open: F) -> Result<BaudRate, ProtocolError>
where
    F: FnMut(BaudRate) -> Result<Box<dyn Transport>, ProtocolError>,
{
    let command = frame::encode_command("INIT", "");

    for baud in PROBE_BAUD_RATES {
        debug!(baud = baud.bits_per_second(), "probing");
        let mut transport = match open(baud) {
            Ok(t) => t,
            // a missing or unopenable device will not appear at another rate
            Err(e @ ProtocolError::DeviceNotFound(_)) => return Err(e),
            Err(e @ ProtocolError::PermissionDenied(_)) => return Err(e),
            Err(e) => {
                debug!(baud = baud.bits_per_second(), error = %e, "open failed");
                continue;
            }
        };

        let answered = probe_attempt(transport.as_mut(), &command).is_ok();
        transport.close();

        if answered {
            info!(baud = baud.bits_per_second(), "device responded");
            return Ok(baud);
        }
    }

    Err(ProtocolError::NoResponse)
}

/// One probe exchange: send INIT and accept any valid-framed reply.
/// An `ERROR` reply still proves a device is listening at this rate.
fn probe_attempt(transport: &mut dyn Transport, command: &[u8]) -> Result<(), ProtocolError> {
    transport.clear_buffers()?;
    transport.write_all(command)?;
    let raw = transport.read_until(TERMINATOR, Duration::from_millis(PROBE_TIMEOUT_MS))?;
    let reply = frame::decode_text_reply(&raw)?;
    match reply.checksum_error() {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
