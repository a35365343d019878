//! Protocol errors and the device error-code registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ports::PortHandle;
use crate::session::DeviceState;

/// Errors that can occur while communicating with a tracking device
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The named serial device does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The serial device exists but could not be opened
    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    /// Host-side serial parameters were rejected
    #[error("Serial configuration rejected: {0}")]
    ConfigurationRejected(String),

    /// Serial port error not covered by a more specific kind
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No reply bytes arrived within the timeout
    #[error("Reply timeout")]
    Timeout,

    /// The reply ended before its framing was complete
    #[error("Truncated reply after {0} bytes")]
    TruncatedReply(usize),

    /// A complete reply arrived but its CRC did not match
    #[error("Reply checksum mismatch: computed {computed:04X}, received {received:04X}")]
    ChecksumMismatch {
        /// CRC computed over the received payload
        computed: u16,
        /// CRC carried by the reply
        received: u16,
    },

    /// A reply that could not be parsed as any known framing
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// A command was issued in a state where it is not permitted
    #[error("{verb} is not valid while {state:?}")]
    InvalidStateTransition {
        /// Command verb that was attempted
        verb: String,
        /// Session state at the time of the attempt
        state: DeviceState,
    },

    /// The device has no free port handles left
    #[error("No port handles available")]
    NoHandlesAvailable,

    /// The device refused the uploaded tool definition
    #[error("Tool definition rejected: {0}")]
    RomRejected(String),

    /// A port-handle operation was attempted out of sequence
    #[error("Port {handle} is not ready: {required}")]
    PortNotReady {
        /// Handle the operation targeted
        handle: PortHandle,
        /// Step that must complete first
        required: &'static str,
    },

    /// The device answered with one of its own error codes
    #[error("Device reported error {0}")]
    Device(DeviceError),

    /// Retransmission budget exhausted without a clean exchange
    #[error("Communication failed after {attempts} attempts: {last}")]
    Communication {
        /// Number of attempts made
        attempts: u32,
        /// The fault from the final attempt
        last: Box<ProtocolError>,
    },

    /// No device answered on any probed baud rate
    #[error("No tracking device responded on any probed baud rate")]
    NoResponse,

    /// The session has been closed
    #[error("Device connection is closed")]
    LinkClosed,

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the protocol session may retransmit the command that
    /// produced this error. State violations, device-reported errors and
    /// resource exhaustion are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout
                | ProtocolError::TruncatedReply(_)
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::MalformedReply(_)
        )
    }
}

/// An error code reported by the device in an `ERROR` reply.
///
/// The registry of codes and descriptions is fixed by the device firmware;
/// [`DeviceError::description`] performs the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceError(pub u8);

/// Device error code meaning "no error"
pub const OKAY: DeviceError = DeviceError(0x00);

impl DeviceError {
    /// The raw two-hex-digit code
    pub fn code(&self) -> u8 {
        self.0
    }

    /// Whether this code is the OKAY (no error) code
    pub fn is_okay(&self) -> bool {
        self.0 == 0x00
    }

    /// Human-readable description from the fixed firmware registry
    pub fn description(&self) -> &'static str {
        describe(self.0)
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} ({})", self.0, self.description())
    }
}

/// Look up the description for a device error code.
///
/// The table is a process-wide constant; codes the firmware reserves map to
/// a generic string rather than an error.
pub fn describe(code: u8) -> &'static str {
    match code {
        0x00 => "No error",
        0x01 => "Invalid command",
        0x02 => "Command too long",
        0x03 => "Command too short",
        0x04 => "Invalid CRC calculated for command",
        0x05 => "Time-out on command execution",
        0x06 => "Unable to set up new communication parameters",
        0x07 => "Incorrect number of command parameters",
        0x08 => "Invalid port handle selected",
        0x09 => "Invalid tracking priority selected (must be S, D or B)",
        0x0A => "Invalid LED selected",
        0x0B => "Invalid LED state selected (must be B, F or S)",
        0x0C => "Command is invalid while in the current mode",
        0x0D => "No tool assigned to the selected port handle",
        0x0E => "Selected port handle not initialized",
        0x0F => "Selected port handle not enabled",
        0x10 => "System not initialized",
        0x11 => "Unable to stop tracking",
        0x12 => "Unable to start tracking",
        0x13 => "Unable to initialize Tool-in-Port",
        0x14 => "Invalid Position Sensor or Field Generator characterization parameters",
        0x15 => "Unable to initialize the Measurement System",
        0x16 => "Unable to start diagnostic mode",
        0x17 => "Unable to stop diagnostic mode",
        0x18 => "Unable to determine environmental infrared or magnetic interference",
        0x19 => "Unable to read device's firmware version information",
        0x1A => "Internal Measurement System error",
        0x1B => "Unable to initialize for environmental infrared diagnostics",
        0x1C => "Unable to set marker firing signature",
        0x1D => "Unable to search for SROM IDs",
        0x1E => "Unable to read SROM data",
        0x1F => "Unable to write SROM data",
        0x20 => "Unable to select SROM",
        0x21 => "Unable to perform tool current test",
        0x22 => "Enabled tools are not supported by the selected volume parameters",
        0x23 => "Command parameter out of range",
        0x24 => "Unable to select parameters by volume",
        0x25 => "Unable to determine Measurement System supported features list",
        0x28 => "Too many tools enabled for the loaded configuration",
        0x2A => "No memory available for dynamic allocation (heap is full)",
        0x2B => "Requested handle has not been allocated",
        0x2C => "Requested handle has become unoccupied",
        0x2D => "All handles have been allocated",
        0x2E => "Incompatible firmware versions",
        0x2F => "Invalid port description",
        0x30 => "Requested port already assigned to a port handle",
        0x31 => "Invalid input or output state",
        0x32 => "Invalid operation for the device associated with the port handle",
        0x33 => "Feature not available",
        0x34 => "User parameter does not exist",
        0x35 => "Invalid value type",
        0x36 => "User parameter value out of valid range",
        0x37 => "User parameter array index out of valid range",
        0x38 => "User parameter size is incorrect",
        0x39 => "Permission denied",
        0x3B => "File not found",
        0x3C => "Error writing to file",
        0x3D => "Error reading from file",
        0x40 => "Tool definition file error",
        0x41 => "Tool characteristics not supported",
        0x42 => "Device not present",
        0xF1 => "Too much environmental infrared",
        0xF4 => "Unable to erase Flash EEPROM",
        0xF5 => "Unable to write Flash EEPROM",
        0xF6 => "Unable to read Flash EEPROM",
        _ => "Unrecognized error code",
    }
}
