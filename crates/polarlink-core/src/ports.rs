//! Port-handle management
//!
//! A trackable tool occupies one device-allocated port handle. Bringing a
//! tool up is a strict four-step handshake: request a handle (`PHRQ`), upload
//! its definition ROM (`PVWR`), initialize the port (`PINIT`), enable it
//! (`PENA`). The session tracks each handle's phase so a skipped step fails
//! immediately instead of silently degrading tracking.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::error::{DeviceError, ProtocolError};
use crate::session::Tracker;

/// Wildcard port description: ask the device to pick any free handle
pub(crate) const PHRQ_WILDCARD: &str = "*********1****";

/// Tool definition ROMs occupy a fixed 1 KiB region on the device
pub const ROM_CAPACITY: usize = 1024;

/// The device accepts ROM data 64 bytes per write command
pub const ROM_CHUNK: usize = 64;

/// Device error code meaning every handle is allocated
const ERR_HANDLES_FULL: DeviceError = DeviceError(0x2D);

/// A device-allocated identifier for one trackable tool.
///
/// Handles are issued by `PHRQ` and stay valid until freed or until the
/// device is re-initialized; they never outlive the [`Tracker`] that
/// requested them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortHandle(pub u8);

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Tracking priority transmitted with `PENA`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingPriority {
    /// Relatively immobile tool (reference frames)
    Static,
    /// Tool that moves during measurement (probes)
    Dynamic,
    /// Tool with no markers, reported for its switches only
    ButtonBox,
}

impl TrackingPriority {
    /// The priority character the command carries
    pub fn as_char(self) -> char {
        match self {
            TrackingPriority::Static => 'S',
            TrackingPriority::Dynamic => 'D',
            TrackingPriority::ButtonBox => 'B',
        }
    }
}

/// Filter for listing port handles with `PHSR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleFilter {
    /// Every allocated handle
    All = 0x00,
    /// Handles whose tool has been unplugged
    Stale = 0x01,
    /// Handles awaiting port initialization
    Uninitialized = 0x02,
    /// Initialized handles awaiting enable
    Unenabled = 0x03,
    /// Handles enabled for tracking
    Enabled = 0x04,
}

/// One entry of a `PHSR` handle listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// The allocated handle
    pub handle: PortHandle,
    /// Raw 12-bit handle status
    pub status: u16,
}

/// Host-side record of how far a handle has progressed through the
/// activation handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PortPhase {
    Allocated,
    Loaded,
    Initialized,
    Enabled,
}

/// Encode bytes as the uppercase hex pairs the device expects
pub(crate) fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

impl Tracker {
    /// Ask the device to allocate a port handle for a wireless tool.
    ///
    /// Fails with [`ProtocolError::NoHandlesAvailable`] once the device has
    /// given out all of its handles.
    pub fn request_port_handle(&self) -> Result<PortHandle, ProtocolError> {
        let reply = match self.run_checked("PHRQ", PHRQ_WILDCARD) {
            Err(ProtocolError::Device(e)) if e == ERR_HANDLES_FULL => {
                return Err(ProtocolError::NoHandlesAvailable)
            }
            other => other?,
        };

        let text = reply.text();
        let handle = text
            .get(..2)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .map(PortHandle)
            .ok_or_else(|| {
                ProtocolError::MalformedReply(format!("bad port handle reply: {text:?}"))
            })?;

        self.set_port_phase(handle, PortPhase::Allocated);
        debug!(%handle, "port handle allocated");
        Ok(handle)
    }

    /// Upload a tool definition ROM to a freshly requested handle.
    ///
    /// The definition is padded to the device's fixed 1 KiB region and
    /// written in 64-byte chunks; a failed chunk aborts the upload.
    pub fn write_tool_definition(&self, handle: PortHandle, rom: &[u8]) -> Result<(), ProtocolError> {
        self.require_port_phase(handle, PortPhase::Allocated, "request a port handle first")?;

        if rom.is_empty() || rom.len() > ROM_CAPACITY {
            return Err(ProtocolError::RomRejected(format!(
                "definition must be 1..={ROM_CAPACITY} bytes, got {}",
                rom.len()
            )));
        }

        let mut padded = [0u8; ROM_CAPACITY];
        padded[..rom.len()].copy_from_slice(rom);

        for addr in (0..ROM_CAPACITY).step_by(ROM_CHUNK) {
            let chunk = hex_encode(&padded[addr..addr + ROM_CHUNK]);
            let args = format!("{:02X}{:04X}{}", handle.0, addr, chunk);
            match self.run_checked("PVWR", &args) {
                Ok(_) => {}
                Err(ProtocolError::Device(e)) => {
                    return Err(ProtocolError::RomRejected(format!(
                        "device refused chunk at {addr:#06X}: {e}"
                    )))
                }
                Err(e) => return Err(e),
            }
        }

        self.set_port_phase(handle, PortPhase::Loaded);
        debug!(%handle, bytes = rom.len(), "tool definition uploaded");
        Ok(())
    }

    /// Initialize a port whose tool definition has been uploaded
    pub fn initialize_port(&self, handle: PortHandle) -> Result<(), ProtocolError> {
        self.require_port_phase(handle, PortPhase::Loaded, "load a tool definition first")?;
        self.run_checked("PINIT", &format!("{:02X}", handle.0))?;
        self.set_port_phase(handle, PortPhase::Initialized);
        debug!(%handle, "port initialized");
        Ok(())
    }

    /// Enable an initialized port for tracking
    pub fn enable_port(
        &self,
        handle: PortHandle,
        priority: TrackingPriority,
    ) -> Result<(), ProtocolError> {
        self.require_port_phase(handle, PortPhase::Initialized, "initialize the port first")?;
        self.run_checked("PENA", &format!("{:02X}{}", handle.0, priority.as_char()))?;
        self.set_port_phase(handle, PortPhase::Enabled);
        info!(%handle, priority = %priority.as_char(), "port enabled for tracking");
        Ok(())
    }

    /// Free a port handle on the device
    pub fn free_port_handle(&self, handle: PortHandle) -> Result<(), ProtocolError> {
        self.run_checked("PHF", &format!("{:02X}", handle.0))?;
        self.clear_port_phase(handle);
        debug!(%handle, "port handle freed");
        Ok(())
    }

    /// List allocated port handles matching a filter
    pub fn list_port_handles(
        &self,
        filter: HandleFilter,
    ) -> Result<Vec<PortDescriptor>, ProtocolError> {
        let reply = self.run_checked("PHSR", &format!("{:02X}", filter as u8))?;
        parse_phsr(&reply.text())
    }

    /// Run the whole activation handshake for one tool: request a handle,
    /// upload its ROM, initialize and enable the port.
    ///
    /// The four steps are ordered here once so callers cannot skip one.
    pub fn attach_tool(
        &self,
        rom: &[u8],
        priority: TrackingPriority,
    ) -> Result<PortHandle, ProtocolError> {
        let handle = self.request_port_handle()?;
        self.write_tool_definition(handle, rom)?;
        self.initialize_port(handle)?;
        self.enable_port(handle, priority)?;
        Ok(handle)
    }
}

/// Parse a `PHSR` reply: a two-digit count, then per handle two hex digits
/// of handle and three of status
fn parse_phsr(text: &str) -> Result<Vec<PortDescriptor>, ProtocolError> {
    let malformed = || ProtocolError::MalformedReply(format!("bad handle listing: {text:?}"));

    let count = text
        .get(..2)
        .and_then(|hex| usize::from_str_radix(hex, 16).ok())
        .ok_or_else(malformed)?;

    let mut out = Vec::with_capacity(count);
    let mut rest = text.get(2..).ok_or_else(malformed)?;
    for _ in 0..count {
        let handle = rest
            .get(..2)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(malformed)?;
        let status = rest
            .get(2..5)
            .and_then(|hex| u16::from_str_radix(hex, 16).ok())
            .ok_or_else(malformed)?;
        out.push(PortDescriptor {
            handle: PortHandle(handle),
            status,
        });
        rest = rest.get(5..).ok_or_else(malformed)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn handle_formats_as_two_hex_digits() {
        assert_eq!(PortHandle(0x0B).to_string(), "0B");
        assert_eq!(PortHandle(0xFF).to_string(), "FF");
    }

    #[test]
    fn hex_encode_is_uppercase_pairs() {
        assert_eq!(hex_encode(&[0x00, 0xAB, 0x0F]), "00AB0F");
    }

    #[test]
    fn phsr_listing_parses() {
        let list = parse_phsr("020A0010B301").unwrap();
        assert_eq!(
            list,
            vec![
                PortDescriptor {
                    handle: PortHandle(0x0A),
                    status: 0x001
                },
                PortDescriptor {
                    handle: PortHandle(0x0B),
                    status: 0x301
                },
            ]
        );
    }

    #[test]
    fn phsr_empty_listing() {
        assert_eq!(parse_phsr("00").unwrap(), vec![]);
    }

    #[test]
    fn phsr_short_listing_is_malformed() {
        assert!(matches!(
            parse_phsr("020A001"),
            Err(ProtocolError::MalformedReply(_))
        ));
    }

    #[test]
    fn priority_characters() {
        assert_eq!(TrackingPriority::Static.as_char(), 'S');
        assert_eq!(TrackingPriority::Dynamic.as_char(), 'D');
        assert_eq!(TrackingPriority::ButtonBox.as_char(), 'B');
    }

    #[test]
    fn phases_order_by_handshake_sequence() {
        assert!(PortPhase::Allocated < PortPhase::Loaded);
        assert!(PortPhase::Loaded < PortPhase::Initialized);
        assert!(PortPhase::Initialized < PortPhase::Enabled);
    }
}
