//! Protocol session
//!
//! One [`Tracker`] owns one open transport and runs the command/reply state
//! machine over it. A session-wide lock serializes complete exchanges
//! (write, read, decode), so the device never sees interleaved command bytes
//! even when a polling thread and a configuration thread share the handle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, ProtocolError};
use crate::frame::{self, ReplyFrame, BINARY_HEADER_LEN, BINARY_START, TERMINATOR};
use crate::ports::{PortHandle, PortPhase};
use crate::serial::CommSettings;
use crate::stream::TransformStream;
use crate::transform::{decode_bx, decode_tx, TrackingFrame};
use crate::transport::{SerialTransport, Transport};
use crate::{DEFAULT_TIMEOUT_MS, MAX_COMMAND_ATTEMPTS};

/// Pause after INIT and COMM, giving the device time to settle
const SETTLE_DELAY_MS: u64 = 100;

/// Reply mode for tracking queries: transforms and status, plus
/// out-of-volume transforms that are not normally reported
const TRACKING_REPLY_MODE: &str = "0801";

/// Lifecycle state of a protocol session.
///
/// Commands are only legal in specific states; anything else fails with
/// [`ProtocolError::InvalidStateTransition`] without touching the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// No transport attached
    Disconnected,
    /// Transport open, device not yet initialized
    Opened,
    /// INIT accepted
    Initialized,
    /// At least one port enabled for tracking
    PortsConfigured,
    /// Device is producing tracking frames
    Tracking,
    /// Tracking stopped, ready to restart
    Stopped,
    /// Session closed; the handle is dead
    Closed,
}

/// Tunables for one session
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long to wait for each reply
    pub reply_timeout: Duration,
    /// Total attempts (first send plus retransmissions) per command
    pub command_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            command_attempts: MAX_COMMAND_ATTEMPTS,
        }
    }
}

/// States each known verb is legal in. Verbs outside the table (version
/// queries, beeps, vendor extensions) are legal in any open state.
fn allowed_states(verb: &str) -> Option<&'static [DeviceState]> {
    use DeviceState::*;
    match verb {
        "INIT" => Some(&[Opened]),
        "COMM" => Some(&[Initialized]),
        "PHRQ" | "PVWR" | "PINIT" | "PENA" | "PHSR" | "PHF" => {
            Some(&[Initialized, PortsConfigured])
        }
        "TSTART" => Some(&[PortsConfigured, Stopped]),
        "BX" | "TX" | "TSTOP" => Some(&[Tracking]),
        _ => None,
    }
}

/// State reached after a verb succeeds, when it causes a transition
fn transition(verb: &str) -> Option<DeviceState> {
    match verb {
        "INIT" => Some(DeviceState::Initialized),
        "PENA" => Some(DeviceState::PortsConfigured),
        "TSTART" => Some(DeviceState::Tracking),
        "TSTOP" => Some(DeviceState::Stopped),
        _ => None,
    }
}

struct Session {
    transport: Box<dyn Transport>,
    state: DeviceState,
    settings: CommSettings,
    config: SessionConfig,
    ports: HashMap<PortHandle, PortPhase>,
    last_device_error: Option<DeviceError>,
}

impl Session {
    /// Run one command to completion: state gate, bounded retransmission,
    /// device-error capture, state transition.
    fn run(&mut self, verb: &str, args: &str) -> Result<ReplyFrame, ProtocolError> {
        self.ensure_valid(verb)?;

        let command = frame::encode_command(verb, args);
        let binary = verb == "BX";
        let mut last_fault = None;

        for attempt in 1..=self.config.command_attempts {
            match self.exchange(&command, binary) {
                Ok(reply) if !reply.checksum_ok => {
                    warn!(verb, attempt, "reply failed checksum, retransmitting");
                    last_fault = reply.checksum_error();
                }
                Ok(reply) => {
                    self.last_device_error = reply.device_error;
                    if reply.device_error.is_none() {
                        if let Some(next) = transition(verb) {
                            debug!(verb, ?next, "state transition");
                            self.state = next;
                        }
                    }
                    return Ok(reply);
                }
                Err(e) if e.is_retryable() => {
                    warn!(verb, attempt, error = %e, "exchange failed, retransmitting");
                    last_fault = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProtocolError::Communication {
            attempts: self.config.command_attempts,
            last: Box::new(last_fault.unwrap_or(ProtocolError::Timeout)),
        })
    }

    fn ensure_valid(&self, verb: &str) -> Result<(), ProtocolError> {
        if matches!(self.state, DeviceState::Closed | DeviceState::Disconnected) {
            return Err(ProtocolError::LinkClosed);
        }
        if let Some(allowed) = allowed_states(verb) {
            if !allowed.contains(&self.state) {
                return Err(ProtocolError::InvalidStateTransition {
                    verb: verb.to_string(),
                    state: self.state,
                });
            }
        }
        Ok(())
    }

    /// One write/read/decode attempt. Anything unread from a previous
    /// failed exchange is garbage, so the input buffer is flushed first.
    fn exchange(&mut self, command: &[u8], binary: bool) -> Result<ReplyFrame, ProtocolError> {
        self.transport.clear_buffers()?;
        self.transport.write_all(command)?;

        let timeout = self.config.reply_timeout;
        if binary {
            let mut header = [0u8; BINARY_HEADER_LEN];
            self.transport.read_exact(&mut header, timeout)?;

            if header[..2] == BINARY_START {
                let parsed = frame::parse_binary_header(&header)?;
                if !parsed.checksum_ok {
                    return Err(ProtocolError::ChecksumMismatch {
                        computed: frame::crc16(&header[..4]),
                        received: u16::from_le_bytes([header[4], header[5]]),
                    });
                }
                let mut rest = vec![0u8; parsed.length as usize + 2];
                self.transport.read_exact(&mut rest, timeout)?;

                let mut full = header.to_vec();
                full.extend_from_slice(&rest);
                frame::decode_binary_reply(&full)
            } else {
                // the device answered in ASCII (typically an ERROR reply);
                // finish reading the line and decode it as text
                let mut raw = header.to_vec();
                if !raw.contains(&TERMINATOR) {
                    let rest = self.transport.read_until(TERMINATOR, timeout)?;
                    raw.extend_from_slice(&rest);
                }
                if let Some(pos) = raw.iter().position(|&b| b == TERMINATOR) {
                    raw.truncate(pos + 1);
                }
                frame::decode_text_reply(&raw)
            }
        } else {
            let raw = self.transport.read_until(TERMINATOR, timeout)?;
            frame::decode_text_reply(&raw)
        }
    }
}

/// Handle to one open tracking device.
///
/// Cloning shares the same session; all clones serialize on the same
/// command lock, so a polling thread and a configuration thread can share
/// one handle safely.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Mutex<Session>>,
}

impl Tracker {
    /// Open the named serial device at the family's power-up settings
    /// (9600 8N1, no handshaking)
    pub fn open(device: &str) -> Result<Self, ProtocolError> {
        Self::open_with_config(device, SessionConfig::default())
    }

    /// Open at a specific baud rate, typically the one
    /// [`crate::discovery::probe`] reported
    pub fn open_at(device: &str, baud: crate::serial::BaudRate) -> Result<Self, ProtocolError> {
        let settings = CommSettings::new(baud);
        let transport = SerialTransport::open(device, &settings)?;
        info!(device, baud = baud.bits_per_second(), "tracker opened");
        Ok(Self::new(Box::new(transport), SessionConfig::default(), settings))
    }

    /// Open with explicit session tunables
    pub fn open_with_config(device: &str, config: SessionConfig) -> Result<Self, ProtocolError> {
        let settings = CommSettings::default();
        let transport = SerialTransport::open(device, &settings)?;
        info!(device, "tracker opened");
        Ok(Self::new(Box::new(transport), config, settings))
    }

    /// Build a session over an already-open transport. This is the seam
    /// device simulators plug into.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self::new(transport, SessionConfig::default(), CommSettings::default())
    }

    /// [`Tracker::from_transport`] with explicit tunables
    pub fn from_transport_with_config(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self::new(transport, config, CommSettings::default())
    }

    fn new(transport: Box<dyn Transport>, config: SessionConfig, settings: CommSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Session {
                transport,
                state: DeviceState::Opened,
                settings,
                config,
                ports: HashMap::new(),
                last_device_error: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        // a panic while holding the lock cannot leave the session in a
        // half-written state; the next exchange flushes and starts clean
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    /// Link parameters currently in effect
    pub fn comm_settings(&self) -> CommSettings {
        self.lock().settings
    }

    /// The device error recorded by the most recent command, if that
    /// command drew an `ERROR` reply
    pub fn last_device_error(&self) -> Option<DeviceError> {
        self.lock().last_device_error
    }

    /// Issue a raw command and return the decoded reply.
    ///
    /// The reply carries any device-reported error; it is not turned into
    /// an `Err` here so that callers can inspect payload and error code
    /// together. The typed methods on this handle do the conversion.
    pub fn command(&self, verb: &str, args: &str) -> Result<ReplyFrame, ProtocolError> {
        self.lock().run(verb, args)
    }

    /// Run a command and treat a device-reported error as failure
    pub(crate) fn run_checked(&self, verb: &str, args: &str) -> Result<ReplyFrame, ProtocolError> {
        let reply = self.lock().run(verb, args)?;
        if let Some(err) = reply.device_error {
            return Err(ProtocolError::Device(err));
        }
        Ok(reply)
    }

    /// Initialize the device. Required once after open (or reset) before
    /// anything else.
    pub fn initialize(&self) -> Result<(), ProtocolError> {
        let mut session = self.lock();
        let reply = session.run("INIT", "")?;
        if let Some(err) = reply.device_error {
            return Err(ProtocolError::Device(err));
        }
        // the device needs a moment after INIT before the next command
        std::thread::sleep(Duration::from_millis(SETTLE_DELAY_MS));
        info!("device initialized");
        Ok(())
    }

    /// Change the link parameters on both sides.
    ///
    /// The device acknowledges at the old settings and then switches, so
    /// the host side is reconfigured only after `OKAY`, with a settle delay
    /// in between. Until this returns, no other command can slip in: the
    /// whole re-handshake happens under the command lock.
    pub fn set_comm_params(&self, settings: CommSettings) -> Result<(), ProtocolError> {
        let mut session = self.lock();
        let reply = session.run("COMM", &settings.comm_args())?;
        if let Some(err) = reply.device_error {
            return Err(ProtocolError::Device(err));
        }

        std::thread::sleep(Duration::from_millis(SETTLE_DELAY_MS));
        session.transport.configure(&settings)?;
        session.transport.clear_buffers()?;
        session.settings = settings;
        info!(baud = settings.baud.bits_per_second(), "link parameters changed");
        Ok(())
    }

    /// Reset the device with a serial break.
    ///
    /// Drops both sides back to the power-up settings and waits for the
    /// reset banner; afterwards the session is in the `Opened` state and
    /// all port handles are gone.
    pub fn reset(&self) -> Result<(), ProtocolError> {
        let mut session = self.lock();
        if matches!(session.state, DeviceState::Closed | DeviceState::Disconnected) {
            return Err(ProtocolError::LinkClosed);
        }

        session.transport.configure(&CommSettings::default())?;
        session.transport.clear_buffers()?;
        session.transport.send_break()?;

        let timeout = session.config.reply_timeout;
        let raw = session.transport.read_until(TERMINATOR, timeout)?;
        let reply = frame::decode_text_reply(&raw)?;
        if let Some(e) = reply.checksum_error() {
            return Err(e);
        }
        if !reply.text().starts_with("RESET") {
            return Err(ProtocolError::MalformedReply(format!(
                "expected reset banner, got {:?}",
                reply.text()
            )));
        }

        session.settings = CommSettings::default();
        session.state = DeviceState::Opened;
        session.ports.clear();
        session.last_device_error = None;
        info!("device reset");
        Ok(())
    }

    /// Firmware/revision information (`VER` reply text)
    pub fn version(&self, mode: u8) -> Result<String, ProtocolError> {
        Ok(self.run_checked("VER", &mode.to_string())?.text())
    }

    /// Sound the device beeper `count` times (1–9). Returns whether the
    /// device actually beeped.
    pub fn beep(&self, count: u8) -> Result<bool, ProtocolError> {
        let reply = self.run_checked("BEEP", &count.to_string())?;
        Ok(reply.text().starts_with('1'))
    }

    /// Start tracking. Requires every tool of interest to be enabled.
    pub fn start_tracking(&self) -> Result<(), ProtocolError> {
        self.run_checked("TSTART", "")?;
        info!("tracking started");
        Ok(())
    }

    /// Stop tracking; the session can restart it later
    pub fn stop_tracking(&self) -> Result<(), ProtocolError> {
        self.run_checked("TSTOP", "")?;
        info!("tracking stopped");
        Ok(())
    }

    /// Fetch the latest tracking frame with the binary `BX` query
    pub fn track_frame(&self) -> Result<TrackingFrame, ProtocolError> {
        let reply = self.run_checked("BX", TRACKING_REPLY_MODE)?;
        decode_bx(&reply.payload)
    }

    /// Fetch the latest tracking frame with the ASCII `TX` query
    pub fn track_frame_text(&self) -> Result<TrackingFrame, ProtocolError> {
        let reply = self.run_checked("TX", TRACKING_REPLY_MODE)?;
        decode_tx(&reply.text())
    }

    /// A blocking iterator of tracking frames. Iteration ends when
    /// tracking stops; it does not stop the device by itself.
    pub fn transforms(&self) -> TransformStream {
        TransformStream::new(self.clone())
    }

    /// Close the session and release the serial device.
    ///
    /// Blocks until any in-flight command finishes. Safe to call more than
    /// once; a tracking device is stopped first on a best-effort basis.
    pub fn close(&self) -> Result<(), ProtocolError> {
        let mut session = self.lock();
        if session.state == DeviceState::Closed {
            return Ok(());
        }
        if session.state == DeviceState::Tracking {
            if let Err(e) = session.run("TSTOP", "") {
                warn!(error = %e, "TSTOP on close failed");
            }
        }
        session.transport.close();
        session.state = DeviceState::Closed;
        info!("tracker closed");
        Ok(())
    }

    pub(crate) fn set_port_phase(&self, handle: PortHandle, phase: PortPhase) {
        self.lock().ports.insert(handle, phase);
    }

    pub(crate) fn clear_port_phase(&self, handle: PortHandle) {
        self.lock().ports.remove(&handle);
    }

    pub(crate) fn require_port_phase(
        &self,
        handle: PortHandle,
        minimum: PortPhase,
        required: &'static str,
    ) -> Result<(), ProtocolError> {
        match self.lock().ports.get(&handle) {
            None => Err(ProtocolError::PortNotReady {
                handle,
                required: "request a port handle first",
            }),
            Some(phase) if *phase < minimum => Err(ProtocolError::PortNotReady { handle, required }),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.reply_timeout, Duration::from_millis(5_000));
        assert_eq!(config.command_attempts, 3);
    }

    #[test]
    fn state_table_rows() {
        use DeviceState::*;
        assert_eq!(allowed_states("INIT"), Some(&[Opened][..]));
        assert_eq!(allowed_states("COMM"), Some(&[Initialized][..]));
        assert_eq!(
            allowed_states("PENA"),
            Some(&[Initialized, PortsConfigured][..])
        );
        assert_eq!(allowed_states("TSTART"), Some(&[PortsConfigured, Stopped][..]));
        assert_eq!(allowed_states("BX"), Some(&[Tracking][..]));
        assert_eq!(allowed_states("TSTOP"), Some(&[Tracking][..]));
        // verbs outside the table are legal in any open state
        assert_eq!(allowed_states("VER"), None);
    }

    #[test]
    fn transitions_follow_the_table() {
        assert_eq!(transition("INIT"), Some(DeviceState::Initialized));
        assert_eq!(transition("PENA"), Some(DeviceState::PortsConfigured));
        assert_eq!(transition("TSTART"), Some(DeviceState::Tracking));
        assert_eq!(transition("TSTOP"), Some(DeviceState::Stopped));
        assert_eq!(transition("BX"), None);
        assert_eq!(transition("COMM"), None);
    }
}
