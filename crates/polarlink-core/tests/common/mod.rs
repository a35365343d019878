//! In-memory simulated tracking device for integration tests.
//!
//! Speaks the same framing as real hardware: ASCII commands with CRC-16,
//! `OKAY`/`ERROR` replies, binary tracking frames. Only answers when the
//! host side is configured at the rate the simulated device listens on, so
//! baud probing and `COMM` re-handshakes behave like the real thing.

// each test binary uses a different slice of the simulator
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polarlink_core::error::ProtocolError;
use polarlink_core::frame::{crc16, encode_binary_reply, encode_text_reply, TERMINATOR};
use polarlink_core::serial::CommSettings;
use polarlink_core::transport::Transport;

/// Observable state of the simulated device, shared with the test body
pub struct SimState {
    /// Baud rate the device itself is listening at
    pub device_baud: u32,
    /// Baud rate the host transport is configured at
    pub host_baud: u32,
    /// Bytes queued for the host to read
    pub pending: VecDeque<u8>,
    /// Complete command frames the device received
    pub writes: Vec<Vec<u8>>,
    /// Writes or buffer clears that happened while a reply was in flight
    pub violations: usize,
    /// Corrupt the CRC of the next N replies
    pub corrupt_next: usize,
    /// Swallow the next N commands without replying
    pub swallow_next: usize,
    /// Delay applied before each read returns data
    pub reply_delay: Duration,
    /// Handles enabled for tracking, in enable order
    pub enabled: Vec<u8>,
    next_handle: u8,
    frame_counter: u32,
    tracking: bool,
    open: bool,
    exchange_open: bool,
}

impl SimState {
    /// Whether the host still holds the simulated port
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn queue_text(&mut self, payload: &str) {
        let mut raw = encode_text_reply(payload);
        self.maybe_corrupt(&mut raw);
        self.pending.extend(raw);
    }

    fn queue_binary(&mut self, body: &[u8]) {
        let mut raw = encode_binary_reply(body);
        self.maybe_corrupt(&mut raw);
        self.pending.extend(raw);
    }

    fn maybe_corrupt(&mut self, raw: &mut [u8]) {
        if self.corrupt_next > 0 {
            self.corrupt_next -= 1;
            // flip a bit in the CRC region so the frame still reads to
            // completion but fails its checksum
            let idx = raw.len() - 2;
            raw[idx] ^= 0x01;
        }
    }

    fn settle_reads(&mut self) {
        if self.pending.is_empty() {
            self.exchange_open = false;
        }
    }

    fn handle_command(&mut self, text: &str) {
        if self.swallow_next > 0 {
            self.swallow_next -= 1;
            return;
        }

        let (verb, args) = match text.split_once(':') {
            Some(parts) => parts,
            None => {
                self.queue_text("ERROR01");
                return;
            }
        };

        match verb {
            "INIT" => {
                self.tracking = false;
                self.queue_text("OKAY");
            }
            "COMM" => {
                let baud = match args.as_bytes().first() {
                    Some(b'0') => 9_600,
                    Some(b'1') => 14_400,
                    Some(b'2') => 19_200,
                    Some(b'3') => 38_400,
                    Some(b'4') => 57_600,
                    Some(b'5') => 115_200,
                    Some(b'6') => 921_600,
                    Some(b'7') => 1_228_739,
                    _ => {
                        self.queue_text("ERROR07");
                        return;
                    }
                };
                // the acknowledgement goes out at the old rate, then the
                // device switches
                self.queue_text("OKAY");
                self.device_baud = baud;
            }
            "PHRQ" => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.queue_text(&format!("{:02X}", handle));
            }
            "PVWR" | "PINIT" => self.queue_text("OKAY"),
            "PENA" => {
                if let Some(handle) = args.get(..2).and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    self.enabled.push(handle);
                }
                self.queue_text("OKAY");
            }
            "PHF" => self.queue_text("OKAY"),
            "PHSR" => {
                let mut listing = format!("{:02X}", self.enabled.len());
                for handle in &self.enabled {
                    listing.push_str(&format!("{:02X}001", handle));
                }
                self.queue_text(&listing);
            }
            "TSTART" => {
                self.tracking = true;
                self.frame_counter = 42;
                self.queue_text("OKAY");
            }
            "TSTOP" => {
                self.tracking = false;
                self.queue_text("OKAY");
            }
            "BX" => {
                if !self.tracking {
                    self.queue_text("ERROR0C");
                    return;
                }
                let frame = self.frame_counter;
                self.frame_counter += 1;
                let body = bx_body(&self.enabled, frame);
                self.queue_binary(&body);
            }
            "VER" => self.queue_text("Polaris Simulator Rev 007.000.012"),
            "BEEP" => self.queue_text("1"),
            _ => self.queue_text("ERROR01"),
        }
    }
}

/// Binary tracking body: every enabled tool at a fixed pose
fn bx_body(enabled: &[u8], frame: u32) -> Vec<u8> {
    let mut body = vec![enabled.len() as u8];
    for &handle in enabled {
        body.push(handle);
        body.push(0x01); // valid
        for value in [1.0f32, 0.0, 0.0, 0.0, 12.345, -6.7, 0.0, 0.12] {
            body.extend_from_slice(&value.to_le_bytes());
        }
        body.extend_from_slice(&1u32.to_le_bytes()); // port status
        body.extend_from_slice(&frame.to_le_bytes());
    }
    body.extend_from_slice(&0u16.to_le_bytes()); // system status
    body
}

/// The transport half handed to the [`polarlink_core::Tracker`]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

/// Create a simulated device listening at `device_baud`, with the host
/// side initially configured at `host_baud`
pub fn simulated_device(device_baud: u32, host_baud: u32) -> (SimTransport, Arc<Mutex<SimState>>) {
    let state = Arc::new(Mutex::new(SimState {
        device_baud,
        host_baud,
        pending: VecDeque::new(),
        writes: Vec::new(),
        violations: 0,
        corrupt_next: 0,
        swallow_next: 0,
        reply_delay: Duration::ZERO,
        enabled: Vec::new(),
        next_handle: 0x0A,
        frame_counter: 0,
        tracking: false,
        open: true,
        exchange_open: false,
    }));
    (
        SimTransport {
            state: Arc::clone(&state),
        },
        state,
    )
}

impl Transport for SimTransport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), ProtocolError> {
        let mut sim = self.state.lock().unwrap();
        if !sim.open {
            return Err(ProtocolError::LinkClosed);
        }
        if sim.exchange_open {
            // a command arrived while the previous reply was still in
            // flight; the session lock is supposed to make this impossible
            sim.violations += 1;
        }
        sim.writes.push(buf.to_vec());

        // a mismatched rate means the device sees line noise, not a command
        if sim.host_baud != sim.device_baud {
            return Ok(());
        }

        let text = match buf.split_last() {
            Some((&TERMINATOR, head)) => head,
            _ => return Ok(()),
        };
        if text.len() < 4 {
            return Ok(());
        }
        let (payload, crc_hex) = text.split_at(text.len() - 4);
        let crc_ok = std::str::from_utf8(crc_hex)
            .ok()
            .and_then(|s| u16::from_str_radix(s, 16).ok())
            == Some(crc16(payload));
        if !crc_ok {
            sim.queue_text("ERROR04");
            return Ok(());
        }

        let command = String::from_utf8_lossy(payload).into_owned();
        sim.handle_command(&command);
        if !sim.pending.is_empty() {
            sim.exchange_open = true;
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, _timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let delay = self.state.lock().unwrap().reply_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut sim = self.state.lock().unwrap();
        if !sim.open {
            return Err(ProtocolError::LinkClosed);
        }
        let mut out = Vec::new();
        while let Some(b) = sim.pending.pop_front() {
            out.push(b);
            if b == terminator {
                sim.settle_reads();
                return Ok(out);
            }
        }
        sim.settle_reads();
        if out.is_empty() {
            Err(ProtocolError::Timeout)
        } else {
            Err(ProtocolError::TruncatedReply(out.len()))
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), ProtocolError> {
        let delay = self.state.lock().unwrap().reply_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut sim = self.state.lock().unwrap();
        if !sim.open {
            return Err(ProtocolError::LinkClosed);
        }
        for (i, slot) in buf.iter_mut().enumerate() {
            match sim.pending.pop_front() {
                Some(b) => *slot = b,
                None => {
                    sim.settle_reads();
                    return Err(if i == 0 {
                        ProtocolError::Timeout
                    } else {
                        ProtocolError::TruncatedReply(i)
                    });
                }
            }
        }
        sim.settle_reads();
        Ok(())
    }

    fn configure(&mut self, settings: &CommSettings) -> Result<(), ProtocolError> {
        self.state.lock().unwrap().host_baud = settings.baud.bits_per_second();
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), ProtocolError> {
        let mut sim = self.state.lock().unwrap();
        if sim.exchange_open {
            // flushing away another caller's un-read reply is the same
            // interleaving bug as writing over it
            sim.violations += 1;
        }
        sim.pending.clear();
        sim.exchange_open = false;
        Ok(())
    }

    fn send_break(&mut self) -> Result<(), ProtocolError> {
        let mut sim = self.state.lock().unwrap();
        sim.device_baud = 9_600;
        sim.tracking = false;
        sim.enabled.clear();
        if sim.host_baud == sim.device_baud {
            sim.queue_text("RESET");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }
}
