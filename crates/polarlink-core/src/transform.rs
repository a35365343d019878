//! Tracking reply decoding
//!
//! Turns `BX` (binary) and `TX` (ASCII) tracking replies into per-port
//! [`Transform`] values. Field widths and scale factors are protocol
//! constants; getting them wrong corrupts pose accuracy downstream, so they
//! are not configurable.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::ports::PortHandle;

/// Handle status byte in a binary tracking reply: transform present
const BX_STATUS_VALID: u8 = 0x01;
/// Handle status byte: tool not visible this frame
const BX_STATUS_MISSING: u8 = 0x02;
/// Handle status byte: port not enabled, no reply data follows
const BX_STATUS_DISABLED: u8 = 0x04;

/// Quaternion components scale in ASCII replies (raw units of 1e-4)
const QUAT_SCALE: f64 = 1e-4;
/// Position components scale in ASCII replies (raw units of 0.01 mm)
const POS_SCALE: f64 = 1e-2;
/// Registration error scale in ASCII replies (raw units of 1e-4 mm)
const ERROR_SCALE: f64 = 1e-4;

/// A pose measured for one tool in one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Unit quaternion (q0, qx, qy, qz)
    pub quaternion: [f64; 4],
    /// Position in millimetres (tx, ty, tz)
    pub position: [f64; 3],
    /// RMS registration error in millimetres
    pub rms_error: f64,
}

/// Per-port result of one tracking query.
///
/// `Missing` and `Disabled` deliberately carry no pose so that "no data" can
/// never be confused with a pose at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// The tool was tracked this frame
    Valid {
        /// Measured pose
        pose: Pose,
        /// Raw port status bits
        port_status: u32,
        /// Measurement cycle this pose belongs to
        frame: u32,
    },
    /// The tool is enabled but was not visible this frame
    Missing {
        /// Raw port status bits
        port_status: u32,
        /// Measurement cycle of the miss
        frame: u32,
    },
    /// The port is not enabled for tracking
    Disabled,
}

impl Transform {
    /// The pose, when one was measured
    pub fn pose(&self) -> Option<&Pose> {
        match self {
            Transform::Valid { pose, .. } => Some(pose),
            _ => None,
        }
    }

    /// The frame index, when the device reported one
    pub fn frame_index(&self) -> Option<u32> {
        match self {
            Transform::Valid { frame, .. } | Transform::Missing { frame, .. } => Some(*frame),
            Transform::Disabled => None,
        }
    }

    /// Whether a pose was measured
    pub fn is_valid(&self) -> bool {
        matches!(self, Transform::Valid { .. })
    }
}

/// One tool entry in a tracking reply
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolTransform {
    /// Port handle the entry belongs to
    pub handle: PortHandle,
    /// Decoded transform
    pub transform: Transform,
}

/// All tool transforms from one tracking query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingFrame {
    /// Per-port transforms, in device reporting order
    pub tools: Vec<ToolTransform>,
    /// Raw system status bits
    pub system_status: u16,
}

impl TrackingFrame {
    /// The transform for a specific port handle, if reported
    pub fn transform(&self, handle: PortHandle) -> Option<&Transform> {
        self.tools
            .iter()
            .find(|t| t.handle == handle)
            .map(|t| &t.transform)
    }

    /// The measurement cycle index shared by this frame's transforms
    pub fn frame_index(&self) -> Option<u32> {
        self.tools.iter().find_map(|t| t.transform.frame_index())
    }
}

/// Decode the body of a binary `BX` reply
pub fn decode_bx(body: &[u8]) -> Result<TrackingFrame, ProtocolError> {
    let mut cur = Cursor::new(body);

    let count = cur.take_u8("handle count")?;
    let mut tools = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let handle = PortHandle(cur.take_u8("port handle")?);
        let status = cur.take_u8("handle status")?;

        let transform = match status {
            BX_STATUS_DISABLED => Transform::Disabled,
            BX_STATUS_MISSING => {
                let port_status = cur.take_u32_le("port status")?;
                let frame = cur.take_u32_le("frame number")?;
                Transform::Missing { port_status, frame }
            }
            BX_STATUS_VALID => {
                let mut fields = [0f64; 8];
                for field in fields.iter_mut() {
                    *field = f64::from(cur.take_f32_le("transform field")?);
                }
                let port_status = cur.take_u32_le("port status")?;
                let frame = cur.take_u32_le("frame number")?;
                Transform::Valid {
                    pose: Pose {
                        quaternion: [fields[0], fields[1], fields[2], fields[3]],
                        position: [fields[4], fields[5], fields[6]],
                        rms_error: fields[7],
                    },
                    port_status,
                    frame,
                }
            }
            other => {
                return Err(ProtocolError::MalformedReply(format!(
                    "unknown handle status {other:#04X}"
                )))
            }
        };

        tools.push(ToolTransform { handle, transform });
    }

    let system_status = cur.take_u16_le("system status")?;
    Ok(TrackingFrame {
        tools,
        system_status,
    })
}

/// Decode the payload of an ASCII `TX` reply
pub fn decode_tx(payload: &str) -> Result<TrackingFrame, ProtocolError> {
    let mut cur = TextCursor::new(payload.as_bytes());

    let count = cur.take_hex("handle count", 2)? as usize;
    let mut tools = Vec::with_capacity(count);

    for _ in 0..count {
        let handle = PortHandle(cur.take_hex("port handle", 2)? as u8);

        // unoccupied ports report nothing further and do not count
        if cur.peek() == Some(b'U') {
            cur.skip_word("UNOCCUPIED")?;
            cur.skip_newline();
            continue;
        }

        let transform = if cur.peek() == Some(b'M') {
            cur.skip_word("MISSING")?;
            let port_status = cur.take_hex("port status", 8)?;
            let frame = cur.take_hex("frame number", 8)?;
            Transform::Missing { port_status, frame }
        } else if cur.peek() == Some(b'D') {
            cur.skip_word("DISABLED")?;
            let _port_status = cur.take_hex("port status", 8)?;
            let _frame = cur.take_hex("frame number", 8)?;
            Transform::Disabled
        } else {
            let pose = Pose {
                quaternion: [
                    cur.take_fixed("q0", 6, QUAT_SCALE)?,
                    cur.take_fixed("qx", 6, QUAT_SCALE)?,
                    cur.take_fixed("qy", 6, QUAT_SCALE)?,
                    cur.take_fixed("qz", 6, QUAT_SCALE)?,
                ],
                position: [
                    cur.take_fixed("tx", 7, POS_SCALE)?,
                    cur.take_fixed("ty", 7, POS_SCALE)?,
                    cur.take_fixed("tz", 7, POS_SCALE)?,
                ],
                rms_error: cur.take_fixed("error", 6, ERROR_SCALE)?,
            };
            let port_status = cur.take_hex("port status", 8)?;
            let frame = cur.take_hex("frame number", 8)?;
            Transform::Valid {
                pose,
                port_status,
                frame,
            }
        };

        tools.push(ToolTransform { handle, transform });
        cur.skip_newline();
    }

    let system_status = cur.take_hex("system status", 4)? as u16;
    Ok(TrackingFrame {
        tools,
        system_status,
    })
}

/// Byte cursor over a binary reply body
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.data.len() {
            return Err(ProtocolError::MalformedReply(format!(
                "reply ends inside {what}"
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self, what: &str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn take_u16_le(&mut self, what: &str) -> Result<u16, ProtocolError> {
        Ok(LittleEndian::read_u16(self.take(2, what)?))
    }

    fn take_u32_le(&mut self, what: &str) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(self.take(4, what)?))
    }

    fn take_f32_le(&mut self, what: &str) -> Result<f32, ProtocolError> {
        Ok(LittleEndian::read_f32(self.take(4, what)?))
    }
}

/// Character cursor over an ASCII reply payload
struct TextCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TextCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.data.len() {
            return Err(ProtocolError::MalformedReply(format!(
                "reply ends inside {what}"
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_hex(&mut self, what: &str, width: usize) -> Result<u32, ProtocolError> {
        let raw = self.take(width, what)?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::MalformedReply(format!("{what} is not text")))?;
        u32::from_str_radix(text, 16)
            .map_err(|_| ProtocolError::MalformedReply(format!("{what} is not hex: {text:?}")))
    }

    /// Signed fixed-point field: a mandatory sign followed by digits,
    /// scaled by the protocol constant for the field
    fn take_fixed(&mut self, what: &str, width: usize, scale: f64) -> Result<f64, ProtocolError> {
        let raw = self.take(width, what)?;
        let sign = match raw[0] {
            b'+' => 1i64,
            b'-' => -1i64,
            _ => {
                return Err(ProtocolError::MalformedReply(format!(
                    "{what} has no sign character"
                )))
            }
        };
        let mut magnitude = 0i64;
        for &b in &raw[1..] {
            if !b.is_ascii_digit() {
                return Err(ProtocolError::MalformedReply(format!(
                    "{what} has a non-digit character"
                )));
            }
            magnitude = magnitude * 10 + i64::from(b - b'0');
        }
        Ok(sign as f64 * magnitude as f64 * scale)
    }

    fn skip_word(&mut self, word: &str) -> Result<(), ProtocolError> {
        let raw = self.take(word.len(), word)?;
        if raw != word.as_bytes() {
            return Err(ProtocolError::MalformedReply(format!(
                "expected {word}, got {:?}",
                String::from_utf8_lossy(raw)
            )));
        }
        Ok(())
    }

    fn skip_newline(&mut self) {
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
    }
}
