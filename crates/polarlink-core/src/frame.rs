//! Command/reply framing
//!
//! Outgoing commands are ASCII: `VERB:args`, a CRC-16 over that text as four
//! uppercase hex digits, and a carriage return. Replies come back either as
//! ASCII with the same trailing CRC-plus-`\r`, or, for tracking queries, as a
//! binary envelope with a start sequence, length-checked header and a 16-bit
//! trailing CRC.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_16_ARC};

use crate::error::{DeviceError, ProtocolError};

/// Every command and ASCII reply ends with a carriage return
pub const TERMINATOR: u8 = b'\r';

/// Start sequence of a binary reply (0xA5C4 transmitted little-endian)
pub const BINARY_START: [u8; 2] = [0xC4, 0xA5];

/// Size of a binary reply header: start sequence, length, header CRC
pub const BINARY_HEADER_LEN: usize = 6;

/// The device checksum: CRC-16 with polynomial x^16 + x^15 + x^2 + 1
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC-16 over a byte slice, as the device computes it
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encode a command frame: `VERB:args` + 4 hex CRC digits + `\r`
pub fn encode_command(verb: &str, args: &str) -> Vec<u8> {
    let mut text = String::with_capacity(verb.len() + args.len() + 6);
    text.push_str(verb);
    text.push(':');
    text.push_str(args);

    let crc = crc16(text.as_bytes());
    let mut out = text.into_bytes();
    out.extend_from_slice(format!("{:04X}", crc).as_bytes());
    out.push(TERMINATOR);
    out
}

/// The parsed result of one command exchange
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    /// Reply payload with framing and CRC stripped
    pub payload: Vec<u8>,
    /// Whether the reply CRC matched the payload
    pub checksum_ok: bool,
    /// Structured error decoded from an `ERROR` payload, if any
    pub device_error: Option<DeviceError>,
    /// CRC computed over the received payload
    pub computed_crc: u16,
    /// CRC carried by the reply, when it parsed at all
    pub received_crc: Option<u16>,
}

impl ReplyFrame {
    /// The payload as text (binary payloads render lossily)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this is the plain `OKAY` acknowledgement
    pub fn is_okay(&self) -> bool {
        self.payload == b"OKAY"
    }

    /// The checksum failure as an error, if the CRC did not match
    pub fn checksum_error(&self) -> Option<ProtocolError> {
        if self.checksum_ok {
            None
        } else {
            Some(ProtocolError::ChecksumMismatch {
                computed: self.computed_crc,
                received: self.received_crc.unwrap_or(0),
            })
        }
    }
}

/// Decode an ASCII reply (raw bytes including the trailing `\r`).
///
/// A CRC mismatch yields a frame with `checksum_ok == false` rather than an
/// error; the session decides whether to retransmit. Truncation is reported
/// as an error distinct from a checksum failure.
pub fn decode_text_reply(raw: &[u8]) -> Result<ReplyFrame, ProtocolError> {
    if raw.last() != Some(&TERMINATOR) {
        return Err(ProtocolError::TruncatedReply(raw.len()));
    }
    let body = &raw[..raw.len() - 1];
    // shortest legal reply is a one-character payload plus four CRC digits
    if body.len() < 5 {
        return Err(ProtocolError::TruncatedReply(raw.len()));
    }

    let (payload, crc_hex) = body.split_at(body.len() - 4);
    let computed = crc16(payload);
    let received = parse_crc_hex(crc_hex);
    let checksum_ok = received == Some(computed);

    let device_error = if checksum_ok {
        parse_error_payload(payload)?
    } else {
        None
    };

    Ok(ReplyFrame {
        payload: payload.to_vec(),
        checksum_ok,
        device_error,
        computed_crc: computed,
        received_crc: received,
    })
}

/// Parse the four CRC digits. The device only ever emits uppercase hex;
/// anything else is treated as corruption so that a single bit flip in the
/// CRC field can never alias to the same value.
fn parse_crc_hex(hex: &[u8]) -> Option<u16> {
    if hex.len() != 4 {
        return None;
    }
    let mut value = 0u16;
    for &b in hex {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | u16::from(digit);
    }
    Some(value)
}

/// Decode the structured error code from an `ERROR??` payload.
///
/// The text marker and the code must agree; an `ERROR` prefix without a
/// parseable code is corruption, not an error report.
fn parse_error_payload(payload: &[u8]) -> Result<Option<DeviceError>, ProtocolError> {
    if !payload.starts_with(b"ERROR") {
        return Ok(None);
    }
    let code = payload
        .get(5..7)
        .and_then(|hex| std::str::from_utf8(hex).ok())
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            ProtocolError::MalformedReply(format!(
                "error marker without a code: {:?}",
                String::from_utf8_lossy(payload)
            ))
        })?;
    Ok(Some(DeviceError(code)))
}

/// Parsed header of a binary reply
#[derive(Debug, Clone, Copy)]
pub struct BinaryHeader {
    /// Length of the reply body that follows the header
    pub length: u16,
    /// Whether the header CRC matched
    pub checksum_ok: bool,
}

/// Parse the six header bytes of a binary reply
pub fn parse_binary_header(raw: &[u8]) -> Result<BinaryHeader, ProtocolError> {
    if raw.len() < BINARY_HEADER_LEN {
        return Err(ProtocolError::TruncatedReply(raw.len()));
    }
    if raw[..2] != BINARY_START {
        return Err(ProtocolError::MalformedReply(format!(
            "bad binary start sequence {:02X}{:02X}",
            raw[0], raw[1]
        )));
    }
    let length = LittleEndian::read_u16(&raw[2..4]);
    let header_crc = LittleEndian::read_u16(&raw[4..6]);
    let computed = crc16(&raw[..4]);
    Ok(BinaryHeader {
        length,
        checksum_ok: header_crc == computed,
    })
}

/// Decode a complete binary reply: header, body and trailing body CRC.
///
/// The returned payload is the body alone.
pub fn decode_binary_reply(raw: &[u8]) -> Result<ReplyFrame, ProtocolError> {
    let header = parse_binary_header(raw)?;
    let body_end = BINARY_HEADER_LEN + header.length as usize;
    if raw.len() < body_end + 2 {
        return Err(ProtocolError::TruncatedReply(raw.len()));
    }

    let body = &raw[BINARY_HEADER_LEN..body_end];
    let received = LittleEndian::read_u16(&raw[body_end..body_end + 2]);
    let computed = crc16(body);

    Ok(ReplyFrame {
        payload: body.to_vec(),
        checksum_ok: header.checksum_ok && received == computed,
        device_error: None,
        computed_crc: computed,
        received_crc: Some(received),
    })
}

/// Frame a binary reply body the way the device does. Used by loopback
/// tests and device simulators.
pub fn encode_binary_reply(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + body.len() + 2);
    out.extend_from_slice(&BINARY_START);

    let mut len_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut len_bytes, body.len() as u16);
    out.extend_from_slice(&len_bytes);

    let mut crc_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut crc_bytes, crc16(&out[..4]));
    out.extend_from_slice(&crc_bytes);

    out.extend_from_slice(body);
    LittleEndian::write_u16(&mut crc_bytes, crc16(body));
    out.extend_from_slice(&crc_bytes);
    out
}

/// Frame an ASCII reply payload the way the device does. Used by loopback
/// tests and device simulators.
pub fn encode_text_reply(payload: &str) -> Vec<u8> {
    let mut out = payload.as_bytes().to_vec();
    out.extend_from_slice(format!("{:04X}", crc16(payload.as_bytes())).as_bytes());
    out.push(TERMINATOR);
    out
}
