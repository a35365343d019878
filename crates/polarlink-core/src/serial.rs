//! Serial port handling
//!
//! Low-level serial port access for tracker communication, plus the
//! communication-parameter enums that the `COMM` command transmits verbatim.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use crate::error::ProtocolError;
use crate::RESET_BAUD_RATE;

/// Baud rates supported by the device family.
///
/// The discriminant is the digit transmitted in the `COMM` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    /// 9600 baud (power-up default)
    Baud9600 = 0,
    /// 14400 baud
    Baud14400 = 1,
    /// 19200 baud
    Baud19200 = 2,
    /// 38400 baud
    Baud38400 = 3,
    /// 57600 baud
    Baud57600 = 4,
    /// 115200 baud
    Baud115200 = 5,
    /// 921600 baud (newer Position Sensors only)
    Baud921600 = 6,
    /// 1228739 baud (newer Position Sensors only)
    Baud1228739 = 7,
}

impl BaudRate {
    /// The actual line rate in bits per second
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::Baud9600 => 9_600,
            BaudRate::Baud14400 => 14_400,
            BaudRate::Baud19200 => 19_200,
            BaudRate::Baud38400 => 38_400,
            BaudRate::Baud57600 => 57_600,
            BaudRate::Baud115200 => 115_200,
            BaudRate::Baud921600 => 921_600,
            BaudRate::Baud1228739 => 1_228_739,
        }
    }

    /// The single digit the `COMM` command carries for this rate
    pub fn comm_digit(self) -> char {
        (b'0' + self as u8) as char
    }
}

/// Data bits for the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    /// Eight data bits (default)
    Eight,
    /// Seven data bits
    Seven,
}

/// Parity for the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity (default)
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Stop bits for the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit (default)
    One,
    /// Two stop bits
    Two,
}

/// Full set of link parameters carried by the `COMM` command.
///
/// The device answers `OKAY` at the old settings and then switches, so the
/// host must reconfigure its own side afterwards; the session handles that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommSettings {
    /// Line rate
    pub baud: BaudRate,
    /// Data bits
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Hardware handshaking on or off
    pub handshake: bool,
}

impl CommSettings {
    /// Settings at the given baud rate with the 8N1 no-handshake default
    pub fn new(baud: BaudRate) -> Self {
        Self {
            baud,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            handshake: false,
        }
    }

    /// The five-character argument string of the `COMM` command
    pub fn comm_args(&self) -> String {
        let data = match self.data_bits {
            DataBits::Eight => '0',
            DataBits::Seven => '1',
        };
        let parity = match self.parity {
            Parity::None => '0',
            Parity::Odd => '1',
            Parity::Even => '2',
        };
        let stop = match self.stop_bits {
            StopBits::One => '0',
            StopBits::Two => '1',
        };
        let handshake = if self.handshake { '1' } else { '0' };
        format!(
            "{}{}{}{}{}",
            self.baud.comm_digit(),
            data,
            parity,
            stop,
            handshake
        )
    }
}

impl Default for CommSettings {
    /// Power-up settings: 9600 8N1, no handshaking
    fn default() -> Self {
        Self::new(BaudRate::Baud9600)
    }
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyUSB* ports come first (sorted numerically by suffix; the usual
///    name for the RS-232 adapters trackers ship with)
///  - then ttyACM* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    // Collect from serialport API
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
    {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: add /dev/ttyUSB* and /dev/ttyACM* entries if present but not found by API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("ttyACM") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    // Collect and sort deterministically
    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port at the power-up settings of the device family.
///
/// The returned port has a short 100ms native timeout; longer waits are
/// implemented by polling in the transport layer.
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(RESET_BAUD_RATE);

    serialport::new(name, baud)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::DeviceNotFound(name.to_string()),
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ProtocolError::DeviceNotFound(name.to_string())
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                ProtocolError::PermissionDenied(name.to_string())
            }
            _ => ProtocolError::Serial(e.to_string()),
        })
}

/// Apply link parameters to an open serial port
pub fn configure_port(
    port: &mut dyn SerialPort,
    settings: &CommSettings,
) -> Result<(), ProtocolError> {
    let reject = |e: serialport::Error| ProtocolError::ConfigurationRejected(e.to_string());

    port.set_baud_rate(settings.baud.bits_per_second())
        .map_err(reject)?;
    port.set_data_bits(match settings.data_bits {
        DataBits::Eight => serialport::DataBits::Eight,
        DataBits::Seven => serialport::DataBits::Seven,
    })
    .map_err(reject)?;
    port.set_parity(match settings.parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    })
    .map_err(reject)?;
    port.set_stop_bits(match settings.stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    })
    .map_err(reject)?;
    port.set_flow_control(if settings.handshake {
        serialport::FlowControl::Hardware
    } else {
        serialport::FlowControl::None
    })
    .map_err(reject)?;

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::Serial(e.to_string()))
}
