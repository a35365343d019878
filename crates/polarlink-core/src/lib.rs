//! # PolarLink Core Library
//!
//! Core functionality for communicating with NDI Polaris/Aurora-class
//! optical and electromagnetic tracking devices over a serial link.
//!
//! This library provides:
//! - Serial transport management (enumeration, open, baud/parity configuration)
//! - The ASCII command / CRC-16 reply framing used by the device family
//! - A connection lifecycle state machine with single-in-flight command discipline
//! - Port-handle management and tool definition (ROM) upload
//! - Binary (`BX`) and ASCII (`TX`) pose decoding
//! - Multi-baud device discovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use polarlink_core::prelude::*;
//!
//! // Find a responding device, then bring it up for tracking
//! let name = discovery::candidate_devices(8).into_iter().next().unwrap();
//! let baud = discovery::probe(&name)?;
//!
//! let tracker = Tracker::open_at(&name, baud)?;
//! tracker.initialize()?;
//! tracker.set_comm_params(CommSettings::new(BaudRate::Baud115200))?;
//!
//! let rom = std::fs::read("tool.rom")?;
//! let port = tracker.attach_tool(&rom, TrackingPriority::Dynamic)?;
//!
//! tracker.start_tracking()?;
//! for frame in tracker.transforms().take(100) {
//!     let frame = frame?;
//!     if let Some(Transform::Valid { pose, frame, .. }) = frame.transform(port) {
//!         println!("{}: {:?}", frame, pose.position);
//!     }
//! }
//! tracker.stop_tracking()?;
//! ```

#![warn(missing_docs)]

pub mod discovery;
pub mod error;
pub mod frame;
pub mod ports;
pub mod serial;
pub mod session;
pub mod stream;
pub mod transform;
pub mod transport;

pub use error::{DeviceError, ProtocolError};
pub use frame::ReplyFrame;
pub use ports::{HandleFilter, PortDescriptor, PortHandle, TrackingPriority};
pub use serial::{BaudRate, CommSettings, DataBits, Parity, PortInfo, StopBits};
pub use session::{DeviceState, SessionConfig, Tracker};
pub use stream::TransformStream;
pub use transform::{Pose, ToolTransform, TrackingFrame, Transform};
pub use transport::{SerialTransport, Transport};

/// Baud rate every device listens at after power-up or reset
pub const RESET_BAUD_RATE: u32 = 9_600;

/// Default timeout for a command reply in milliseconds.
/// The device is specified to answer within five seconds worst-case.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Short timeout used while probing for a device
pub const PROBE_TIMEOUT_MS: u64 = 300;

/// Maximum reply size the device can produce (ASCII or binary)
pub const MAX_REPLY_SIZE: usize = 2048;

/// Total attempts (first send plus retransmissions) for one command
pub const MAX_COMMAND_ATTEMPTS: u32 = 3;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::discovery;
    pub use crate::error::{DeviceError, ProtocolError};
    pub use crate::frame::ReplyFrame;
    pub use crate::ports::{HandleFilter, PortDescriptor, PortHandle, TrackingPriority};
    pub use crate::serial::{BaudRate, CommSettings, DataBits, Parity, PortInfo, StopBits};
    pub use crate::session::{DeviceState, SessionConfig, Tracker};
    pub use crate::stream::TransformStream;
    pub use crate::transform::{Pose, ToolTransform, TrackingFrame, Transform};
    pub use crate::transport::{SerialTransport, Transport};
}
