//! Error types for the device core
//!
//! Each stage of a device's life has its own error type:
//! - [`OpenError`]: a device node could not be turned into a sub-connection
//! - [`SendError`]: a HID++ frame could not be written
//! - [`HidppError`]: a HID++ request did not produce a successful reply
//! - [`EmitterError`]: the synthetic input device is unavailable
//! - [`ScanError`]: a node could not be described during enumeration

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceIdentity;

/// Errors raised while opening a sub-device node
#[derive(Debug, Error)]
pub enum OpenError {
    /// The device node does not exist (yet)
    #[error("Device node {path} does not exist")]
    NodeMissing { path: PathBuf },

    /// The device node exists but we may not open it
    #[error("Permission denied opening {path} - check udev rules")]
    PermissionDenied { path: PathBuf },

    /// The node reports a different vendor/product than the scan did
    #[error("Device at {path} is {found_vendor:04x}:{found_product:04x}, expected {expected}")]
    IdMismatch {
        path: PathBuf,
        expected: DeviceIdentity,
        found_vendor: u16,
        found_product: u16,
    },

    /// The node lacks a capability the interface requires
    #[error("Device at {path} does not support {missing}")]
    UnsupportedCapabilities { path: PathBuf, missing: String },

    /// Any other I/O failure
    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OpenError {
    /// Build an error from an I/O failure, classifying the common kinds
    pub fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => OpenError::NodeMissing { path },
            std::io::ErrorKind::PermissionDenied => OpenError::PermissionDenied { path },
            _ => OpenError::Io { path, source },
        }
    }

    /// Whether a hotplugged node might still become openable
    ///
    /// Freshly created nodes often exist before udev has applied permissions
    /// or populated its database.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OpenError::NodeMissing { .. } | OpenError::PermissionDenied { .. }
        )
    }
}

/// Errors raised by the codec when a byte buffer is not a valid frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame length {0} is neither 7 (short) nor 20 (long) bytes")]
    InvalidLength(usize),

    #[error("report id 0x{report_id:02x} does not match a {len}-byte frame")]
    ReportIdMismatch { report_id: u8, len: usize },
}

/// Errors raised while writing a HID++ frame
///
/// Outbound frames are [`HidppMessage`](crate::hidpp::HidppMessage) values,
/// which are well-formed by construction; malformed bytes can only arrive
/// from the device and are rejected by the codec as [`FrameError`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("write failed: {0}")]
    Io(#[source] std::io::Error),

    /// The protocol engine for this connection is gone
    #[error("protocol connection closed")]
    Closed,
}

/// HID++ protocol generation an error reply belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVersion {
    /// Sub-id 0x8f error replies
    Hidpp10,
    /// Feature index 0xff error replies
    Hidpp20,
}

/// A device-reported error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError {
    pub version: ErrorVersion,
    /// The error code byte of the reply
    pub code: u8,
    /// Address byte of the failed request, echoed by the device
    ///
    /// Function id in the high nibble, software id in the low nibble. HID++
    /// error replies carry no sub-code beyond [`ProtocolError::code`].
    pub echoed_address: u8,
}

impl ProtocolError {
    /// Human-readable name of the error code
    pub fn name(&self) -> &'static str {
        match self.version {
            ErrorVersion::Hidpp10 => match self.code {
                0x00 => "Success",
                0x01 => "InvalidSubId",
                0x02 => "InvalidAddress",
                0x03 => "InvalidValue",
                0x04 => "ConnectFail",
                0x05 => "TooManyDevices",
                0x06 => "AlreadyExists",
                0x07 => "Busy",
                0x08 => "UnknownDevice",
                0x09 => "ResourceError",
                0x0a => "RequestUnavailable",
                0x0b => "InvalidParamValue",
                0x0c => "WrongPinCode",
                _ => "Unknown",
            },
            ErrorVersion::Hidpp20 => match self.code {
                0x00 => "NoError",
                0x01 => "Unknown",
                0x02 => "InvalidArgument",
                0x03 => "OutOfRange",
                0x04 => "HardwareError",
                0x05 => "LogitechInternal",
                0x06 => "InvalidFeatureIndex",
                0x07 => "InvalidFunctionId",
                0x08 => "Busy",
                0x09 => "Unsupported",
                _ => "Unknown",
            },
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self.version {
            ErrorVersion::Hidpp10 => "HID++ 1.0",
            ErrorVersion::Hidpp20 => "HID++ 2.0",
        };
        write!(
            f,
            "{} error 0x{:02x} ({}) for address 0x{:02x}",
            version,
            self.code,
            self.name(),
            self.echoed_address
        )
    }
}

/// Ways a HID++ request can fail
#[derive(Debug, Error)]
pub enum HidppError {
    /// The device answered with an error reply
    #[error("device reported {0}")]
    Protocol(ProtocolError),

    /// No reply arrived before the request expired
    #[error("request timed out")]
    Timeout,

    /// The connection closed while the request was pending
    #[error("device disconnected")]
    Disconnected,

    /// The request never reached the device
    #[error("request could not be written: {0}")]
    Write(#[from] SendError),

    /// The reply arrived but its payload made no sense
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The device does not expose the feature the request needs
    #[error("feature 0x{0:04x} is not supported by the device")]
    FeatureUnsupported(u16),
}

/// Errors raised while creating or writing to the synthetic input device
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("/dev/uinput does not exist - is the uinput module loaded?")]
    DeviceNodeMissing,

    #[error("permission denied opening /dev/uinput")]
    PermissionDenied,

    #[error("failed to create virtual device: {0}")]
    CreateFailed(#[source] std::io::Error),

    /// Batches must end with SYN_REPORT
    #[error("event batch is not terminated by SYN_REPORT")]
    Unterminated,

    #[error("failed to emit events: {0}")]
    Write(#[source] std::io::Error),
}

/// Errors raised while describing a node during enumeration
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("udev lookup for {path} failed: {source}")]
    Udev {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} has no usable HID_ID property")]
    MissingHidId { path: PathBuf },
}
