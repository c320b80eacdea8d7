//! HID++ frame codec
//!
//! Frames are fixed-width:
//!
//! ```text
//! short (7 bytes):  [0x10, device_index, sub_id,        address, payload x3 ]
//! long  (20 bytes): [0x11, device_index, feature_index, address, payload x16]
//! ```
//!
//! `address` packs the function id in its high nibble and the software id in
//! its low nibble. Error replies reuse the layout: byte 2 is `0x8f` (HID++ 1.0)
//! or `0xff` (HID++ 2.0), bytes 3 and 4 echo the failed request's sub-id and
//! address, and byte 5 carries the error code.

use std::fmt;

use crate::error::{ErrorVersion, FrameError, ProtocolError};

// ============================================================================
// Constants
// ============================================================================

/// Report id of a short frame
pub const SHORT_REPORT_ID: u8 = 0x10;
/// Report id of a long frame
pub const LONG_REPORT_ID: u8 = 0x11;

/// Total length of a short frame
pub const SHORT_LEN: usize = 7;
/// Total length of a long frame
pub const LONG_LEN: usize = 20;

/// Payload bytes carried by a short frame
pub const SHORT_PAYLOAD_LEN: usize = SHORT_LEN - HEADER_LEN;
/// Payload bytes carried by a long frame
pub const LONG_PAYLOAD_LEN: usize = LONG_LEN - HEADER_LEN;

const HEADER_LEN: usize = 4;

/// Sub-id marking a HID++ 1.0 error reply
pub const HIDPP10_ERROR: u8 = 0x8f;
/// Feature index marking a HID++ 2.0 error reply
pub const HIDPP20_ERROR: u8 = 0xff;

const ERROR_SUB_ID_OFFSET: usize = 3;
const ERROR_ADDRESS_OFFSET: usize = 4;
const ERROR_CODE_OFFSET: usize = 5;

/// Size class of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Short,
    Long,
}

impl FrameKind {
    pub fn report_id(self) -> u8 {
        match self {
            FrameKind::Short => SHORT_REPORT_ID,
            FrameKind::Long => LONG_REPORT_ID,
        }
    }

    pub fn len(self) -> usize {
        match self {
            FrameKind::Short => SHORT_LEN,
            FrameKind::Long => LONG_LEN,
        }
    }

    fn from_len(len: usize) -> Option<Self> {
        match len {
            SHORT_LEN => Some(FrameKind::Short),
            LONG_LEN => Some(FrameKind::Long),
            _ => None,
        }
    }
}

/// Key used to correlate a reply with the request that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub device_index: u8,
    pub sub_id: u8,
    pub address: u8,
}

/// Pack a function id and software id into an address byte
pub fn pack_address(function: u8, software_id: u8) -> u8 {
    ((function & 0x0f) << 4) | (software_id & 0x0f)
}

// ============================================================================
// HidppMessage
// ============================================================================

/// A validated HID++ frame
///
/// A value of this type always has a length of 7 or 20 bytes with the
/// matching report id in byte 0.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HidppMessage {
    kind: FrameKind,
    data: [u8; LONG_LEN],
}

impl HidppMessage {
    /// Build a short frame
    pub fn short(
        device_index: u8,
        sub_id: u8,
        function: u8,
        software_id: u8,
        payload: [u8; SHORT_PAYLOAD_LEN],
    ) -> Self {
        let mut data = [0u8; LONG_LEN];
        data[0] = SHORT_REPORT_ID;
        data[1] = device_index;
        data[2] = sub_id;
        data[3] = pack_address(function, software_id);
        data[HEADER_LEN..SHORT_LEN].copy_from_slice(&payload);
        Self {
            kind: FrameKind::Short,
            data,
        }
    }

    /// Build a long frame
    ///
    /// The payload is zero-padded to 16 bytes; anything beyond 16 bytes is
    /// dropped.
    pub fn long(
        device_index: u8,
        feature_index: u8,
        function: u8,
        software_id: u8,
        payload: &[u8],
    ) -> Self {
        let mut data = [0u8; LONG_LEN];
        data[0] = LONG_REPORT_ID;
        data[1] = device_index;
        data[2] = feature_index;
        data[3] = pack_address(function, software_id);
        let n = payload.len().min(LONG_PAYLOAD_LEN);
        data[HEADER_LEN..HEADER_LEN + n].copy_from_slice(&payload[..n]);
        Self {
            kind: FrameKind::Long,
            data,
        }
    }

    /// Decode a frame read from the transport
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the length is not 7 or 20 bytes, or the
    /// report id does not match the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let kind = FrameKind::from_len(bytes.len()).ok_or(FrameError::InvalidLength(bytes.len()))?;
        if bytes[0] != kind.report_id() {
            return Err(FrameError::ReportIdMismatch {
                report_id: bytes[0],
                len: bytes.len(),
            });
        }
        let mut data = [0u8; LONG_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { kind, data })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.kind.len()
    }

    /// Frames are never empty; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The wire bytes of this frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.kind.len()]
    }

    pub fn report_id(&self) -> u8 {
        self.data[0]
    }

    pub fn device_index(&self) -> u8 {
        self.data[1]
    }

    /// Sub-id (HID++ 1.0 naming) of this frame
    pub fn sub_id(&self) -> u8 {
        self.data[2]
    }

    /// Feature index (HID++ 2.0 naming); same byte as [`Self::sub_id`]
    pub fn feature_index(&self) -> u8 {
        self.data[2]
    }

    pub fn address(&self) -> u8 {
        self.data[3]
    }

    pub fn function(&self) -> u8 {
        self.data[3] >> 4
    }

    pub fn software_id(&self) -> u8 {
        self.data[3] & 0x0f
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..self.kind.len()]
    }

    /// Widen a short frame to a long one, zero-padding the payload
    ///
    /// Long frames are returned unchanged. There is no narrowing counterpart.
    pub fn to_long(&self) -> Self {
        match self.kind {
            FrameKind::Long => *self,
            FrameKind::Short => {
                let mut data = self.data;
                data[0] = LONG_REPORT_ID;
                Self {
                    kind: FrameKind::Long,
                    data,
                }
            }
        }
    }

    /// Correlation key of a request (or of the reply it expects)
    pub fn request_key(&self) -> RequestKey {
        RequestKey {
            device_index: self.device_index(),
            sub_id: self.sub_id(),
            address: self.address(),
        }
    }

    /// Whether this frame is an error reply
    pub fn is_error(&self) -> bool {
        self.error_version().is_some()
    }

    fn error_version(&self) -> Option<ErrorVersion> {
        match self.sub_id() {
            HIDPP10_ERROR => Some(ErrorVersion::Hidpp10),
            HIDPP20_ERROR => Some(ErrorVersion::Hidpp20),
            _ => None,
        }
    }

    /// Key of the request an error reply refers to
    ///
    /// Returns `None` for frames that are not error replies.
    pub fn error_request_key(&self) -> Option<RequestKey> {
        self.error_version().map(|_| RequestKey {
            device_index: self.device_index(),
            sub_id: self.data[ERROR_SUB_ID_OFFSET],
            address: self.data[ERROR_ADDRESS_OFFSET],
        })
    }

    /// Decode the error carried by an error reply
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        self.error_version().map(|version| ProtocolError {
            version,
            code: self.data[ERROR_CODE_OFFSET],
            echoed_address: self.data[ERROR_ADDRESS_OFFSET],
        })
    }
}

impl fmt::Debug for HidppMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HidppMessage({})", self)
    }
}

impl fmt::Display for HidppMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
