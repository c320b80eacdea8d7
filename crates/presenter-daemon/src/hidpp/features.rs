//! HID++ 2.0 feature access
//!
//! Feature indices are assigned by the device, so every feature is first
//! resolved from its 16-bit code through the root feature. [`HidppDevice`]
//! bundles a running engine handle, the device index to address, and the
//! resolved [`FeatureTable`].

use std::collections::HashMap;
use std::fmt;

use crate::error::{ErrorVersion, HidppError};
use crate::hidpp::engine::HidppHandle;
use crate::hidpp::message::HidppMessage;

// ============================================================================
// Constants
// ============================================================================

/// Software id placed in the low nibble of every address we send
pub const SOFTWARE_ID: u8 = 0x07;

/// Device index of a device attached directly (Bluetooth)
pub const DIRECT_DEVICE_INDEX: u8 = 0xff;
/// Device index of the first device paired to a receiver
pub const RECEIVER_DEVICE_INDEX: u8 = 0x01;

/// Root feature, always at index 0
pub const ROOT_FEATURE_INDEX: u8 = 0x00;

/// Byte echoed back by a ping
const PING_MARKER: u8 = 0x5a;

/// HID++ 2.0 feature codes
pub mod feature_code {
    pub const ROOT: u16 = 0x0000;
    pub const FEATURE_SET: u16 = 0x0001;
    pub const FIRMWARE_INFO: u16 = 0x0003;
    pub const DEVICE_NAME: u16 = 0x0005;
    pub const BATTERY_STATUS: u16 = 0x1000;
    pub const PRESENTER_CONTROL: u16 = 0x1a00;
    pub const REPROG_CONTROLS_V4: u16 = 0x1b04;
    pub const POINTER_SPEED: u16 = 0x2205;
}

/// Features resolved when a raw-protocol connection comes up
pub const QUERIED_FEATURES: &[u16] = &[
    feature_code::FEATURE_SET,
    feature_code::FIRMWARE_INFO,
    feature_code::DEVICE_NAME,
    feature_code::BATTERY_STATUS,
    feature_code::PRESENTER_CONTROL,
    feature_code::REPROG_CONTROLS_V4,
    feature_code::POINTER_SPEED,
];

/// Highest pointer speed accepted by feature 0x2205
pub const MAX_POINTER_SPEED: u8 = 9;

// ============================================================================
// Types
// ============================================================================

/// Protocol version reported by a ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const HIDPP10: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    /// Whether the device speaks the feature-based HID++ 2.0 protocol
    pub fn supports_features(&self) -> bool {
        self.major >= 2
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Mapping from feature code to device-assigned feature index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTable {
    indices: HashMap<u16, u8>,
}

impl FeatureTable {
    pub fn insert(&mut self, code: u16, index: u8) {
        self.indices.insert(code, index);
    }

    /// Index of a feature, or `None` if the device lacks it
    pub fn index_of(&self, code: u16) -> Option<u8> {
        self.indices.get(&code).copied()
    }

    pub fn supports(&self, code: u16) -> bool {
        self.indices.contains_key(&code)
    }
}

/// Charging state reported by feature 0x1000
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingStatus {
    Discharging,
    Recharging,
    AlmostFull,
    Full,
    SlowRecharge,
    InvalidBattery,
    ThermalError,
    Unknown(u8),
}

impl From<u8> for ChargingStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ChargingStatus::Discharging,
            1 => ChargingStatus::Recharging,
            2 => ChargingStatus::AlmostFull,
            3 => ChargingStatus::Full,
            4 => ChargingStatus::SlowRecharge,
            5 => ChargingStatus::InvalidBattery,
            6 => ChargingStatus::ThermalError,
            other => ChargingStatus::Unknown(other),
        }
    }
}

/// Battery state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryInfo {
    /// Current level in percent
    pub level: u8,
    /// Next level the device will report, in percent
    pub next_level: u8,
    pub status: ChargingStatus,
}

impl BatteryInfo {
    /// Decode the payload of a battery status reply or notification
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            [level, next_level, status, ..] => Some(Self {
                level: *level,
                next_level: *next_level,
                status: ChargingStatus::from(*status),
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Root `ping` request; the reply carries the protocol version
pub fn ping_request(device_index: u8) -> HidppMessage {
    HidppMessage::short(
        device_index,
        ROOT_FEATURE_INDEX,
        0x1,
        SOFTWARE_ID,
        [0x00, 0x00, PING_MARKER],
    )
}

/// Root `getFeature` request for one feature code
pub fn get_feature_request(device_index: u8, code: u16) -> HidppMessage {
    let [hi, lo] = code.to_be_bytes();
    HidppMessage::short(device_index, ROOT_FEATURE_INDEX, 0x0, SOFTWARE_ID, [hi, lo, 0x00])
}

/// Interpret the result of a ping
///
/// HID++ 1.0 devices answer a ping with an "invalid sub-id" error.
pub fn protocol_version_from(
    result: Result<HidppMessage, HidppError>,
) -> Result<ProtocolVersion, HidppError> {
    match result {
        Ok(reply) => match reply.payload() {
            [major, minor, ..] => Ok(ProtocolVersion {
                major: *major,
                minor: *minor,
            }),
            _ => Err(HidppError::UnexpectedReply(format!("ping reply {}", reply))),
        },
        Err(HidppError::Protocol(e)) if e.version == ErrorVersion::Hidpp10 && e.code == 0x01 => {
            Ok(ProtocolVersion::HIDPP10)
        }
        Err(e) => Err(e),
    }
}

/// A HID++ device reachable through a running engine
#[derive(Debug, Clone)]
pub struct HidppDevice {
    handle: HidppHandle,
    device_index: u8,
    features: FeatureTable,
}

impl HidppDevice {
    pub fn new(handle: HidppHandle, device_index: u8) -> Self {
        Self {
            handle,
            device_index,
            features: FeatureTable::default(),
        }
    }

    pub fn handle(&self) -> &HidppHandle {
        &self.handle
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn features(&self) -> &FeatureTable {
        &self.features
    }

    /// Query the protocol version
    pub async fn ping(&self) -> Result<ProtocolVersion, HidppError> {
        protocol_version_from(self.handle.request(ping_request(self.device_index)).await)
    }

    /// Resolve the indices of `codes`
    ///
    /// All lookups are issued as one batch that keeps going past failures;
    /// features the device does not know are simply left out of the table.
    pub async fn resolve_features(&mut self, codes: &[u16]) -> &FeatureTable {
        let requests = codes
            .iter()
            .map(|&code| get_feature_request(self.device_index, code))
            .collect();
        let results = self.handle.send_batch(requests, true).await;

        for (&code, result) in codes.iter().zip(results) {
            match result {
                Ok(reply) => match reply.payload().first() {
                    Some(&0) | None => {
                        tracing::trace!(feature = code, "Feature not present");
                    }
                    Some(&index) => {
                        tracing::debug!(feature = code, index, "Resolved HID++ feature");
                        self.features.insert(code, index);
                    }
                },
                Err(e) => {
                    tracing::debug!(feature = code, error = %e, "Feature lookup failed");
                }
            }
        }
        &self.features
    }

    fn feature_index(&self, code: u16) -> Result<u8, HidppError> {
        self.features
            .index_of(code)
            .ok_or(HidppError::FeatureUnsupported(code))
    }

    /// Read the current battery state
    pub async fn battery_status(&self) -> Result<BatteryInfo, HidppError> {
        let index = self.feature_index(feature_code::BATTERY_STATUS)?;
        let reply = self
            .handle
            .request(HidppMessage::long(self.device_index, index, 0x0, SOFTWARE_ID, &[]))
            .await?;
        BatteryInfo::from_payload(reply.payload())
            .ok_or_else(|| HidppError::UnexpectedReply(format!("battery reply {}", reply)))
    }

    /// Vibrate the device
    ///
    /// # Arguments
    ///
    /// * `length` - Vibration length in device units
    /// * `intensity` - Vibration strength, 0..=255
    pub async fn vibrate(&self, length: u8, intensity: u8) -> Result<(), HidppError> {
        let index = self.feature_index(feature_code::PRESENTER_CONTROL)?;
        self.handle
            .request(HidppMessage::long(
                self.device_index,
                index,
                0x1,
                SOFTWARE_ID,
                &[length, 0xe8, intensity],
            ))
            .await?;
        Ok(())
    }

    /// Set the pointer speed, clamped to 0..=9
    pub async fn set_pointer_speed(&self, speed: u8) -> Result<(), HidppError> {
        let index = self.feature_index(feature_code::POINTER_SPEED)?;
        let speed = speed.min(MAX_POINTER_SPEED);
        self.handle
            .request(HidppMessage::long(
                self.device_index,
                index,
                0x1,
                SOFTWARE_ID,
                &[0x10 + speed],
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
impl HidppDevice {
    /// Pretend `code` was resolved to `index`
    pub(crate) fn with_feature(mut self, code: u16, index: u8) -> Self {
        self.features.insert(code, index);
        self
    }
}
