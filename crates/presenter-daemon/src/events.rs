//! Notifications published by the device core
//!
//! Collaborators (overlay, tray, settings UI) receive these over an
//! unbounded channel handed to the [`DeviceManager`](crate::device_manager::DeviceManager).

use tokio::sync::mpsc;

use crate::connection::Capabilities;
use crate::device::DeviceIdentity;
use crate::hidpp::{BatteryInfo, ProtocolVersion};

/// Semantic actions the core does not perform itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticAction {
    ToggleSpotlight,
    CyclePresets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A physical device got its first sub-connection
    DeviceConnected { identity: DeviceIdentity, name: String },
    /// A physical device lost its last sub-connection
    DeviceDisconnected { identity: DeviceIdentity, name: String },
    /// The number of connected devices changed between zero and non-zero
    AnyDeviceConnected(bool),
    /// Pointer motion started or stopped on a device
    SpotActive { identity: DeviceIdentity, active: bool },
    /// A mapped sequence asked for a semantic action
    Action {
        identity: DeviceIdentity,
        action: SemanticAction,
    },
    /// HID++ features of a device were resolved
    DeviceFeatures {
        identity: DeviceIdentity,
        protocol: ProtocolVersion,
        capabilities: Capabilities,
    },
    /// Battery state was read or changed
    Battery {
        identity: DeviceIdentity,
        info: BatteryInfo,
    },
}

/// Sending half used throughout the core
pub type EventSender = mpsc::UnboundedSender<CoreEvent>;

/// Publish an event, ignoring a receiver that has gone away
pub(crate) fn publish(events: &EventSender, event: CoreEvent) {
    if events.send(event).is_err() {
        tracing::trace!("No listener for core events");
    }
}
