//! Device core for HID presenter devices
//!
//! Discovers supported presenters, reads their input through evdev, matches
//! configured key sequences, re-injects events through a uinput device and
//! talks HID++ to the devices that support it.

pub mod action_executor;
pub mod connection;
pub mod device;
pub mod device_manager;
pub mod emitter;
pub mod error;
pub mod events;
pub mod hidpp;
pub mod hotplug;
pub mod input_mapper;
pub mod input_task;

pub use device::{scan, DeviceIdentity, ScanResult, SupportedDevices};
pub use device_manager::{DeviceManager, ManagerEvent};
pub use events::{CoreEvent, SemanticAction};
