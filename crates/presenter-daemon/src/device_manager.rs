//! Device management and hot-plug support
//!
//! This module provides the [`DeviceManager`], which owns the arena of
//! [`DeviceConnection`]s keyed by [`DeviceIdentity`] and runs the event loop
//! everything else reports to.
//!
//! # Overview
//!
//! The `DeviceManager` is responsible for:
//! - Opening the sub-devices found by the initial scan
//! - Opening hotplugged nodes (through retrying tasks)
//! - Tearing a device down once all of its sub-devices have failed
//! - Bringing up HID++ on protocol sub-devices and tracking capabilities
//! - Pushing configuration reloads to every device's input task
//! - Publishing [`CoreEvent`]s
//!
//! Tasks never touch the arena directly; they send a [`ManagerEvent`] and
//! the loop handles it on its next iteration.
//!
//! # Example
//!
//! ```ignore
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut manager = DeviceManager::new(&config, executor, events);
//! manager.attach_scan(&scan(manager.supported()));
//! manager.run().await;
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use presenter_config::Config;
use tokio::sync::mpsc;

use crate::action_executor::ActionExecutor;
use crate::connection::{
    spawn_sub_device, Capabilities, DeviceConnection, SubDeviceConnection, SubDeviceContext,
    SubDeviceHandle,
};
use crate::device::{Bus, DeviceIdentity, InterfaceKind, ScanResult, ScannedDevice, SupportedDevices};
use crate::events::{publish, CoreEvent, EventSender};
use crate::hidpp::features::{feature_code, QUERIED_FEATURES};
use crate::hidpp::{BatteryInfo, HidppDevice, ProtocolVersion};
use crate::hotplug::open_hotplugged;
use crate::input_mapper::mappings_from_config;
use crate::input_task::{spawn_input_task, InputCommand, InputSettings};

/// Messages handled by the [`DeviceManager`] loop
pub enum ManagerEvent {
    /// A device node appeared in a watched directory
    NodeAdded(PathBuf),
    /// A hotplugged node has been opened
    SubDeviceOpened {
        device: ScannedDevice,
        connection: SubDeviceConnection,
    },
    /// A sub-device task stopped after a read error
    SubDeviceLost {
        identity: DeviceIdentity,
        path: PathBuf,
    },
    /// HID++ answered and its features are resolved
    ProtocolReady {
        identity: DeviceIdentity,
        device: HidppDevice,
        version: ProtocolVersion,
    },
    Battery {
        identity: DeviceIdentity,
        info: BatteryInfo,
    },
    /// Apply a freshly loaded configuration
    Reload(Box<Config>),
    Shutdown,
}

/// The parts of the configuration the manager hands out
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub supported: SupportedDevices,
    pub input: InputSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supported: SupportedDevices::with_additional(&config.supported_devices),
            input: InputSettings {
                mappings: mappings_from_config(&config.mappings).into(),
                sequence_interval: Duration::from_millis(config.global.sequence_interval_ms),
                spot_timeout: Duration::from_millis(config.global.spot_timeout_ms),
            },
        }
    }
}

/// Owns every device connection of the process.
///
/// The `DeviceManager` is not thread-safe. It is owned by the single task
/// running [`DeviceManager::run`]; everything else talks to it through
/// [`DeviceManager::sender`].
pub struct DeviceManager {
    devices: HashMap<DeviceIdentity, DeviceConnection>,
    settings: ManagerSettings,
    /// Present when the virtual device exists; event nodes are only grabbed then
    executor: Option<ActionExecutor>,
    events: EventSender,
    sender: mpsc::UnboundedSender<ManagerEvent>,
    receiver: mpsc::UnboundedReceiver<ManagerEvent>,
}

impl DeviceManager {
    /// Create a `DeviceManager` with no devices.
    ///
    /// # Arguments
    ///
    /// * `config` - The parsed configuration
    /// * `executor` - Output path through the virtual device, if one was created
    /// * `events` - Where [`CoreEvent`]s are published
    pub fn new(config: &Config, executor: Option<ActionExecutor>, events: EventSender) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            devices: HashMap::new(),
            settings: ManagerSettings::from_config(config),
            executor,
            events,
            sender,
            receiver,
        }
    }

    /// Sender for reporting to this manager
    pub fn sender(&self) -> mpsc::UnboundedSender<ManagerEvent> {
        self.sender.clone()
    }

    pub fn supported(&self) -> &SupportedDevices {
        &self.settings.supported
    }

    /// Returns the number of connected physical devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, identity: &DeviceIdentity) -> Option<&DeviceConnection> {
        self.devices.get(identity)
    }

    fn grab_enabled(&self) -> bool {
        self.executor.is_some()
    }

    fn is_open(&self, path: &Path) -> bool {
        self.devices.values().any(|d| d.has_sub_device(path))
    }

    // ========================================================================
    // Attaching
    // ========================================================================

    /// Open every sub-device of a scan result
    ///
    /// Sub-devices that fail to open are logged and skipped.
    ///
    /// # Returns
    ///
    /// The number of sub-devices opened.
    pub fn attach_scan(&mut self, scan: &ScanResult) -> usize {
        let mut opened = 0;
        for device in &scan.devices {
            for descriptor in &device.sub_devices {
                match SubDeviceConnection::open(
                    descriptor,
                    &device.identity,
                    device.bus,
                    self.grab_enabled(),
                ) {
                    Ok(connection) => {
                        if self.insert_sub_device(&device.identity, &device.name, device.bus, connection) {
                            opened += 1;
                        }
                    }
                    Err(e) => tracing::warn!(
                        device = %device.identity,
                        path = %descriptor.devnode.display(),
                        error = %e,
                        "Could not open sub-device"
                    ),
                }
            }
        }
        tracing::info!(
            devices = self.devices.len(),
            sub_devices = opened,
            "Attached scanned devices"
        );
        opened
    }

    /// Hand an opened sub-device to a task and add it to its device
    ///
    /// Returns false if the node was already open, or is a second protocol
    /// node for a device that already has one.
    pub fn insert_sub_device(
        &mut self,
        identity: &DeviceIdentity,
        name: &str,
        bus: Bus,
        connection: SubDeviceConnection,
    ) -> bool {
        let path = connection.path().to_path_buf();
        if self.is_open(&path) {
            tracing::debug!(path = %path.display(), "Sub-device already open");
            return false;
        }
        if connection.kind() == InterfaceKind::RawProtocol
            && self
                .devices
                .get(identity)
                .is_some_and(|d| d.has_protocol_sub_device())
        {
            tracing::debug!(
                device = %identity,
                path = %path.display(),
                "Device already has a protocol sub-device"
            );
            return false;
        }

        let capabilities = match &connection {
            SubDeviceConnection::Event(sub) => sub.capabilities(),
            SubDeviceConnection::Protocol(_) => Capabilities::empty(),
        };
        self.attach_with(identity, name, bus, capabilities, |context| {
            spawn_sub_device(connection, context, bus)
        })
    }

    fn attach_with(
        &mut self,
        identity: &DeviceIdentity,
        name: &str,
        bus: Bus,
        capabilities: Capabilities,
        spawn: impl FnOnce(SubDeviceContext) -> io::Result<(SubDeviceHandle, Option<HidppDevice>)>,
    ) -> bool {
        let created = !self.devices.contains_key(identity);
        let connection = self.devices.entry(identity.clone()).or_insert_with(|| {
            let (input, task) = spawn_input_task(
                identity.clone(),
                self.settings.input.clone(),
                self.executor.clone(),
                self.events.clone(),
            );
            DeviceConnection::new(identity.clone(), name.to_string(), bus, input, task)
        });

        let context = SubDeviceContext {
            identity: identity.clone(),
            input: connection.input_sender(),
            manager: self.sender.clone(),
        };
        let (handle, protocol) = match spawn(context) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(device = %identity, error = %e, "Could not start sub-device");
                if created {
                    // Nothing was published for it yet
                    self.devices.remove(identity);
                }
                return false;
            }
        };

        tracing::debug!(
            device = %identity,
            path = %handle.path().display(),
            kind = %handle.kind(),
            grabbed = handle.is_grabbed(),
            "Sub-device attached"
        );
        connection.add_sub_device(handle, capabilities);
        let exclusive = connection.is_exclusively_owned();
        if let Some(device) = protocol {
            let task = tokio::spawn(initialize_protocol(
                identity.clone(),
                device,
                self.sender.clone(),
            ));
            connection.add_background(task);
        }

        if created {
            tracing::info!(device = %identity, name, exclusive, "Device connected");
            publish(
                &self.events,
                CoreEvent::DeviceConnected {
                    identity: identity.clone(),
                    name: name.to_string(),
                },
            );
            if self.devices.len() == 1 {
                publish(&self.events, CoreEvent::AnyDeviceConnected(true));
            }
        }
        true
    }

    // ========================================================================
    // Detaching
    // ========================================================================

    /// Close the sub-device at `path`, and the device if it was the last one
    pub async fn remove_sub_device(&mut self, identity: &DeviceIdentity, path: &Path) {
        let Some(connection) = self.devices.get_mut(identity) else {
            tracing::debug!(device = %identity, "Device not connected, nothing to release");
            return;
        };
        if let Some(handle) = connection.remove_sub_device(path) {
            handle.close().await;
        }
        if connection.sub_device_count() > 0 {
            return;
        }

        if let Some(connection) = self.devices.remove(identity) {
            let name = connection.name().to_string();
            connection.close().await;
            tracing::info!(device = %identity, name = %name, "Device disconnected");
            publish(
                &self.events,
                CoreEvent::DeviceDisconnected {
                    identity: identity.clone(),
                    name,
                },
            );
            if self.devices.is_empty() {
                publish(&self.events, CoreEvent::AnyDeviceConnected(false));
            }
        }
    }

    /// Close every device
    pub async fn shutdown(&mut self) {
        if self.devices.is_empty() {
            return;
        }
        let identities: Vec<DeviceIdentity> = self.devices.keys().cloned().collect();
        for identity in identities {
            if let Some(connection) = self.devices.remove(&identity) {
                let name = connection.name().to_string();
                connection.close().await;
                publish(&self.events, CoreEvent::DeviceDisconnected { identity, name });
            }
        }
        publish(&self.events, CoreEvent::AnyDeviceConnected(false));
        tracing::info!("All devices released");
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Apply a new configuration to every device
    ///
    /// Matchers are rebuilt and reset; held-back events are forwarded.
    pub fn reconfigure(&mut self, config: &Config) {
        self.settings = ManagerSettings::from_config(config);
        for connection in self.devices.values() {
            connection.send_input(InputCommand::Reconfigure(self.settings.input.clone()));
        }
        tracing::info!(
            mappings = self.settings.input.mappings.len(),
            devices = self.devices.len(),
            "Configuration applied"
        );
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Handle one event; returns false once shutdown was requested
    pub async fn handle_event(&mut self, event: ManagerEvent) -> bool {
        match event {
            ManagerEvent::NodeAdded(path) => self.handle_node_added(path),
            ManagerEvent::SubDeviceOpened { device, connection } => {
                self.insert_sub_device(&device.identity, &device.name, device.bus, connection);
            }
            ManagerEvent::SubDeviceLost { identity, path } => {
                self.remove_sub_device(&identity, &path).await;
            }
            ManagerEvent::ProtocolReady {
                identity,
                device,
                version,
            } => self.handle_protocol_ready(identity, device, version),
            ManagerEvent::Battery { identity, info } => {
                if self.devices.contains_key(&identity) {
                    tracing::debug!(device = %identity, level = info.level, "Battery status");
                    publish(&self.events, CoreEvent::Battery { identity, info });
                }
            }
            ManagerEvent::Reload(config) => self.reconfigure(&config),
            ManagerEvent::Shutdown => return false,
        }
        true
    }

    fn handle_node_added(&self, path: PathBuf) {
        if self.is_open(&path) {
            return;
        }
        tracing::debug!(path = %path.display(), "Device node appeared");
        let sender = self.sender.clone();
        let supported = self.settings.supported.clone();
        let grab = self.grab_enabled();
        tokio::spawn(async move {
            if let Some((device, connection)) = open_hotplugged(path, supported, grab).await {
                let _ = sender.send(ManagerEvent::SubDeviceOpened { device, connection });
            }
        });
    }

    fn handle_protocol_ready(
        &mut self,
        identity: DeviceIdentity,
        device: HidppDevice,
        version: ProtocolVersion,
    ) {
        let Some(connection) = self.devices.get_mut(&identity) else {
            return;
        };
        if !connection.has_protocol_sub_device() {
            return;
        }
        connection.set_protocol(device);
        let capabilities = connection.capabilities();
        tracing::info!(
            device = %identity,
            bus = %connection.bus(),
            protocol = %version,
            capabilities = ?capabilities,
            "HID++ ready"
        );
        publish(
            &self.events,
            CoreEvent::DeviceFeatures {
                identity,
                protocol: version,
                capabilities,
            },
        );
    }

    /// Process events until [`ManagerEvent::Shutdown`], then close everything
    pub async fn run(&mut self) {
        while let Some(event) = self.receiver.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        self.shutdown().await;
    }
}

/// Bring up HID++ on a freshly opened protocol sub-device
///
/// Pings the device, resolves its features, reports them, then keeps
/// reporting battery changes until the engine stops.
async fn initialize_protocol(
    identity: DeviceIdentity,
    mut device: HidppDevice,
    manager: mpsc::UnboundedSender<ManagerEvent>,
) {
    let version = match device.ping().await {
        Ok(version) => version,
        Err(e) => {
            tracing::warn!(device = %identity, error = %e, "HID++ device did not answer ping");
            return;
        }
    };
    if version.supports_features() {
        device.resolve_features(QUERIED_FEATURES).await;
    }
    let battery_index = device.features().index_of(feature_code::BATTERY_STATUS);

    let ready = ManagerEvent::ProtocolReady {
        identity: identity.clone(),
        device: device.clone(),
        version,
    };
    if manager.send(ready).is_err() {
        return;
    }

    let Some(battery_index) = battery_index else {
        return;
    };
    match device.battery_status().await {
        Ok(info) => {
            let _ = manager.send(ManagerEvent::Battery {
                identity: identity.clone(),
                info,
            });
        }
        Err(e) => tracing::debug!(device = %identity, error = %e, "Battery query failed"),
    }

    let Some(mut notifications) = device.handle().subscribe(battery_index).await else {
        return;
    };
    while let Some(message) = notifications.recv().await {
        // Broadcast events carry software id 0
        if message.function() != 0 || message.software_id() != 0 {
            continue;
        }
        if let Some(info) = BatteryInfo::from_payload(message.payload()) {
            if manager
                .send(ManagerEvent::Battery {
                    identity: identity.clone(),
                    info,
                })
                .is_err()
            {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{dummy_sub, identity};
    use crate::device::SubDeviceDescriptor;
    use crate::emitter::{VirtualDevice, VIRTUAL_PRODUCT_ID, VIRTUAL_VENDOR_ID};
    use crate::hidpp::engine::testing::{reply_to, spawn_engine, RecordingWriter};
    use crate::hidpp::features::{ChargingStatus, DIRECT_DEVICE_INDEX};
    use crate::hidpp::{HidppHandle, HidppMessage};

    fn other_identity() -> DeviceIdentity {
        DeviceIdentity {
            phys: "usb-0000:00:14.0-4".to_string(),
            ..identity()
        }
    }

    fn manager() -> (DeviceManager, mpsc::UnboundedReceiver<CoreEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (DeviceManager::new(&Config::default(), None, events), rx)
    }

    fn attach(manager: &mut DeviceManager, identity: &DeviceIdentity, path: &str, kind: InterfaceKind) -> bool {
        let handle = dummy_sub(path, kind);
        manager.attach_with(identity, "Spotlight", Bus::Usb, Capabilities::RELATIVE_MOTION, |_| {
            Ok((handle, None))
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_device_connected_fires_once_per_device() {
        let (mut manager, mut rx) = manager();

        assert!(attach(&mut manager, &identity(), "/dev/input/event5", InterfaceKind::RawEvent));
        assert!(attach(&mut manager, &identity(), "/dev/input/event6", InterfaceKind::RawEvent));
        assert_eq!(
            drain(&mut rx),
            vec![
                CoreEvent::DeviceConnected {
                    identity: identity(),
                    name: "Spotlight".to_string(),
                },
                CoreEvent::AnyDeviceConnected(true),
            ]
        );

        assert!(attach(&mut manager, &other_identity(), "/dev/input/event9", InterfaceKind::RawEvent));
        assert_eq!(
            drain(&mut rx),
            vec![CoreEvent::DeviceConnected {
                identity: other_identity(),
                name: "Spotlight".to_string(),
            }]
        );
        assert_eq!(manager.device_count(), 2);
        assert_eq!(manager.device(&identity()).unwrap().sub_device_count(), 2);
    }

    /// Opens a real uinput-backed node, so it needs access to /dev/uinput.
    /// Skipped where that is unavailable.
    #[tokio::test(start_paused = true)]
    async fn test_opened_event_node_connects_device_with_relative_motion() {
        let mut virtual_device = match VirtualDevice::new("presenter-test-pointer") {
            Ok(device) => device,
            Err(e) => {
                eprintln!("Skipping test_opened_event_node_connects_device_with_relative_motion: {}", e);
                return;
            }
        };
        let devnode = virtual_device.event_node().unwrap();
        let identity = DeviceIdentity {
            vendor_id: VIRTUAL_VENDOR_ID,
            product_id: VIRTUAL_PRODUCT_ID,
            phys: "presenter-test".to_string(),
        };
        let descriptor = SubDeviceDescriptor {
            devnode: devnode.clone(),
            kind: InterfaceKind::RawEvent,
            supports_relative_motion: true,
            readable: true,
            writable: true,
        };
        let connection = match SubDeviceConnection::open(&descriptor, &identity, Bus::Usb, false) {
            Ok(connection) => connection,
            Err(e) => {
                eprintln!("Skipping test_opened_event_node_connects_device_with_relative_motion: {}", e);
                return;
            }
        };

        let (mut manager, mut rx) = manager();
        assert!(manager.insert_sub_device(&identity, "Pointer", Bus::Usb, connection));

        let device = manager.device(&identity).unwrap();
        assert!(device.capabilities().contains(Capabilities::RELATIVE_MOTION));
        assert!(!device.is_exclusively_owned());
        assert_eq!(
            drain(&mut rx),
            vec![
                CoreEvent::DeviceConnected {
                    identity: identity.clone(),
                    name: "Pointer".to_string(),
                },
                CoreEvent::AnyDeviceConnected(true),
            ]
        );

        // The same node again is refused and announces nothing
        if let Ok(again) = SubDeviceConnection::open(&descriptor, &identity, Bus::Usb, false) {
            assert!(!manager.insert_sub_device(&identity, "Pointer", Bus::Usb, again));
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(manager.device(&identity).unwrap().sub_device_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_no_device() {
        let (mut manager, mut rx) = manager();

        let attached = manager.attach_with(
            &identity(),
            "Spotlight",
            Bus::Usb,
            Capabilities::empty(),
            |_| Err(io::Error::from(io::ErrorKind::Other)),
        );
        assert!(!attached);
        assert_eq!(manager.device_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_device_disconnects_after_last_sub_device_is_lost() {
        let (mut manager, mut rx) = manager();
        attach(&mut manager, &identity(), "/dev/input/event5", InterfaceKind::RawEvent);
        attach(&mut manager, &identity(), "/dev/hidraw2", InterfaceKind::RawProtocol);
        drain(&mut rx);

        let lost = |path: &str| ManagerEvent::SubDeviceLost {
            identity: identity(),
            path: PathBuf::from(path),
        };
        assert!(manager.handle_event(lost("/dev/hidraw2")).await);
        assert_eq!(manager.device_count(), 1);
        assert!(drain(&mut rx).is_empty());

        assert!(manager.handle_event(lost("/dev/input/event5")).await);
        assert_eq!(manager.device_count(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                CoreEvent::DeviceDisconnected {
                    identity: identity(),
                    name: "Spotlight".to_string(),
                },
                CoreEvent::AnyDeviceConnected(false),
            ]
        );
    }

    #[tokio::test]
    async fn test_protocol_ready_publishes_features() {
        let (mut manager, mut rx) = manager();
        attach(&mut manager, &identity(), "/dev/hidraw2", InterfaceKind::RawProtocol);
        drain(&mut rx);

        let (handle, _commands) = HidppHandle::channel();
        let device = HidppDevice::new(handle, 0x01)
            .with_feature(feature_code::PRESENTER_CONTROL, 0x09);
        let version = ProtocolVersion { major: 4, minor: 5 };
        manager
            .handle_event(ManagerEvent::ProtocolReady {
                identity: identity(),
                device,
                version,
            })
            .await;

        let caps = manager.device(&identity()).unwrap().capabilities();
        assert!(caps.contains(Capabilities::PROTOCOL_SUPPORT | Capabilities::VIBRATION_SUPPORT));
        assert_eq!(
            drain(&mut rx),
            vec![CoreEvent::DeviceFeatures {
                identity: identity(),
                protocol: version,
                capabilities: caps,
            }]
        );
    }

    #[tokio::test]
    async fn test_protocol_ready_for_unknown_device_is_ignored() {
        let (mut manager, mut rx) = manager();
        let (handle, _commands) = HidppHandle::channel();

        manager
            .handle_event(ManagerEvent::ProtocolReady {
                identity: identity(),
                device: HidppDevice::new(handle, 0x01),
                version: ProtocolVersion::HIDPP10,
            })
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_event_stops_loop() {
        let (mut manager, mut rx) = manager();
        attach(&mut manager, &identity(), "/dev/input/event5", InterfaceKind::RawEvent);
        drain(&mut rx);

        manager.sender().send(ManagerEvent::Shutdown).unwrap();
        manager.run().await;

        assert_eq!(manager.device_count(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                CoreEvent::DeviceDisconnected {
                    identity: identity(),
                    name: "Spotlight".to_string(),
                },
                CoreEvent::AnyDeviceConnected(false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_protocol_reports_features_and_battery() {
        let writer = RecordingWriter::default();
        let (handle, frames, _shutdown, _engine) = spawn_engine(writer.clone(), true);
        let device = HidppDevice::new(handle, DIRECT_DEVICE_INDEX);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(initialize_protocol(identity(), device, tx));

        // Answer requests in order: ping, feature lookups, battery query
        let mut answered = 0;
        let mut reported = Vec::new();
        while !reported
            .iter()
            .any(|e| matches!(e, ManagerEvent::Battery { .. }))
        {
            tokio::task::yield_now().await;
            let sent = writer.frames.lock().unwrap().clone();
            for bytes in &sent[answered..] {
                let request = HidppMessage::from_bytes(bytes).unwrap();
                let payload: Vec<u8> = match answered {
                    0 => vec![0x04, 0x05, 0x5a],
                    n if n <= QUERIED_FEATURES.len() => {
                        if QUERIED_FEATURES[n - 1] == feature_code::BATTERY_STATUS {
                            vec![0x04]
                        } else {
                            vec![0x00]
                        }
                    }
                    _ => vec![80, 50, 0],
                };
                frames.send(reply_to(&request, &payload)).unwrap();
                answered += 1;
            }
            while let Ok(event) = rx.try_recv() {
                reported.push(event);
            }
        }

        match &reported[0] {
            ManagerEvent::ProtocolReady { device, version, .. } => {
                assert_eq!(*version, ProtocolVersion { major: 4, minor: 5 });
                assert_eq!(
                    device.features().index_of(feature_code::BATTERY_STATUS),
                    Some(0x04)
                );
            }
            _ => panic!("expected ProtocolReady first"),
        }
        match &reported[1] {
            ManagerEvent::Battery { info, .. } => {
                assert_eq!(info.level, 80);
                assert_eq!(info.status, ChargingStatus::Discharging);
            }
            _ => panic!("expected battery status second"),
        }

        // Let the task subscribe before the device broadcasts
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let notification = HidppMessage::long(DIRECT_DEVICE_INDEX, 0x04, 0x0, 0x0, &[75, 50, 0]);
        frames.send(notification.as_bytes().to_vec()).unwrap();
        match rx.recv().await {
            Some(ManagerEvent::Battery { info, .. }) => assert_eq!(info.level, 75),
            _ => panic!("expected battery notification"),
        }
        task.abort();
    }
}
