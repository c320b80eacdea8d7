//! Device enumeration
//!
//! Candidate nodes are the `input` class `event*` nodes and the `hidraw*`
//! nodes whose udev ancestry contains a `hid` device. The `hid` parent
//! carries the identity of the physical device:
//!
//! - `HID_ID`: `bus:vendor:product` in hex, e.g. `0003:0000046D:0000C53E`
//! - `HID_PHYS`: the physical path; the `/inputN` suffix differs per
//!   interface and is stripped
//! - `HID_UNIQ`: a serial or device address, if the transport has one
//! - `HID_NAME`: the human-readable name
//!
//! Nodes are grouped per HID interface first. An interface that has event
//! nodes is used through them; its hidraw node is only used when it has no
//! event node at all.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use presenter_config::SupportedDeviceConfig;

use crate::emitter::{VIRTUAL_PRODUCT_ID, VIRTUAL_VENDOR_ID};
use crate::error::ScanError;
use crate::hidpp::features::{DIRECT_DEVICE_INDEX, RECEIVER_DEVICE_INDEX};

/// Logitech vendor id
pub const LOGITECH_VENDOR_ID: u16 = 0x046d;

/// Devices supported without configuration
pub const BUILTIN_SUPPORTED: &[(u16, u16, &str)] = &[
    (LOGITECH_VENDOR_ID, 0xc53e, "Logitech Spotlight (USB)"),
    (LOGITECH_VENDOR_ID, 0xb503, "Logitech Spotlight (Bluetooth)"),
];

const BUS_USB: u16 = 0x03;
const BUS_BLUETOOTH: u16 = 0x05;

const REL_X: u32 = 0x00;
const REL_Y: u32 = 0x01;

// ============================================================================
// Types
// ============================================================================

/// Identity of one physical device
///
/// Two devices with the same vendor and product on different ports are
/// distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub phys: String,
}

impl DeviceIdentity {
    /// Get vendor:product string (e.g., "046d:c53e")
    pub fn vendor_product(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.vendor_product(), self.phys)
    }
}

/// Kind of node a sub-device is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// evdev node: typed input events
    RawEvent,
    /// hidraw node: HID++ frames
    RawProtocol,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceKind::RawEvent => write!(f, "event"),
            InterfaceKind::RawProtocol => write!(f, "hidraw"),
        }
    }
}

/// Transport of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Usb,
    Bluetooth,
    Other(u16),
}

impl Bus {
    pub fn from_raw(bus: u16) -> Self {
        match bus {
            BUS_USB => Bus::Usb,
            BUS_BLUETOOTH => Bus::Bluetooth,
            other => Bus::Other(other),
        }
    }

    /// Whether the transport only accepts long HID++ frames
    pub fn long_frames_only(&self) -> bool {
        matches!(self, Bus::Bluetooth)
    }

    /// HID++ device index of a device on this transport
    pub fn device_index(&self) -> u8 {
        match self {
            Bus::Bluetooth => DIRECT_DEVICE_INDEX,
            _ => RECEIVER_DEVICE_INDEX,
        }
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bus::Usb => write!(f, "usb"),
            Bus::Bluetooth => write!(f, "bluetooth"),
            Bus::Other(bus) => write!(f, "bus 0x{:04x}", bus),
        }
    }
}

/// Scan-time record of one sub-device node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDeviceDescriptor {
    pub devnode: PathBuf,
    pub kind: InterfaceKind,
    pub supports_relative_motion: bool,
    pub readable: bool,
    pub writable: bool,
}

/// A supported physical device and its sub-devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub identity: DeviceIdentity,
    pub name: String,
    pub bus: Bus,
    pub sub_devices: Vec<SubDeviceDescriptor>,
}

/// Result of a one-shot enumeration
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub devices: Vec<ScannedDevice>,
    /// Enumeration problems, for diagnostic display
    pub errors: Vec<String>,
    /// Sub-devices we may read
    pub readable_count: usize,
    /// Sub-devices we may write
    pub writable_count: usize,
}

/// One candidate node as reported by udev
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNode {
    pub devnode: PathBuf,
    pub kind: InterfaceKind,
    /// Syspath of the `hid` parent, shared by all nodes of one interface
    pub hid_syspath: PathBuf,
    pub bus: Bus,
    pub vendor: u16,
    pub product: u16,
    /// Physical address with the per-interface suffix removed
    pub phys: String,
    pub name: String,
    pub relative_motion: bool,
    pub readable: bool,
    pub writable: bool,
}

// ============================================================================
// Supported device list
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedDevice {
    pub vendor: u16,
    pub product: u16,
    pub name: String,
}

/// Vendor/product pairs the core accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedDevices {
    entries: Vec<SupportedDevice>,
}

impl SupportedDevices {
    /// The built-in list
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_SUPPORTED
                .iter()
                .map(|&(vendor, product, name)| SupportedDevice {
                    vendor,
                    product,
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    /// The built-in list plus configured additions
    ///
    /// A configured entry for a built-in pair overrides its name.
    pub fn with_additional(additional: &[SupportedDeviceConfig]) -> Self {
        let mut list = Self::builtin();
        for extra in additional {
            let name = extra
                .name
                .clone()
                .unwrap_or_else(|| format!("{:04x}:{:04x}", extra.vendor, extra.product));
            match list
                .entries
                .iter_mut()
                .find(|e| e.vendor == extra.vendor && e.product == extra.product)
            {
                Some(entry) => {
                    if extra.name.is_some() {
                        entry.name = name;
                    }
                }
                None => list.entries.push(SupportedDevice {
                    vendor: extra.vendor,
                    product: extra.product,
                    name,
                }),
            }
        }
        list
    }

    pub fn find(&self, vendor: u16, product: u16) -> Option<&SupportedDevice> {
        self.entries
            .iter()
            .find(|e| e.vendor == vendor && e.product == product)
    }

    pub fn entries(&self) -> &[SupportedDevice] {
        &self.entries
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Kind of a device node, from its file name
pub fn interface_kind_for(sysname: &str) -> Option<InterfaceKind> {
    let numbered = |prefix: &str| {
        sysname
            .strip_prefix(prefix)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    };
    if numbered("event") {
        Some(InterfaceKind::RawEvent)
    } else if numbered("hidraw") {
        Some(InterfaceKind::RawProtocol)
    } else {
        None
    }
}

/// Parse a `HID_ID` value into `(bus, vendor, product)`
pub fn parse_hid_id(value: &str) -> Option<(u16, u16, u16)> {
    let mut parts = value.trim().split(':');
    let bus = u16::from_str_radix(parts.next()?, 16).ok()?;
    let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((bus, u16::try_from(vendor).ok()?, u16::try_from(product).ok()?))
}

/// Strip the per-interface `/inputN` suffix from a `HID_PHYS` value
pub fn physical_address(phys: &str) -> &str {
    match phys.rsplit_once('/') {
        Some((base, suffix))
            if suffix
                .strip_prefix("input")
                .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit())) =>
        {
            base
        }
        _ => phys,
    }
}

/// Whether a `capabilities/rel` bitmask has both REL_X and REL_Y
///
/// The bitmask is a space-separated list of hex words, most significant
/// word first.
pub fn has_relative_xy(bitmask: &str) -> bool {
    bitmask
        .split_whitespace()
        .last()
        .and_then(|word| u64::from_str_radix(word, 16).ok())
        .is_some_and(|bits| bits & (1 << REL_X) != 0 && bits & (1 << REL_Y) != 0)
}

// ============================================================================
// Assembly
// ============================================================================

/// Turn candidate nodes into the supported-device list
///
/// Rejects nodes whose vendor or product id is 0, the synthetic device, and
/// anything not in `supported`. Raw-protocol nodes are only kept for HID
/// interfaces without an event node.
pub fn assemble_scan(
    nodes: Vec<ScannedNode>,
    errors: Vec<String>,
    supported: &SupportedDevices,
) -> ScanResult {
    let mut interfaces: BTreeMap<PathBuf, Vec<ScannedNode>> = BTreeMap::new();
    for node in nodes {
        interfaces
            .entry(node.hid_syspath.clone())
            .or_default()
            .push(node);
    }

    let mut devices: BTreeMap<DeviceIdentity, ScannedDevice> = BTreeMap::new();
    for (_, mut group) in interfaces {
        let has_event_node = group.iter().any(|n| n.kind == InterfaceKind::RawEvent);
        group.retain(|n| (n.kind == InterfaceKind::RawEvent) == has_event_node);

        for node in group {
            if node.vendor == 0 || node.product == 0 {
                tracing::debug!(path = %node.devnode.display(), "Skipping node without vendor/product id");
                continue;
            }
            if node.vendor == VIRTUAL_VENDOR_ID && node.product == VIRTUAL_PRODUCT_ID {
                continue;
            }
            let Some(entry) = supported.find(node.vendor, node.product) else {
                continue;
            };

            let identity = DeviceIdentity {
                vendor_id: node.vendor,
                product_id: node.product,
                phys: node.phys.clone(),
            };
            let device = devices
                .entry(identity.clone())
                .or_insert_with(|| ScannedDevice {
                    identity,
                    name: if node.name.is_empty() {
                        entry.name.clone()
                    } else {
                        node.name.clone()
                    },
                    bus: node.bus,
                    sub_devices: Vec::new(),
                });
            device.sub_devices.push(SubDeviceDescriptor {
                devnode: node.devnode,
                kind: node.kind,
                supports_relative_motion: node.relative_motion,
                readable: node.readable,
                writable: node.writable,
            });
        }
    }

    let mut devices: Vec<ScannedDevice> = devices.into_values().collect();
    for device in &mut devices {
        device.sub_devices.sort_by(|a, b| a.devnode.cmp(&b.devnode));
    }
    let subs = || devices.iter().flat_map(|d| d.sub_devices.iter());
    let readable_count = subs().filter(|s| s.readable).count();
    let writable_count = subs().filter(|s| s.writable).count();

    ScanResult {
        devices,
        errors,
        readable_count,
        writable_count,
    }
}

// ============================================================================
// udev
// ============================================================================

/// Enumerate all supported devices
///
/// Synchronous; problems with individual nodes end up in
/// [`ScanResult::errors`] rather than failing the scan.
pub fn scan(supported: &SupportedDevices) -> ScanResult {
    let mut nodes = Vec::new();
    let mut errors = Vec::new();

    for subsystem in ["input", "hidraw"] {
        let devices = match enumerate_subsystem(subsystem) {
            Ok(devices) => devices,
            Err(e) => {
                errors.push(format!("Could not enumerate {} devices: {}", subsystem, e));
                continue;
            }
        };
        for device in devices {
            match describe_udev_device(&device) {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => {}
                Err(e) => errors.push(e.to_string()),
            }
        }
    }

    let result = assemble_scan(nodes, errors, supported);
    tracing::debug!(
        devices = result.devices.len(),
        errors = result.errors.len(),
        "Device scan complete"
    );
    result
}

/// Describe a single node that just appeared
///
/// Returns `Ok(None)` for nodes that are not HID device nodes, and for
/// hidraw nodes of interfaces that also have event nodes.
pub fn probe_node(devnode: &Path) -> Result<Option<ScannedNode>, ScanError> {
    let Some(sysname) = devnode.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let Some(kind) = interface_kind_for(sysname) else {
        return Ok(None);
    };
    let subsystem = match kind {
        InterfaceKind::RawEvent => "input",
        InterfaceKind::RawProtocol => "hidraw",
    };
    let syspath = Path::new("/sys/class").join(subsystem).join(sysname);
    let device = udev::Device::from_syspath(&syspath).map_err(|source| ScanError::Udev {
        path: devnode.to_path_buf(),
        source,
    })?;

    let Some(node) = describe_udev_device(&device)? else {
        return Ok(None);
    };
    if node.kind == InterfaceKind::RawProtocol && interface_has_event_node(&node)? {
        return Ok(None);
    }
    Ok(Some(node))
}

fn enumerate_subsystem(subsystem: &str) -> std::io::Result<Vec<udev::Device>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem(subsystem)?;
    Ok(enumerator.scan_devices()?.collect())
}

fn interface_has_event_node(node: &ScannedNode) -> Result<bool, ScanError> {
    let udev_error = |source| ScanError::Udev {
        path: node.devnode.clone(),
        source,
    };
    let hid = udev::Device::from_syspath(&node.hid_syspath).map_err(udev_error)?;
    let mut enumerator = udev::Enumerator::new().map_err(udev_error)?;
    enumerator.match_subsystem("input").map_err(udev_error)?;
    enumerator.match_parent(&hid).map_err(udev_error)?;
    let found = enumerator.scan_devices().map_err(udev_error)?.any(|d| {
        d.sysname()
            .to_str()
            .and_then(interface_kind_for)
            .is_some_and(|k| k == InterfaceKind::RawEvent)
    });
    Ok(found)
}

fn property(device: &udev::Device, name: &str) -> String {
    device
        .property_value(name)
        .map(|v| v.to_string_lossy().trim().to_string())
        .unwrap_or_default()
}

fn describe_udev_device(device: &udev::Device) -> Result<Option<ScannedNode>, ScanError> {
    let Some(devnode) = device.devnode().map(Path::to_path_buf) else {
        return Ok(None);
    };
    let Some(kind) = device.sysname().to_str().and_then(interface_kind_for) else {
        return Ok(None);
    };

    let hid = match device.parent_with_subsystem("hid") {
        Ok(Some(hid)) => hid,
        Ok(None) => return Ok(None),
        Err(source) => {
            return Err(ScanError::Udev {
                path: devnode,
                source,
            })
        }
    };

    let (bus, vendor, product) = hid
        .property_value("HID_ID")
        .and_then(|v| v.to_str())
        .and_then(parse_hid_id)
        .ok_or_else(|| ScanError::MissingHidId {
            path: devnode.clone(),
        })?;

    let mut phys = physical_address(&property(&hid, "HID_PHYS")).to_string();
    let uniq = property(&hid, "HID_UNIQ");
    if !uniq.is_empty() {
        phys = format!("{}#{}", phys, uniq);
    }

    let relative_motion = match kind {
        InterfaceKind::RawEvent => device
            .parent()
            .and_then(|input| {
                input
                    .attribute_value("capabilities/rel")
                    .and_then(|v| v.to_str())
                    .map(has_relative_xy)
            })
            .unwrap_or(false),
        InterfaceKind::RawProtocol => false,
    };

    Ok(Some(ScannedNode {
        readable: access(&devnode, AccessFlags::R_OK).is_ok(),
        writable: access(&devnode, AccessFlags::W_OK).is_ok(),
        devnode,
        kind,
        hid_syspath: hid.syspath().to_path_buf(),
        bus: Bus::from_raw(bus),
        vendor,
        product,
        phys,
        name: property(&hid, "HID_NAME"),
        relative_motion,
    }))
}
