//! Device connections and their sub-connections
//!
//! A [`DeviceConnection`] is the arena entry for one physical device. It owns
//! the handles of its sub-device tasks exclusively:
//!
//! - an event sub-device reads SYN-terminated batches from an evdev node and
//!   passes them to the device's input task
//! - a protocol sub-device runs a [`HidppEngine`] on a hidraw node
//!
//! A read error ends the sub-device task, which reports the loss to the
//! device manager and lets it tear things down on its next iteration.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use evdev::{EventStream, EventType, InputEvent, RelativeAxisType};
use nix::fcntl::OFlag;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::device::{Bus, DeviceIdentity, InterfaceKind, SubDeviceDescriptor};
use crate::device_manager::ManagerEvent;
use crate::emitter::is_syn_report;
use crate::error::OpenError;
use crate::hidpp::engine::{EngineCommand, EngineExit};
use crate::hidpp::features::feature_code;
use crate::hidpp::{run_engine, FeatureTable, FrameSource, HidppDevice, HidppEngine, HidppHandle};
use crate::input_task::InputCommand;

bitflags! {
    /// What a device connection can do
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const NON_BLOCKING = 1 << 0;
        const SUPPORTS_SYN = 1 << 1;
        const SUPPORTS_REPEAT = 1 << 2;
        const RELATIVE_MOTION = 1 << 3;
        const PROTOCOL_SUPPORT = 1 << 4;
        const VIBRATION_SUPPORT = 1 << 5;
        const BATTERY_STATUS = 1 << 6;
        const POINTER_SPEED = 1 << 7;
    }
}

impl Capabilities {
    /// Flags that only exist while a protocol sub-device is attached
    pub const PROTOCOL: Capabilities = Capabilities::PROTOCOL_SUPPORT
        .union(Capabilities::VIBRATION_SUPPORT)
        .union(Capabilities::BATTERY_STATUS)
        .union(Capabilities::POINTER_SPEED);

    /// Flags implied by a resolved feature table
    pub fn from_features(features: &FeatureTable) -> Self {
        let mut caps = Capabilities::PROTOCOL_SUPPORT;
        if features.supports(feature_code::PRESENTER_CONTROL) {
            caps |= Capabilities::VIBRATION_SUPPORT;
        }
        if features.supports(feature_code::BATTERY_STATUS) {
            caps |= Capabilities::BATTERY_STATUS;
        }
        if features.supports(feature_code::POINTER_SPEED) {
            caps |= Capabilities::POINTER_SPEED;
        }
        caps
    }
}

// ============================================================================
// Opening
// ============================================================================

fn verify_identity(
    path: &Path,
    expected: &DeviceIdentity,
    vendor: u16,
    product: u16,
) -> Result<(), OpenError> {
    if vendor == expected.vendor_id && product == expected.product_id {
        Ok(())
    } else {
        Err(OpenError::IdMismatch {
            path: path.to_path_buf(),
            expected: expected.clone(),
            found_vendor: vendor,
            found_product: product,
        })
    }
}

fn require_relative_motion(path: &Path, has_relative_xy: bool) -> Result<(), OpenError> {
    if has_relative_xy {
        Ok(())
    } else {
        Err(OpenError::UnsupportedCapabilities {
            path: path.to_path_buf(),
            missing: "relative motion (REL_X/REL_Y)".to_string(),
        })
    }
}

/// An opened sub-device, not yet handed to a task
pub enum SubDeviceConnection {
    Event(EventSubDevice),
    Protocol(ProtocolSubDevice),
}

impl SubDeviceConnection {
    /// Open the node described by `descriptor`
    ///
    /// # Arguments
    ///
    /// * `descriptor` - Scan-time description of the node
    /// * `expected` - Identity the scan attributed the node to
    /// * `bus` - Transport of the device, used for protocol framing
    /// * `grab` - Try to take exclusive ownership of event nodes
    ///
    /// # Errors
    ///
    /// Returns an [`OpenError`] if the node cannot be opened, now reports a
    /// different vendor/product, or (for event nodes) lacks relative motion.
    pub fn open(
        descriptor: &SubDeviceDescriptor,
        expected: &DeviceIdentity,
        bus: Bus,
        grab: bool,
    ) -> Result<Self, OpenError> {
        match descriptor.kind {
            InterfaceKind::RawEvent => {
                EventSubDevice::open(&descriptor.devnode, expected, grab).map(Self::Event)
            }
            InterfaceKind::RawProtocol => {
                ProtocolSubDevice::open(&descriptor.devnode, expected, bus).map(Self::Protocol)
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Event(sub) => sub.path(),
            Self::Protocol(sub) => sub.path(),
        }
    }

    pub fn kind(&self) -> InterfaceKind {
        match self {
            Self::Event(_) => InterfaceKind::RawEvent,
            Self::Protocol(_) => InterfaceKind::RawProtocol,
        }
    }
}

// ============================================================================
// Event sub-device
// ============================================================================

/// An open evdev node
///
/// Dropping it releases the grab before the node is closed.
pub struct EventSubDevice {
    path: PathBuf,
    stream: EventStream,
    grabbed: bool,
    capabilities: Capabilities,
    /// Events read since the last SYN_REPORT
    pending: Vec<InputEvent>,
}

impl EventSubDevice {
    pub fn open(path: &Path, expected: &DeviceIdentity, grab: bool) -> Result<Self, OpenError> {
        let device =
            evdev::Device::open(path).map_err(|e| OpenError::from_io(path.to_path_buf(), e))?;

        let id = device.input_id();
        verify_identity(path, expected, id.vendor(), id.product())?;

        let has_relative_xy = device.supported_relative_axes().is_some_and(|axes| {
            axes.contains(RelativeAxisType::REL_X) && axes.contains(RelativeAxisType::REL_Y)
        });
        require_relative_motion(path, has_relative_xy)?;

        let mut capabilities = Capabilities::RELATIVE_MOTION | Capabilities::NON_BLOCKING;
        let supported = device.supported_events();
        if supported.contains(EventType::SYNCHRONIZATION) {
            capabilities |= Capabilities::SUPPORTS_SYN;
        }
        if supported.contains(EventType::REPEAT) {
            capabilities |= Capabilities::SUPPORTS_REPEAT;
        }

        let name = device.name().unwrap_or("Unknown").to_string();
        let stream = device.into_event_stream().map_err(|source| OpenError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut sub = Self {
            path: path.to_path_buf(),
            stream,
            grabbed: false,
            capabilities,
            pending: Vec::new(),
        };

        if grab {
            match sub.stream.device_mut().grab() {
                Ok(()) => sub.grabbed = true,
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not grab device, events will also reach the desktop"
                ),
            }
        }

        tracing::info!(
            path = %path.display(),
            name = %name,
            grabbed = sub.grabbed,
            "Opened event sub-device"
        );
        Ok(sub)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether we hold exclusive ownership of the node
    pub fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    /// Read up to and including the next SYN_REPORT
    ///
    /// Cancel-safe: events read before cancellation are kept for the next
    /// call.
    pub async fn next_batch(&mut self) -> io::Result<Vec<InputEvent>> {
        loop {
            let event = self.stream.next_event().await?;
            let done = is_syn_report(&event);
            self.pending.push(event);
            if done {
                return Ok(std::mem::take(&mut self.pending));
            }
        }
    }

    fn release_grab(&mut self) {
        if !self.grabbed {
            return;
        }
        self.grabbed = false;
        if let Err(e) = self.stream.device_mut().ungrab() {
            // Expected when the node is already gone
            tracing::debug!(path = %self.path.display(), error = %e, "Ungrab failed");
        }
    }

    /// Release the grab, then close the node
    pub fn close(mut self) {
        self.release_grab();
        tracing::debug!(path = %self.path.display(), "Closed event sub-device");
    }
}

impl Drop for EventSubDevice {
    fn drop(&mut self) {
        // Runs before the stream field (and its fd) is dropped
        self.release_grab();
    }
}

// ============================================================================
// Protocol sub-device
// ============================================================================

#[repr(C)]
#[derive(Debug, Default)]
struct HidrawDevinfo {
    bustype: u32,
    vendor: i16,
    product: i16,
}

nix::ioctl_read!(hidraw_get_raw_info, b'H', 0x03, HidrawDevinfo);

/// Largest report we expect on a hidraw node
const MAX_REPORT_LEN: usize = 64;

/// An open hidraw node
pub struct ProtocolSubDevice {
    path: PathBuf,
    file: File,
    bus: Bus,
}

impl ProtocolSubDevice {
    pub fn open(path: &Path, expected: &DeviceIdentity, bus: Bus) -> Result<Self, OpenError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
            .map_err(|e| OpenError::from_io(path.to_path_buf(), e))?;

        let mut info = HidrawDevinfo::default();
        // SAFETY: `info` matches struct hidraw_devinfo and outlives the call
        unsafe { hidraw_get_raw_info(file.as_raw_fd(), &mut info) }.map_err(|errno| {
            OpenError::Io {
                path: path.to_path_buf(),
                source: io::Error::from(errno),
            }
        })?;
        verify_identity(path, expected, info.vendor as u16, info.product as u16)?;

        tracing::info!(path = %path.display(), bus = %bus, "Opened protocol sub-device");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            bus,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Split into an engine writing to the node and a reader of its frames
    pub fn into_engine(self) -> io::Result<(HidppEngine<File>, HidrawReader)> {
        let writer = self.file.try_clone()?;
        let engine = HidppEngine::new(writer, self.bus.long_frames_only());
        let reader = HidrawReader {
            fd: AsyncFd::new(self.file)?,
        };
        Ok((engine, reader))
    }
}

/// Readiness-driven reader of hidraw reports
pub struct HidrawReader {
    fd: AsyncFd<File>,
}

impl FrameSource for HidrawReader {
    async fn next_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; MAX_REPORT_LEN];
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "hidraw closed"))
                }
                Ok(Ok(n)) => return Ok(buf[..n].to_vec()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

// ============================================================================
// Sub-device tasks
// ============================================================================

/// Handle to a running sub-device task
pub struct SubDeviceHandle {
    path: PathBuf,
    kind: InterfaceKind,
    grabbed: bool,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubDeviceHandle {
    pub fn new(
        path: PathBuf,
        kind: InterfaceKind,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            path,
            kind,
            grabbed: false,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Record that the task's node is grabbed
    pub fn with_grab(mut self, grabbed: bool) -> Self {
        self.grabbed = grabbed;
        self
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    /// Stop the task and wait until it has released its node
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already have exited after a read error
            let _ = shutdown.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!(path = %self.path.display(), error = %e, "Sub-device task failed");
        }
    }
}

/// Everything a sub-device task reports to
#[derive(Clone)]
pub struct SubDeviceContext {
    pub identity: DeviceIdentity,
    pub input: mpsc::UnboundedSender<InputCommand>,
    pub manager: mpsc::UnboundedSender<ManagerEvent>,
}

impl SubDeviceContext {
    fn report_lost(&self, path: PathBuf, error: &io::Error) {
        tracing::warn!(
            device = %self.identity,
            path = %path.display(),
            error = %error,
            "Read failed, treating sub-device as disconnected"
        );
        let _ = self.manager.send(ManagerEvent::SubDeviceLost {
            identity: self.identity.clone(),
            path,
        });
    }
}

/// Start the task for an opened sub-device
///
/// Returns the task handle, plus the HID++ device for protocol sub-devices.
///
/// # Errors
///
/// Returns an error if a protocol node cannot be registered for readiness.
pub fn spawn_sub_device(
    connection: SubDeviceConnection,
    context: SubDeviceContext,
    bus: Bus,
) -> io::Result<(SubDeviceHandle, Option<HidppDevice>)> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let path = connection.path().to_path_buf();
    let kind = connection.kind();

    let mut grabbed = false;
    let (task, protocol) = match connection {
        SubDeviceConnection::Event(sub) => {
            grabbed = sub.is_grabbed();
            (tokio::spawn(run_event_sub(sub, context, shutdown_rx)), None)
        }
        SubDeviceConnection::Protocol(sub) => {
            let (engine, reader) = sub.into_engine()?;
            let (handle, commands) = HidppHandle::channel();
            let task = tokio::spawn(run_protocol_sub(
                engine,
                reader,
                commands,
                shutdown_rx,
                context,
                path.clone(),
            ));
            (task, Some(HidppDevice::new(handle, bus.device_index())))
        }
    };

    let handle = SubDeviceHandle::new(path, kind, shutdown_tx, task).with_grab(grabbed);
    Ok((handle, protocol))
}

async fn run_event_sub(
    mut sub: EventSubDevice,
    context: SubDeviceContext,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            batch = sub.next_batch() => match batch {
                Ok(events) => {
                    if context.input.send(InputCommand::Events(events)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    context.report_lost(sub.path().to_path_buf(), &e);
                    break;
                }
            },
            _ = &mut shutdown => break,
        }
    }
    sub.close();
}

async fn run_protocol_sub(
    engine: HidppEngine<File>,
    reader: HidrawReader,
    commands: mpsc::Receiver<EngineCommand>,
    shutdown: oneshot::Receiver<()>,
    context: SubDeviceContext,
    path: PathBuf,
) {
    match run_engine(engine, reader, commands, shutdown).await {
        EngineExit::ReadError(e) => context.report_lost(path, &e),
        EngineExit::Closed => {
            tracing::debug!(path = %path.display(), "Protocol sub-device closed");
        }
    }
}

// ============================================================================
// Device connection
// ============================================================================

/// Arena entry for one physical device
pub struct DeviceConnection {
    identity: DeviceIdentity,
    name: String,
    bus: Bus,
    capabilities: Capabilities,
    sub_devices: Vec<SubDeviceHandle>,
    input: mpsc::UnboundedSender<InputCommand>,
    input_task: JoinHandle<()>,
    protocol: Option<HidppDevice>,
    /// Protocol initialisation and notification listeners
    background: Vec<JoinHandle<()>>,
}

impl DeviceConnection {
    pub fn new(
        identity: DeviceIdentity,
        name: String,
        bus: Bus,
        input: mpsc::UnboundedSender<InputCommand>,
        input_task: JoinHandle<()>,
    ) -> Self {
        Self {
            identity,
            name,
            bus,
            capabilities: Capabilities::empty(),
            sub_devices: Vec::new(),
            input,
            input_task,
            protocol: None,
            background: Vec::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> Bus {
        self.bus
    }

    /// Whether every event sub-device is exclusively owned
    ///
    /// False when a grab failed (or was never attempted), meaning the
    /// desktop also sees the device's input.
    pub fn is_exclusively_owned(&self) -> bool {
        let mut events = self
            .sub_devices
            .iter()
            .filter(|s| s.kind() == InterfaceKind::RawEvent)
            .peekable();
        events.peek().is_some() && events.all(SubDeviceHandle::is_grabbed)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn sub_device_count(&self) -> usize {
        self.sub_devices.len()
    }

    pub fn has_sub_device(&self, path: &Path) -> bool {
        self.sub_devices.iter().any(|s| s.path() == path)
    }

    pub fn has_protocol_sub_device(&self) -> bool {
        self.sub_devices
            .iter()
            .any(|s| s.kind() == InterfaceKind::RawProtocol)
    }

    /// Input context for new sub-device tasks
    pub fn input_sender(&self) -> mpsc::UnboundedSender<InputCommand> {
        self.input.clone()
    }

    pub fn add_sub_device(&mut self, handle: SubDeviceHandle, capabilities: Capabilities) {
        self.capabilities |= capabilities;
        self.sub_devices.push(handle);
    }

    /// Detach the sub-device at `path`
    ///
    /// Losing the protocol sub-device clears the protocol capabilities and
    /// tells the input task to stop issuing device commands.
    pub fn remove_sub_device(&mut self, path: &Path) -> Option<SubDeviceHandle> {
        let position = self.sub_devices.iter().position(|s| s.path() == path)?;
        let handle = self.sub_devices.remove(position);
        if handle.kind() == InterfaceKind::RawProtocol {
            self.clear_protocol();
        }
        Some(handle)
    }

    /// Record a HID++ device whose features have been resolved
    pub fn set_protocol(&mut self, device: HidppDevice) {
        self.capabilities |= Capabilities::from_features(device.features());
        self.send_input(InputCommand::AttachProtocol(device.clone()));
        self.protocol = Some(device);
    }

    fn clear_protocol(&mut self) {
        self.capabilities.remove(Capabilities::PROTOCOL);
        if self.protocol.take().is_some() {
            self.send_input(InputCommand::DetachProtocol);
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    pub fn add_background(&mut self, task: JoinHandle<()>) {
        self.background.retain(|t| !t.is_finished());
        self.background.push(task);
    }

    pub fn send_input(&self, command: InputCommand) {
        if self.input.send(command).is_err() {
            tracing::debug!(device = %self.identity, "Input task has stopped");
        }
    }

    /// Tear the connection down
    ///
    /// Every sub-device releases its grab and closes its node; pending HID++
    /// requests resolve as disconnected. The input task finishes the batch it
    /// is dispatching, then stops with its debounce state discarded.
    pub async fn close(self) {
        let Self {
            identity,
            sub_devices,
            input,
            input_task,
            background,
            ..
        } = self;

        for task in background {
            task.abort();
        }
        for sub in sub_devices {
            sub.close().await;
        }
        drop(input);
        if let Err(e) = input_task.await {
            tracing::warn!(device = %identity, error = %e, "Input task failed");
        }
        tracing::debug!(device = %identity, "Device connection closed");
    }
}
