//! Virtual device injection via uinput
//!
//! This module provides the synthetic input device through which forwarded
//! and mapped events reach the desktop. At most one is created per process;
//! the [`SharedEmitter`] type alias lets every device's input task share it.
//!
//! The emitter is passed down explicitly, never reached through a global, so
//! tests substitute a recording [`InputEmitter`].

use std::io;
use std::sync::Arc;

use evdev::uinput::VirtualDeviceBuilder;
use evdev::{
    AttributeSet, BusType, EventType, InputEvent, InputId, Key, RelativeAxisType,
};
use tokio::sync::Mutex;

use crate::error::EmitterError;

/// Name of the synthetic device
pub const VIRTUAL_DEVICE_NAME: &str = "presenter-virtual-device";

/// Vendor id of the synthetic device; discovery never accepts it
pub const VIRTUAL_VENDOR_ID: u16 = 0xfeed;
/// Product id of the synthetic device
pub const VIRTUAL_PRODUCT_ID: u16 = 0xc0de;

/// Highest key code exposed by the synthetic device (KEY_MAX)
const MAX_KEY_CODE: u16 = 0x2ff;

/// Sink for synthesized input events
pub trait InputEmitter: Send {
    /// Write events verbatim
    ///
    /// `events` holds one or more batches, each terminated by SYN_REPORT.
    ///
    /// # Errors
    ///
    /// Returns [`EmitterError::Unterminated`] if the last event is not
    /// SYN_REPORT, or [`EmitterError::Write`] if the device rejects the write.
    fn emit(&mut self, events: &[InputEvent]) -> Result<(), EmitterError>;
}

/// A shared emitter that can be used across multiple async tasks.
pub type SharedEmitter = Arc<Mutex<dyn InputEmitter>>;

/// Whether an event is SYN_REPORT
pub fn is_syn_report(event: &InputEvent) -> bool {
    event.event_type() == EventType::SYNCHRONIZATION && event.code() == 0
}

/// Create the shared synthetic device.
///
/// # Errors
///
/// Returns [`EmitterError::DeviceNodeMissing`] if `/dev/uinput` does not
/// exist, [`EmitterError::PermissionDenied`] if it cannot be opened, and
/// [`EmitterError::CreateFailed`] for any other failure. None of these stop
/// the daemon; without an emitter events are observed but not re-injected.
///
/// # Example
///
/// ```no_run
/// use presenter_daemon::emitter::create_shared_emitter;
///
/// # async fn example() -> Result<(), presenter_daemon::error::EmitterError> {
/// let emitter = create_shared_emitter()?;
/// let for_other_task = emitter.clone();
/// # drop(for_other_task);
/// # Ok(())
/// # }
/// ```
pub fn create_shared_emitter() -> Result<SharedEmitter, EmitterError> {
    let device = VirtualDevice::new(VIRTUAL_DEVICE_NAME)?;
    Ok(Arc::new(Mutex::new(device)))
}

/// uinput-backed emitter exposing keys and relative axes
pub struct VirtualDevice {
    device: evdev::uinput::VirtualDevice,
}

impl VirtualDevice {
    /// Create the uinput device
    pub fn new(name: &str) -> Result<Self, EmitterError> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 1..=MAX_KEY_CODE {
            keys.insert(Key::new(code));
        }

        let mut axes = AttributeSet::<RelativeAxisType>::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);
        axes.insert(RelativeAxisType::REL_HWHEEL);
        axes.insert(RelativeAxisType::REL_WHEEL);

        let device = VirtualDeviceBuilder::new()
            .map_err(open_error)?
            .name(name)
            .input_id(InputId::new(
                BusType::BUS_USB,
                VIRTUAL_VENDOR_ID,
                VIRTUAL_PRODUCT_ID,
                1,
            ))
            .with_keys(&keys)
            .map_err(EmitterError::CreateFailed)?
            .with_relative_axes(&axes)
            .map_err(EmitterError::CreateFailed)?
            .build()
            .map_err(EmitterError::CreateFailed)?;

        tracing::info!(name, "Created virtual input device");
        Ok(Self { device })
    }
}

fn open_error(e: io::Error) -> EmitterError {
    match e.kind() {
        io::ErrorKind::NotFound => EmitterError::DeviceNodeMissing,
        io::ErrorKind::PermissionDenied => EmitterError::PermissionDenied,
        _ => EmitterError::CreateFailed(e),
    }
}

impl InputEmitter for VirtualDevice {
    fn emit(&mut self, events: &[InputEvent]) -> Result<(), EmitterError> {
        if !events.last().is_some_and(is_syn_report) {
            return Err(EmitterError::Unterminated);
        }
        // uinput's emit appends its own SYN_REPORT to every call
        for batch in events.split_inclusive(is_syn_report) {
            let body = &batch[..batch.len() - 1];
            self.device.emit(body).map_err(EmitterError::Write)?;
        }
        Ok(())
    }
}
