//! HID++ protocol support
//!
//! - [`message`]: frame codec (short/long frames, widening, error replies)
//! - [`engine`]: request/reply correlation, timeouts and batches
//! - [`features`]: feature resolution and device commands

pub mod engine;
pub mod features;
pub mod message;

pub use engine::{run_engine, FrameSource, HidppEngine, HidppHandle, RequestResult};
pub use features::{BatteryInfo, FeatureTable, HidppDevice, ProtocolVersion};
pub use message::{FrameKind, HidppMessage, RequestKey};
