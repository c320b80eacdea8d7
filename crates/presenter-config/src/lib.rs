//! Configuration parsing for the presenter device core
//!
//! This crate parses the KDL configuration that supplies the device core
//! with its key-sequence mappings, the additional supported-device list and
//! the global switches (virtual device, debounce window, log level).

mod error;
mod model;
mod parser;

pub use error::ConfigError;
pub use model::*;
pub use parser::{parse_config, parse_config_str};
