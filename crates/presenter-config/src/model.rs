//! Configuration data model

use std::fmt;

/// Default debounce window for partially matched sequences
pub const DEFAULT_SEQUENCE_INTERVAL_MS: u64 = 200;

/// Default idle time after the last pointer motion before the spot turns off
pub const DEFAULT_SPOT_TIMEOUT_MS: u64 = 600;

/// Root configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalConfig,
    /// Devices to accept in addition to the built-in supported list
    pub supported_devices: Vec<SupportedDeviceConfig>,
    /// Key-event-sequence to action mappings
    pub mappings: Vec<MappingConfig>,
}

/// Global settings
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
    /// Whether the synthetic input device should be created at all
    pub virtual_device: bool,
    /// Debounce window for partially matched sequences, in milliseconds
    pub sequence_interval_ms: u64,
    /// Idle time before a device's spot is reported inactive, in milliseconds
    pub spot_timeout_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            virtual_device: true,
            sequence_interval_ms: DEFAULT_SEQUENCE_INTERVAL_MS,
            spot_timeout_ms: DEFAULT_SPOT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// An additional vendor/product pair to treat as supported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedDeviceConfig {
    pub vendor: u16,
    pub product: u16,
    /// Display name override
    pub name: Option<String>,
}

/// One raw key event inside a sequence step (e.g. `BTN_LEFT:1`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEventEntry {
    /// Kernel key name (`KEY_*` or `BTN_*`)
    pub key: String,
    /// 0 = release, 1 = press, 2 = repeat
    pub value: i32,
}

impl fmt::Display for KeyEventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// A single step of a sequence: all key events between two SYN_REPORTs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    pub events: Vec<KeyEventEntry>,
}

/// Action attached to a configured sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionConfig {
    /// Emit one or more key combinations (e.g. `["Ctrl+C", "Ctrl+V"]`)
    KeySequence(Vec<String>),
    /// Left mouse button press and release
    LeftClick,
    /// Semantic action handled by the overlay
    ToggleSpotlight,
    /// Semantic action handled by the overlay
    CyclePresets,
    /// Device vibration through the HID++ channel
    Vibrate { length: u8, intensity: u8 },
    /// Device pointer speed (0..=9) through the HID++ channel
    PointerSpeed(u8),
}

/// A configured sequence and the action it triggers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConfig {
    pub sequence: Vec<SequenceStep>,
    pub action: ActionConfig,
}
