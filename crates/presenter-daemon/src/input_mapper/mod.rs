//! Input mapping for presenter devices
//!
//! Raw event batches read from a device are fed to an [`InputMapper`], which
//! matches their key events against the configured sequences:
//!
//! - [`sequence`]: the prefix-sharing sequence tree and its match results
//! - [`mapper`]: buffering and debounce policy on top of the tree
//! - [`keys`]: key names and key combinations for mapped output
//!
//! Batches without key events (pointer motion) never enter the matcher.

pub mod keys;
pub mod mapper;
pub mod sequence;

use std::fmt;
use std::str::FromStr;

use evdev::{EventType, InputEvent, Key};
use presenter_config::{ActionConfig, MappingConfig};

pub use keys::{parse_combo, parse_key, KeyCombo};
pub use mapper::{InputMapper, MapperOutput};
pub use sequence::{MatchResult, SequenceTree};

/// One raw input event, without its timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn key(key: Key, value: i32) -> Self {
        Self {
            kind: EventType::KEY.0,
            code: key.code(),
            value,
        }
    }
}

impl From<&InputEvent> for RawEvent {
    fn from(event: &InputEvent) -> Self {
        Self {
            kind: event.event_type().0,
            code: event.code(),
            value: event.value(),
        }
    }
}

/// The key events of one SYN-delimited batch
///
/// Sequences are compared structurally: two key events are equal when they
/// hold the same `(type, code, value)` triples in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct KeyEvent(pub Vec<RawEvent>);

impl KeyEvent {
    /// Extract the key events of a batch; `None` if it holds none
    pub fn from_batch(batch: &[InputEvent]) -> Option<Self> {
        let events: Vec<RawEvent> = batch
            .iter()
            .filter(|e| e.event_type() == EventType::KEY)
            .map(RawEvent::from)
            .collect();
        if events.is_empty() {
            None
        } else {
            Some(Self(events))
        }
    }
}

impl fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, event) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{:?}:{}", Key::new(event.code), event.value)?;
        }
        Ok(())
    }
}

/// An ordered list of key events
pub type KeyEventSequence = Vec<KeyEvent>;

/// What a matched sequence does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedAction {
    /// Tap each combo in turn through the emitter
    KeySequence(Vec<KeyCombo>),
    /// Left button press and release through the emitter
    LeftClick,
    /// Published to collaborators
    ToggleSpotlight,
    /// Published to collaborators
    CyclePresets,
    /// Sent to the device over HID++
    Vibrate { length: u8, intensity: u8 },
    /// Sent to the device over HID++
    PointerSpeed(u8),
}

/// A configured sequence resolved to evdev codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub sequence: KeyEventSequence,
    pub action: MappedAction,
}

/// Resolve configured mappings into matcher input
///
/// Mappings whose key names or combos cannot be resolved are skipped with a
/// warning; the rest still load.
pub fn mappings_from_config(configs: &[MappingConfig]) -> Vec<Mapping> {
    configs
        .iter()
        .filter_map(|config| match resolve_mapping(config) {
            Ok(mapping) => Some(mapping),
            Err(reason) => {
                tracing::warn!("Skipping mapping: {}", reason);
                None
            }
        })
        .collect()
}

fn resolve_mapping(config: &MappingConfig) -> Result<Mapping, String> {
    let mut sequence = Vec::with_capacity(config.sequence.len());
    for step in &config.sequence {
        let mut events = Vec::with_capacity(step.events.len());
        for entry in &step.events {
            let key = Key::from_str(&entry.key).map_err(|_| format!("unknown key {}", entry.key))?;
            events.push(RawEvent::key(key, entry.value));
        }
        if events.is_empty() {
            return Err("empty sequence step".to_string());
        }
        sequence.push(KeyEvent(events));
    }
    if sequence.is_empty() {
        return Err("empty sequence".to_string());
    }

    let action = match &config.action {
        ActionConfig::KeySequence(combos) => MappedAction::KeySequence(
            combos
                .iter()
                .map(|c| parse_combo(c).map_err(|e| e.to_string()))
                .collect::<Result<_, _>>()?,
        ),
        ActionConfig::LeftClick => MappedAction::LeftClick,
        ActionConfig::ToggleSpotlight => MappedAction::ToggleSpotlight,
        ActionConfig::CyclePresets => MappedAction::CyclePresets,
        ActionConfig::Vibrate { length, intensity } => MappedAction::Vibrate {
            length: *length,
            intensity: *intensity,
        },
        ActionConfig::PointerSpeed(speed) => MappedAction::PointerSpeed(*speed),
    };

    Ok(Mapping { sequence, action })
}
