//! Key names and key combinations
//!
//! Mapped key-sequence actions are written as combos such as `Ctrl+Right` or
//! `Shift+F5`. This module turns those strings into evdev keys and
//! generates the press/release events for them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use evdev::{EventType, InputEvent, Key};

/// Normalized modifier key representation.
///
/// Left and right variants share one modifier; the left key is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modifier {
    Ctrl,
    Shift,
    Alt,
    Super,
}

impl Modifier {
    /// Parse a modifier name string (case-insensitive).
    ///
    /// Recognized names:
    /// - Ctrl: "ctrl", "control"
    /// - Shift: "shift"
    /// - Alt: "alt"
    /// - Super: "super", "meta", "win"
    pub fn from_str_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "CTRL" | "CONTROL" => Some(Modifier::Ctrl),
            "SHIFT" => Some(Modifier::Shift),
            "ALT" => Some(Modifier::Alt),
            "SUPER" | "META" | "WIN" => Some(Modifier::Super),
            _ => None,
        }
    }

    /// Get the evdev key emitted for this modifier (left variant).
    pub fn to_key(self) -> Key {
        match self {
            Modifier::Ctrl => Key::KEY_LEFTCTRL,
            Modifier::Shift => Key::KEY_LEFTSHIFT,
            Modifier::Alt => Key::KEY_LEFTALT,
            Modifier::Super => Key::KEY_LEFTMETA,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Ctrl => write!(f, "Ctrl"),
            Modifier::Shift => write!(f, "Shift"),
            Modifier::Alt => write!(f, "Alt"),
            Modifier::Super => write!(f, "Super"),
        }
    }
}

/// A parsed key combination such as `Ctrl+Shift+Q`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyCombo {
    /// Modifiers held while the key is tapped, pressed in `Ord` order
    pub modifiers: BTreeSet<Modifier>,
    pub key: Key,
}

impl KeyCombo {
    /// Events for pressing and releasing the combo
    ///
    /// Modifiers go down first and come up last, in reverse order. Every
    /// key transition is its own SYN-terminated batch.
    pub fn tap_events(&self) -> Vec<InputEvent> {
        let mut events = Vec::with_capacity((self.modifiers.len() * 2 + 2) * 2);
        for modifier in &self.modifiers {
            push_key(&mut events, modifier.to_key(), 1);
        }
        push_key(&mut events, self.key, 1);
        push_key(&mut events, self.key, 0);
        for modifier in self.modifiers.iter().rev() {
            push_key(&mut events, modifier.to_key(), 0);
        }
        events
    }
}

fn push_key(events: &mut Vec<InputEvent>, key: Key, value: i32) {
    events.push(InputEvent::new(EventType::KEY, key.code(), value));
    events.push(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.modifiers {
            write!(f, "{}+", modifier)?;
        }
        let key_name = format!("{:?}", self.key);
        let display_name = key_name.strip_prefix("KEY_").unwrap_or(&key_name);
        write!(f, "{}", display_name)
    }
}

/// Error type for combo parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to parse combo '{input}': {reason}")]
pub struct ComboParseError {
    pub input: String,
    pub reason: String,
}

/// Parse a combo key string into a structured representation.
///
/// The expected format is `[Modifier+]...[Modifier+]Key`. Modifier order does
/// not matter: `"Ctrl+Shift+Q"` and `"Shift+Ctrl+Q"` are equivalent.
///
/// # Errors
///
/// Returns [`ComboParseError`] if:
/// - The input is empty or has an empty component
/// - No trigger key is found (only modifiers)
/// - More than one trigger key is given
/// - The trigger key name is unrecognized
/// - Duplicate modifiers are specified
///
/// # Examples
///
/// ```ignore
/// let combo = parse_combo("Ctrl+Right")?;
/// assert!(combo.modifiers.contains(&Modifier::Ctrl));
/// assert_eq!(combo.key, Key::KEY_RIGHT);
/// ```
pub fn parse_combo(input: &str) -> Result<KeyCombo, ComboParseError> {
    let input = input.trim();
    let fail = |reason: String| ComboParseError {
        input: input.to_string(),
        reason,
    };

    if input.is_empty() {
        return Err(fail("empty input".to_string()));
    }

    let parts: Vec<&str> = input.split('+').map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(fail("empty component in combo string".to_string()));
    }

    let mut modifiers = BTreeSet::new();
    let mut trigger_key: Option<Key> = None;

    for part in &parts {
        if let Some(modifier) = Modifier::from_str_name(part) {
            if !modifiers.insert(modifier) {
                return Err(fail(format!("duplicate modifier: {}", modifier)));
            }
        } else if trigger_key.is_some() {
            return Err(fail(format!("more than one trigger key, got '{}'", part)));
        } else {
            match parse_key(part) {
                Some(key) => trigger_key = Some(key),
                None => return Err(fail(format!("unknown key: '{}'", part))),
            }
        }
    }

    trigger_key
        .map(|key| KeyCombo { modifiers, key })
        .ok_or_else(|| fail("no trigger key found (only modifiers specified)".to_string()))
}

/// Parse a key name into an evdev key
///
/// Accepts friendly aliases (`Escape`, `PgDn`, `Return`), kernel names
/// without the prefix (`RIGHT`, `F5`, `A`) and raw kernel names (`KEY_NEXT`,
/// `BTN_LEFT`). Case-insensitive.
pub fn parse_key(name: &str) -> Option<Key> {
    let upper = name.trim().to_uppercase();

    let alias = match upper.as_str() {
        "ESCAPE" => Some(Key::KEY_ESC),
        "RETURN" => Some(Key::KEY_ENTER),
        "CAPS" => Some(Key::KEY_CAPSLOCK),
        "CTRL" | "LCTRL" => Some(Key::KEY_LEFTCTRL),
        "RCTRL" => Some(Key::KEY_RIGHTCTRL),
        "SHIFT" | "LSHIFT" => Some(Key::KEY_LEFTSHIFT),
        "RSHIFT" => Some(Key::KEY_RIGHTSHIFT),
        "ALT" | "LALT" => Some(Key::KEY_LEFTALT),
        "RALT" => Some(Key::KEY_RIGHTALT),
        "SUPER" | "META" => Some(Key::KEY_LEFTMETA),
        "PGUP" => Some(Key::KEY_PAGEUP),
        "PGDN" | "PGDOWN" => Some(Key::KEY_PAGEDOWN),
        "DEL" => Some(Key::KEY_DELETE),
        "INS" => Some(Key::KEY_INSERT),
        "PERIOD" => Some(Key::KEY_DOT),
        "EQUALS" => Some(Key::KEY_EQUAL),
        "-" => Some(Key::KEY_MINUS),
        "=" => Some(Key::KEY_EQUAL),
        "," => Some(Key::KEY_COMMA),
        "." => Some(Key::KEY_DOT),
        "/" => Some(Key::KEY_SLASH),
        ";" => Some(Key::KEY_SEMICOLON),
        "UPARROW" => Some(Key::KEY_UP),
        "DOWNARROW" => Some(Key::KEY_DOWN),
        "LEFTARROW" => Some(Key::KEY_LEFT),
        "RIGHTARROW" => Some(Key::KEY_RIGHT),
        _ => None,
    };
    if alias.is_some() {
        return alias;
    }

    if upper.starts_with("KEY_") || upper.starts_with("BTN_") {
        return Key::from_str(&upper).ok();
    }
    Key::from_str(&format!("KEY_{}", upper)).ok()
}
