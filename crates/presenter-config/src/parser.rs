//! KDL configuration parser

use std::path::Path;

use crate::error::ConfigError;
use crate::model::*;

/// Convert a node's span from kdl's miette version to ours
fn node_span(node: &kdl::KdlNode) -> miette::SourceSpan {
    let span = node.span();
    miette::SourceSpan::from((span.offset(), span.len()))
}

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl uses an older miette version, so we need to extract offset/len manually
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => {
                config.global = parse_global(node)?;
            }
            "supported-device" => {
                config.supported_devices.push(parse_supported_device(node)?);
            }
            "mapping" => {
                config.mappings.push(parse_mapping(node, content)?);
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(config)
}

fn first_value(node: &kdl::KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalConfig, ConfigError> {
    let mut global = GlobalConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "log-level" => {
                    if let Some(val) = first_value(child).and_then(|v| v.as_string()) {
                        global.log_level = val
                            .parse()
                            .map_err(|e| ConfigError::Invalid { message: e })?;
                    }
                }
                "virtual-device" => {
                    global.virtual_device = first_value(child)
                        .and_then(|v| v.as_bool())
                        .ok_or_else(|| ConfigError::Invalid {
                            message: "virtual-device expects true or false".to_string(),
                        })?;
                }
                "sequence-interval-ms" => {
                    global.sequence_interval_ms = parse_millis(child, "sequence-interval-ms")?;
                }
                "spot-timeout-ms" => {
                    global.spot_timeout_ms = parse_millis(child, "spot-timeout-ms")?;
                }
                name => {
                    tracing::warn!("Unknown global config option: {}", name);
                }
            }
        }
    }

    Ok(global)
}

fn parse_millis(node: &kdl::KdlNode, option: &str) -> Result<u64, ConfigError> {
    first_value(node)
        .and_then(|v| v.as_i64())
        .and_then(|v| u64::try_from(v).ok())
        .filter(|ms| *ms > 0)
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("{} expects a positive number of milliseconds", option),
        })
}

fn parse_id_property(node: &kdl::KdlNode, property: &str) -> Result<u16, ConfigError> {
    let entry = node.get(property).ok_or_else(|| ConfigError::MissingField {
        field: format!("supported-device {}", property),
    })?;

    let id = entry
        .value()
        .as_i64()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("supported-device {} must be a 16-bit number", property),
        })?;

    if id == 0 {
        return Err(ConfigError::Invalid {
            message: format!("supported-device {} must not be 0", property),
        });
    }

    Ok(id)
}

fn parse_supported_device(node: &kdl::KdlNode) -> Result<SupportedDeviceConfig, ConfigError> {
    Ok(SupportedDeviceConfig {
        vendor: parse_id_property(node, "vendor")?,
        product: parse_id_property(node, "product")?,
        name: node
            .get("name")
            .and_then(|e| e.value().as_string())
            .map(|s| s.to_string()),
    })
}

/// Check if a key name is one the daemon can resolve to an evdev key code
fn is_valid_key_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    (upper.starts_with("KEY_") || upper.starts_with("BTN_")) && upper.len() > 4
}

/// Parse one sequence step, e.g. `"BTN_LEFT:1"` or `"KEY_LEFTCTRL:1,KEY_A:1"`
fn parse_step(step: &str) -> Result<SequenceStep, String> {
    let mut events = Vec::new();

    for part in step.split(',') {
        let part = part.trim();
        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| format!("'{}' is missing a ':VALUE' suffix", part))?;
        let key = key.trim();

        if !is_valid_key_name(key) {
            return Err(format!("unknown key name '{}'", key));
        }

        let value: i32 = value
            .trim()
            .parse()
            .map_err(|_| format!("'{}' has a non-numeric value", part))?;
        if !(0..=2).contains(&value) {
            return Err(format!("'{}' value must be 0, 1 or 2", part));
        }

        events.push(KeyEventEntry {
            key: key.to_uppercase(),
            value,
        });
    }

    Ok(SequenceStep { events })
}

fn parse_u8_property(
    node: &kdl::KdlNode,
    property: &str,
    default: Option<u8>,
) -> Result<u8, ConfigError> {
    match node.get(property) {
        Some(entry) => entry
            .value()
            .as_i64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| ConfigError::Invalid {
                message: format!("mapping property '{}' must be between 0 and 255", property),
            }),
        None => default.ok_or_else(|| ConfigError::MissingField {
            field: format!("mapping {}", property),
        }),
    }
}

fn parse_action(node: &kdl::KdlNode) -> Result<ActionConfig, ConfigError> {
    let action = node
        .get("action")
        .and_then(|e| e.value().as_string())
        .ok_or_else(|| ConfigError::MissingField {
            field: "mapping action (e.g., `action=\"left-click\"`)".to_string(),
        })?;

    match action {
        "key-sequence" => {
            let keys = node
                .get("keys")
                .and_then(|e| e.value().as_string())
                .ok_or_else(|| ConfigError::MissingField {
                    field: "mapping keys (e.g., `keys=\"Ctrl+Right\"`)".to_string(),
                })?;
            let combos: Vec<String> = keys.split_whitespace().map(|s| s.to_string()).collect();
            if combos.is_empty() {
                return Err(ConfigError::Invalid {
                    message: "key-sequence needs at least one key combination".to_string(),
                });
            }
            Ok(ActionConfig::KeySequence(combos))
        }
        "left-click" => Ok(ActionConfig::LeftClick),
        "toggle-spotlight" => Ok(ActionConfig::ToggleSpotlight),
        "cycle-presets" => Ok(ActionConfig::CyclePresets),
        "vibrate" => Ok(ActionConfig::Vibrate {
            length: parse_u8_property(node, "length", Some(64))?,
            intensity: parse_u8_property(node, "intensity", Some(128))?,
        }),
        "pointer-speed" => {
            let speed = parse_u8_property(node, "speed", None)?;
            if speed > 9 {
                return Err(ConfigError::Invalid {
                    message: format!("pointer-speed must be between 0 and 9, got {}", speed),
                });
            }
            Ok(ActionConfig::PointerSpeed(speed))
        }
        other => Err(ConfigError::UnknownAction {
            action: other.to_string(),
        }),
    }
}

fn parse_mapping(node: &kdl::KdlNode, source: &str) -> Result<MappingConfig, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidMapping {
        src: source.to_string(),
        span: node_span(node),
        message,
    };

    let mut sequence = Vec::new();
    for entry in node.entries().iter().filter(|e| e.name().is_none()) {
        let step = entry
            .value()
            .as_string()
            .ok_or_else(|| invalid("sequence steps must be strings".to_string()))?;
        sequence.push(parse_step(step).map_err(invalid)?);
    }

    if sequence.is_empty() {
        return Err(invalid("mapping has no sequence steps".to_string()));
    }

    let action = parse_action(node)?;

    Ok(MappingConfig { sequence, action })
}
