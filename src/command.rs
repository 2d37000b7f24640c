// MIT License - Copyright (c) 2026 Peter Wright
// Inbound MQTT command topics

use serde::Deserialize;

use crate::devices::keypad::validate_pin;
use crate::devices::sensor::state_is_on;
use crate::devices::Mac;
use crate::discovery::Topics;
use crate::error::{GatewayError, Result};

/// Alarm-panel action carried by `<root>/<mac>/set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypadAction {
    ArmHome,
    ArmAway,
    Disarm,
}

impl KeypadAction {
    /// Case-insensitive, so both our own names and Home Assistant's default
    /// `ARM_HOME` style payloads are accepted.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arm_home" => Ok(Self::ArmHome),
            "arm_away" => Ok(Self::ArmAway),
            "disarm" => Ok(Self::Disarm),
            _ => Err(GatewayError::UnknownAction { action: s.to_string() }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArmHome => "arm_home",
            Self::ArmAway => "arm_away",
            Self::Disarm => "disarm",
        }
    }
}

/// A parsed command-topic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    Remove { mac: Mac },
    Reload,
    Set {
        mac: Mac,
        action: KeypadAction,
        pin: Option<String>,
    },
    Pin { mac: Mac, pin: String },
    Motion { mac: Mac, active: bool },
}

impl Command {
    /// Short name used in logs and acknowledgements.
    pub fn op(&self) -> &'static str {
        match self {
            Command::Scan => "scan",
            Command::Remove { .. } => "remove",
            Command::Reload => "reload",
            Command::Set { action, .. } => action.as_str(),
            Command::Pin { .. } => "pin",
            Command::Motion { .. } => "motion",
        }
    }
}

#[derive(Deserialize)]
struct SetPayload {
    action: String,
    #[serde(default)]
    pin: Option<String>,
}

/// Parse a message received under the gateway's topic root. Returns `None`
/// for topics that are not commands.
pub fn parse(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Option<Command>> {
    let Some(rest) = topic
        .strip_prefix(topics.self_root.as_str())
        .and_then(|r| r.strip_prefix('/'))
    else {
        return Ok(None);
    };
    let text = std::str::from_utf8(payload)
        .map_err(|_| GatewayError::malformed(topic, "payload is not UTF-8"))?
        .trim();

    let command = match rest.split('/').collect::<Vec<_>>().as_slice() {
        ["scan"] => Command::Scan,
        ["reload"] => Command::Reload,
        ["remove"] => Command::Remove { mac: Mac::parse(text)? },
        [mac, "set"] => {
            let mac = Mac::parse(mac)?;
            let set: SetPayload =
                serde_json::from_str(text).map_err(|e| GatewayError::malformed(topic, e.to_string()))?;
            let action = KeypadAction::parse(&set.action)?;
            // Home Assistant renders a missing code as an empty string
            let pin = set.pin.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
            if let Some(pin) = &pin {
                validate_pin(pin)?;
            }
            Command::Set { mac, action, pin }
        }
        [mac, "pin"] => {
            let mac = Mac::parse(mac)?;
            validate_pin(text)?;
            Command::Pin {
                mac,
                pin: text.to_string(),
            }
        }
        [mac, "motion"] => Command::Motion {
            mac: Mac::parse(mac)?,
            active: text.is_empty() || state_is_on(text, false),
        },
        _ => return Ok(None),
    };
    Ok(Some(command))
}
