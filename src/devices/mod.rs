// MIT License - Copyright (c) 2026 Peter Wright
// Registered entities

pub mod keypad;
pub mod mac;
pub mod sensor;

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use keypad::{Keypad, KeypadDefaults, StateTimers, TimerKind};
pub use mac::Mac;
pub use sensor::{BinarySensor, SensorClass, SensorKind};

bitflags! {
    /// The Home Assistant entities a registered device exposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Open/closed, motion or leak state
        const STATE           = 0x01;
        /// Keypad alarm control panel
        const ALARM_PANEL     = 0x02;
        /// Keypad built-in motion sensor
        const MOTION          = 0x04;
        const BATTERY         = 0x08;
        const SIGNAL_STRENGTH = 0x10;
        /// Last pin typed on the keypad
        const PIN             = 0x20;
    }
}

/// Capability → (object id, Home Assistant component), in publish order.
const CAPABILITY_TABLE: [(Capabilities, &str, &str); 6] = [
    (Capabilities::STATE, "state", "binary_sensor"),
    (Capabilities::ALARM_PANEL, "alarm", "alarm_control_panel"),
    (Capabilities::MOTION, "motion", "binary_sensor"),
    (Capabilities::BATTERY, "battery", "sensor"),
    (Capabilities::SIGNAL_STRENGTH, "signal_strength", "sensor"),
    (Capabilities::PIN, "pin", "sensor"),
];

impl Capabilities {
    /// `(capability, object_id, component)` for every flag in the set.
    pub fn entries(self) -> impl Iterator<Item = (Capabilities, &'static str, &'static str)> {
        CAPABILITY_TABLE
            .into_iter()
            .filter(move |(flag, _, _)| self.contains(*flag))
    }
}

/// A registered sensor or keypad, as persisted in the registry file.
///
/// Runtime state (last seen, availability, alarm state) lives in the
/// component that owns it, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    BinarySensor(BinarySensor),
    Keypad(Keypad),
}

impl Entity {
    /// Synthesize a default record for a MAC the registry has never seen.
    pub fn discovered(kind: SensorKind, sw_version: Option<u32>) -> Self {
        match kind {
            SensorKind::Keypad => Entity::Keypad(Keypad::discovered(sw_version)),
            other => Entity::BinarySensor(BinarySensor::discovered(other, sw_version)),
        }
    }

    pub fn check(&self) -> Result<()> {
        match self {
            Entity::BinarySensor(_) => Ok(()),
            Entity::Keypad(k) => k.check(),
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Entity::BinarySensor(s) => s.class.type_label(),
            Entity::Keypad(_) => "Keypad",
        }
    }

    /// Configured name, or `"<TypeLabel> <MAC>"`.
    pub fn display_name(&self, mac: &Mac) -> String {
        let name = match self {
            Entity::BinarySensor(s) => s.name.as_ref(),
            Entity::Keypad(k) => k.name.as_ref(),
        };
        match name {
            Some(n) => n.clone(),
            None => format!("{} {}", self.type_label(), mac),
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        match self {
            Entity::BinarySensor(s) => s.effective_timeout(),
            Entity::Keypad(k) => k.effective_timeout(),
        }
    }

    pub fn sw_version(&self) -> Option<u32> {
        match self {
            Entity::BinarySensor(s) => s.sw_version,
            Entity::Keypad(k) => k.sw_version,
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            Entity::BinarySensor(s) => s.model(),
            Entity::Keypad(_) => SensorKind::Keypad.model(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let diagnostics = Capabilities::BATTERY | Capabilities::SIGNAL_STRENGTH;
        match self {
            Entity::BinarySensor(_) => Capabilities::STATE | diagnostics,
            Entity::Keypad(k) => {
                let mut caps = Capabilities::ALARM_PANEL | Capabilities::MOTION | diagnostics;
                if k.expose_pin {
                    caps |= Capabilities::PIN;
                }
                caps
            }
        }
    }

    /// Every capability this variant can ever expose. Retraction clears all of
    /// them so a toggled `expose_pin` never leaves a stale document behind.
    pub fn all_capabilities(&self) -> Capabilities {
        match self {
            Entity::BinarySensor(_) => self.capabilities(),
            Entity::Keypad(_) => self.capabilities() | Capabilities::PIN,
        }
    }

    pub fn as_keypad(&self) -> Option<&Keypad> {
        match self {
            Entity::Keypad(k) => Some(k),
            Entity::BinarySensor(_) => None,
        }
    }

    /// Whether a report of `kind` can come from this entity. Reports that do
    /// not name a kind match anything.
    pub fn matches_kind(&self, kind: SensorKind) -> bool {
        match self {
            _ if kind == SensorKind::Unknown => true,
            Entity::Keypad(_) => kind == SensorKind::Keypad,
            Entity::BinarySensor(_) => kind != SensorKind::Keypad,
        }
    }

    /// Record hardware details a report revealed. Returns the updated entity
    /// if anything changed.
    pub fn with_hardware(&self, kind: SensorKind, sw_version: Option<u32>) -> Option<Entity> {
        let mut updated = self.clone();
        match &mut updated {
            Entity::BinarySensor(s) => {
                if kind != SensorKind::Unknown && s.sensor_type != Some(kind) {
                    s.sensor_type = Some(kind);
                }
                if sw_version.is_some() && s.sw_version != sw_version {
                    s.sw_version = sw_version;
                }
            }
            Entity::Keypad(k) => {
                if sw_version.is_some() && k.sw_version != sw_version {
                    k.sw_version = sw_version;
                }
            }
        }
        (updated != *self).then_some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> Mac {
        Mac::parse("777A4656").unwrap()
    }

    #[test]
    fn test_display_name_default() {
        let entity = Entity::discovered(SensorKind::Motion, None);
        assert_eq!(entity.display_name(&mac()), "Motion Sensor 777A4656");

        let keypad = Entity::discovered(SensorKind::Keypad, Some(5));
        assert_eq!(keypad.display_name(&mac()), "Keypad 777A4656");
    }

    #[test]
    fn test_display_name_configured() {
        let entity = Entity::BinarySensor(BinarySensor {
            name: Some("Front Door".into()),
            class: SensorClass::Door,
            ..Default::default()
        });
        assert_eq!(entity.display_name(&mac()), "Front Door");
    }

    #[test]
    fn test_capabilities_by_variant() {
        let sensor = Entity::discovered(SensorKind::Switch, None);
        let names: Vec<_> = sensor.capabilities().entries().map(|(_, n, _)| n).collect();
        assert_eq!(names, ["state", "battery", "signal_strength"]);

        let mut keypad = Keypad::default();
        let entity = Entity::Keypad(keypad.clone());
        assert!(!entity.capabilities().contains(Capabilities::PIN));
        assert!(entity.all_capabilities().contains(Capabilities::PIN));

        keypad.expose_pin = true;
        let entity = Entity::Keypad(keypad);
        let entries: Vec<_> = entity.capabilities().entries().collect();
        assert_eq!(entries[0].1, "alarm");
        assert_eq!(entries[0].2, "alarm_control_panel");
        assert_eq!(entries.last().map(|e| e.1), Some("pin"));
    }

    #[test]
    fn test_with_hardware_detects_changes() {
        let entity = Entity::discovered(SensorKind::Switch, Some(19));
        assert!(entity.with_hardware(SensorKind::Switch, Some(19)).is_none());
        assert!(entity.with_hardware(SensorKind::Unknown, None).is_none());

        let updated = entity.with_hardware(SensorKind::SwitchV2, Some(23)).unwrap();
        match updated {
            Entity::BinarySensor(s) => {
                assert_eq!(s.sensor_type, Some(SensorKind::SwitchV2));
                assert_eq!(s.sw_version, Some(23));
            }
            Entity::Keypad(_) => panic!("variant changed"),
        }
    }

    #[test]
    fn test_matches_kind() {
        let keypad = Entity::discovered(SensorKind::Keypad, None);
        assert!(keypad.matches_kind(SensorKind::Keypad));
        assert!(!keypad.matches_kind(SensorKind::Motion));
        assert!(keypad.matches_kind(SensorKind::Unknown));
        let sensor = Entity::discovered(SensorKind::Leak, None);
        assert!(sensor.matches_kind(SensorKind::Unknown));
        assert!(!sensor.matches_kind(SensorKind::Keypad));
    }

    #[test]
    fn test_keypad_timeout_default() {
        let entity = Entity::discovered(SensorKind::Keypad, None);
        assert_eq!(entity.effective_timeout(), keypad::KEYPAD_TIMEOUT);
    }
}
