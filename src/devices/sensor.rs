// MIT License - Copyright (c) 2026 Peter Wright
// Binary sensors (contact, motion, leak)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// V1 sensors check in every 4 hours, V2 every 2 hours. The default
/// availability timeout is twice the check-in period so a single missed
/// report does not flag the sensor offline.
pub const V1_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);
pub const V2_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Firmware versions shipped on V1 and V2 hardware.
const V1_SW_VERSIONS: [u32; 1] = [19];
const V2_SW_VERSIONS: [u32; 1] = [23];

/// Hardware kind as reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Switch,
    SwitchV2,
    Motion,
    MotionV2,
    Leak,
    Climate,
    Keypad,
    #[serde(other)]
    Unknown,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::SwitchV2 => "switchv2",
            Self::Motion => "motion",
            Self::MotionV2 => "motionv2",
            Self::Leak => "leak",
            Self::Climate => "climate",
            Self::Keypad => "keypad",
            Self::Unknown => "unknown",
        }
    }

    /// Class a freshly discovered sensor of this kind gets.
    pub fn default_class(&self) -> SensorClass {
        match self {
            Self::Motion | Self::MotionV2 => SensorClass::Motion,
            Self::Leak => SensorClass::Moisture,
            _ => SensorClass::Opening,
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            Self::Switch => "WyzeSense Door/Window Sensor",
            Self::SwitchV2 => "WyzeSense Door/Window V2 Sensor",
            Self::Motion => "WyzeSense Motion Sensor",
            Self::MotionV2 => "WyzeSense Motion V2 Sensor",
            Self::Leak => "WyzeSense Leak Sensor",
            Self::Climate => "WyzeSense Climate Sensor",
            Self::Keypad => "WyzeSense Keypad",
            Self::Unknown => "WyzeSense Sensor",
        }
    }

    /// Whether the kind identifies second-generation hardware.
    pub fn is_v2(&self) -> bool {
        matches!(self, Self::SwitchV2 | Self::MotionV2 | Self::Leak | Self::Climate)
    }
}

/// Home Assistant `device_class` of a binary sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorClass {
    Door,
    Window,
    #[default]
    Opening,
    Motion,
    Moisture,
}

impl SensorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Door => "door",
            Self::Window => "window",
            Self::Opening => "opening",
            Self::Motion => "motion",
            Self::Moisture => "moisture",
        }
    }

    /// `(payload_on, payload_off)` published on the state topic.
    pub fn payloads(&self) -> (&'static str, &'static str) {
        match self {
            Self::Door | Self::Window | Self::Opening => ("open", "closed"),
            Self::Motion => ("active", "inactive"),
            Self::Moisture => ("wet", "dry"),
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Door => "Door Sensor",
            Self::Window => "Window Sensor",
            Self::Opening => "Contact Sensor",
            Self::Motion => "Motion Sensor",
            Self::Moisture => "Leak Sensor",
        }
    }
}

/// Raw report states the bridge uses for the "on" side of a binary sensor.
const STATES_ON: [&str; 3] = ["active", "open", "wet"];

/// Interpret a raw report state, applying `invert`.
pub fn state_is_on(raw: &str, invert: bool) -> bool {
    let on = STATES_ON.iter().any(|s| raw.eq_ignore_ascii_case(s));
    on != invert
}

/// Persisted configuration of a binary sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinarySensor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub class: SensorClass,
    #[serde(default)]
    pub invert_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<SensorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<u32>,
    /// Availability timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl BinarySensor {
    /// A sensor first seen through a report or scan result.
    pub fn discovered(kind: SensorKind, sw_version: Option<u32>) -> Self {
        Self {
            class: kind.default_class(),
            sensor_type: Some(kind),
            sw_version,
            ..Default::default()
        }
    }

    /// Resolved availability timeout: explicit field, then firmware version,
    /// then hardware kind, then the V1 default.
    pub fn effective_timeout(&self) -> Duration {
        if let Some(secs) = self.timeout {
            return Duration::from_secs(secs);
        }
        match self.sw_version {
            Some(v) if V2_SW_VERSIONS.contains(&v) => return V2_TIMEOUT,
            Some(v) if V1_SW_VERSIONS.contains(&v) => return V1_TIMEOUT,
            _ => {}
        }
        match self.sensor_type {
            Some(kind) if kind.is_v2() => V2_TIMEOUT,
            _ => V1_TIMEOUT,
        }
    }

    /// The on/off payload for a raw report state.
    pub fn state_payload(&self, raw: &str) -> &'static str {
        let (on, off) = self.class.payloads();
        if state_is_on(raw, self.invert_state) { on } else { off }
    }

    pub fn model(&self) -> &'static str {
        self.sensor_type.unwrap_or(SensorKind::Unknown).model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovered_class_defaults() {
        assert_eq!(BinarySensor::discovered(SensorKind::Motion, None).class, SensorClass::Motion);
        assert_eq!(BinarySensor::discovered(SensorKind::MotionV2, None).class, SensorClass::Motion);
        assert_eq!(BinarySensor::discovered(SensorKind::Leak, None).class, SensorClass::Moisture);
        assert_eq!(BinarySensor::discovered(SensorKind::Switch, None).class, SensorClass::Opening);
        assert_eq!(BinarySensor::discovered(SensorKind::Unknown, None).class, SensorClass::Opening);
    }

    #[test]
    fn test_timeout_resolution_order() {
        let mut sensor = BinarySensor::discovered(SensorKind::Switch, Some(23));
        assert_eq!(sensor.effective_timeout(), V2_TIMEOUT);

        sensor.sw_version = Some(19);
        assert_eq!(sensor.effective_timeout(), V1_TIMEOUT);

        // Explicit config wins over the firmware default
        sensor.timeout = Some(600);
        assert_eq!(sensor.effective_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_timeout_falls_back_to_kind_then_v1() {
        let v2 = BinarySensor::discovered(SensorKind::MotionV2, None);
        assert_eq!(v2.effective_timeout(), V2_TIMEOUT);

        let unknown = BinarySensor::default();
        assert_eq!(unknown.effective_timeout(), V1_TIMEOUT);

        // Unrecognized firmware falls through to the hardware kind
        let odd = BinarySensor::discovered(SensorKind::Switch, Some(42));
        assert_eq!(odd.effective_timeout(), V1_TIMEOUT);
    }

    #[test]
    fn test_state_payload_with_invert() {
        let mut door = BinarySensor {
            class: SensorClass::Door,
            ..Default::default()
        };
        assert_eq!(door.state_payload("open"), "open");
        assert_eq!(door.state_payload("close"), "closed");
        door.invert_state = true;
        assert_eq!(door.state_payload("open"), "closed");
        assert_eq!(door.state_payload("close"), "open");

        let leak = BinarySensor::discovered(SensorKind::Leak, None);
        assert_eq!(leak.state_payload("wet"), "wet");
        assert_eq!(leak.state_payload("dry"), "dry");
    }

    #[test]
    fn test_sensor_kind_serde_unknown() {
        let kind: SensorKind = serde_json::from_str("\"switchv2\"").unwrap();
        assert_eq!(kind, SensorKind::SwitchV2);
        let kind: SensorKind = serde_json::from_str("\"doorbell\"").unwrap();
        assert_eq!(kind, SensorKind::Unknown);
    }
}
