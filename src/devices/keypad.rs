// MIT License - Copyright (c) 2026 Peter Wright
// Keypad configuration and timer resolution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alarm::ArmTarget;
use crate::error::{GatewayError, Result};

/// Keypads check in far less often than sensors.
pub const KEYPAD_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// The three alarm-panel timers a keypad can override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// `arming` → `armed_*`
    Arming,
    /// `pending` → `triggered`
    Delay,
    /// `triggered` → revert or disarm
    Trigger,
}

/// Timer overrides for one armed state. All values are seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTimers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arming_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<u64>,
}

impl StateTimers {
    fn get(&self, kind: TimerKind) -> Option<u64> {
        match kind {
            TimerKind::Arming => self.arming_time,
            TimerKind::Delay => self.delay_time,
            TimerKind::Trigger => self.trigger_time,
        }
    }
}

/// Gateway-wide keypad defaults, the `[keypad]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeypadDefaults {
    #[serde(default = "default_arming_time")]
    pub arming_time: u64,
    #[serde(default = "default_delay_time")]
    pub delay_time: u64,
    #[serde(default = "default_trigger_time")]
    pub trigger_time: u64,
    #[serde(default)]
    pub disarm_after_trigger: bool,
}

fn default_arming_time() -> u64 {
    60
}
fn default_delay_time() -> u64 {
    60
}
fn default_trigger_time() -> u64 {
    120
}

impl Default for KeypadDefaults {
    fn default() -> Self {
        Self {
            arming_time: default_arming_time(),
            delay_time: default_delay_time(),
            trigger_time: default_trigger_time(),
            disarm_after_trigger: false,
        }
    }
}

impl KeypadDefaults {
    fn get(&self, kind: TimerKind) -> u64 {
        match kind {
            TimerKind::Arming => self.arming_time,
            TimerKind::Delay => self.delay_time,
            TimerKind::Trigger => self.trigger_time,
        }
    }
}

/// Persisted configuration of a keypad.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypad {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub pin: Vec<String>,
    #[serde(default)]
    pub expose_pin: bool,
    #[serde(default)]
    pub arm_required: bool,
    #[serde(default)]
    pub disarm_required: bool,
    /// Inverts the keypad's built-in motion sensor.
    #[serde(default)]
    pub invert_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disarm_after_trigger: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arming_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub armed_home: Option<StateTimers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub armed_away: Option<StateTimers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<u32>,
    /// Availability timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Keypad {
    pub fn discovered(sw_version: Option<u32>) -> Self {
        Self {
            sw_version,
            ..Default::default()
        }
    }

    /// Reject pins that are not digit strings. Called on every registry load
    /// so a hand-edited file with a typo fails loudly instead of locking the
    /// panel.
    pub fn check(&self) -> Result<()> {
        for pin in &self.pin {
            validate_pin(pin)?;
        }
        Ok(())
    }

    /// Case-sensitive exact match against the configured pins.
    pub fn accepts(&self, pin: &str) -> bool {
        self.pin.iter().any(|p| p == pin)
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(KEYPAD_TIMEOUT)
    }

    pub fn disarm_after_trigger(&self, defaults: &KeypadDefaults) -> bool {
        self.disarm_after_trigger.unwrap_or(defaults.disarm_after_trigger)
    }

    fn state_timers(&self, state: ArmTarget) -> Option<&StateTimers> {
        match state {
            ArmTarget::Home => self.armed_home.as_ref(),
            ArmTarget::Away => self.armed_away.as_ref(),
        }
    }

    fn top_level(&self, kind: TimerKind) -> Option<u64> {
        match kind {
            TimerKind::Arming => self.arming_time,
            TimerKind::Delay => self.delay_time,
            TimerKind::Trigger => self.trigger_time,
        }
    }
}

/// Resolve a timer for `state`: per-state override, then the keypad's
/// top-level field, then the gateway default.
pub fn resolve_timer(
    kind: TimerKind,
    state: ArmTarget,
    keypad: &Keypad,
    defaults: &KeypadDefaults,
) -> Duration {
    let secs = keypad
        .state_timers(state)
        .and_then(|t| t.get(kind))
        .or_else(|| keypad.top_level(kind))
        .unwrap_or_else(|| defaults.get(kind));
    Duration::from_secs(secs)
}

/// A pin is a non-empty string of ASCII digits.
pub fn validate_pin(pin: &str) -> Result<()> {
    if pin.is_empty() || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(GatewayError::InvalidPin);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypad_with_overrides() -> Keypad {
        Keypad {
            arming_time: Some(30),
            armed_away: Some(StateTimers {
                delay_time: Some(20),
                ..Default::default()
            }),
            armed_home: Some(StateTimers {
                arming_time: Some(0),
                trigger_time: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_uses_global_default() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad::default();
        assert_eq!(
            resolve_timer(TimerKind::Trigger, ArmTarget::Away, &keypad, &defaults),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_resolve_top_level_over_default() {
        let defaults = KeypadDefaults::default();
        let keypad = keypad_with_overrides();
        assert_eq!(
            resolve_timer(TimerKind::Arming, ArmTarget::Away, &keypad, &defaults),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_resolve_per_state_over_top_level() {
        let defaults = KeypadDefaults::default();
        let keypad = keypad_with_overrides();
        assert_eq!(
            resolve_timer(TimerKind::Arming, ArmTarget::Home, &keypad, &defaults),
            Duration::ZERO
        );
        assert_eq!(
            resolve_timer(TimerKind::Delay, ArmTarget::Away, &keypad, &defaults),
            Duration::from_secs(20)
        );
        // Home has no delay override, so it falls through to the default
        assert_eq!(
            resolve_timer(TimerKind::Delay, ArmTarget::Home, &keypad, &defaults),
            Duration::from_secs(60)
        );
        assert_eq!(
            resolve_timer(TimerKind::Trigger, ArmTarget::Home, &keypad, &defaults),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_pin_matching_is_exact() {
        let keypad = Keypad {
            pin: vec!["0000".into(), "1234".into()],
            ..Default::default()
        };
        assert!(keypad.accepts("0000"));
        assert!(keypad.accepts("1234"));
        assert!(!keypad.accepts("000"));
        assert!(!keypad.accepts("00000"));
        assert!(!keypad.accepts(" 0000"));
    }

    #[test]
    fn test_check_rejects_non_digit_pins() {
        let keypad = Keypad {
            pin: vec!["12a4".into()],
            ..Default::default()
        };
        assert!(keypad.check().is_err());
        assert!(validate_pin("").is_err());
        assert!(validate_pin("0042").is_ok());
    }

    #[test]
    fn test_disarm_after_trigger_fallback() {
        let mut defaults = KeypadDefaults::default();
        let mut keypad = Keypad::default();
        assert!(!keypad.disarm_after_trigger(&defaults));
        defaults.disarm_after_trigger = true;
        assert!(keypad.disarm_after_trigger(&defaults));
        keypad.disarm_after_trigger = Some(false);
        assert!(!keypad.disarm_after_trigger(&defaults));
    }
}
