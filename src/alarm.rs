// MIT License - Copyright (c) 2026 Peter Wright
// Keypad alarm-panel state machine

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::devices::keypad::{resolve_timer, validate_pin, Keypad, KeypadDefaults, TimerKind};
use crate::error::{GatewayError, Result};

/// Alarm panel state, serialized with the names Home Assistant expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    #[default]
    Disarmed,
    ArmedHome,
    ArmedAway,
    Pending,
    Arming,
    Triggered,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disarmed => "disarmed",
            Self::ArmedHome => "armed_home",
            Self::ArmedAway => "armed_away",
            Self::Pending => "pending",
            Self::Arming => "arming",
            Self::Triggered => "triggered",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which armed state an arm command is heading for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmTarget {
    Home,
    Away,
}

impl ArmTarget {
    pub fn armed_state(&self) -> AlarmState {
        match self {
            Self::Home => AlarmState::ArmedHome,
            Self::Away => AlarmState::ArmedAway,
        }
    }
}

/// A state change, returned so the caller can publish it and schedule the
/// next deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AlarmState,
    pub to: AlarmState,
    /// When the new state's timer expires, if it has one.
    pub deadline: Option<Instant>,
    /// Generation of the new state; a timer carrying any other generation
    /// is stale.
    pub generation: u64,
}

/// Where an arm or disarm request takes its pin from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinSource<'a> {
    /// A remote command. Only the pin it carries counts.
    Command(Option<&'a str>),
    /// A button pressed on the keypad. The pin typed before it counts.
    Keypad,
}

/// Per-keypad alarm state machine.
///
/// The machine never reads the clock or spawns timers itself: callers pass
/// `now` in and schedule a wakeup for [`Transition::deadline`], feeding it
/// back through [`AlarmMachine::timer_fired`].
#[derive(Debug, Clone, Default)]
pub struct AlarmMachine {
    state: AlarmState,
    /// Target of an in-progress arming.
    armed_target: Option<ArmTarget>,
    /// Last stable armed state; `pending` and `triggered` revert here.
    stable: Option<ArmTarget>,
    deadline: Option<Instant>,
    generation: u64,
    pin_buffer: Option<String>,
}

impl AlarmMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn armed_target(&self) -> Option<ArmTarget> {
        self.armed_target
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pin_buffer(&self) -> Option<&str> {
        self.pin_buffer.as_deref()
    }

    /// Arm towards `target`. Re-arming an armed panel to the other mode goes
    /// through `arming` again; arming to the mode already held is a no-op.
    pub fn arm(
        &mut self,
        target: ArmTarget,
        pin: PinSource<'_>,
        keypad: &Keypad,
        defaults: &KeypadDefaults,
        mac: &str,
        now: Instant,
    ) -> Result<Option<Transition>> {
        match self.state {
            AlarmState::Pending | AlarmState::Triggered => {
                return Err(GatewayError::InvalidTransition {
                    action: "arm",
                    state: self.state,
                });
            }
            AlarmState::ArmedHome | AlarmState::ArmedAway if self.stable == Some(target) => {
                return Ok(None);
            }
            AlarmState::Arming if self.armed_target == Some(target) => return Ok(None),
            _ => {}
        }

        let supplied = self.take_pin(pin);
        if keypad.arm_required && !supplied.as_deref().is_some_and(|p| keypad.accepts(p)) {
            return Err(GatewayError::PinRejected { mac: mac.to_string() });
        }

        let arming_time = resolve_timer(TimerKind::Arming, target, keypad, defaults);
        if arming_time.is_zero() {
            return Ok(Some(self.settle(target)));
        }
        self.armed_target = Some(target);
        Ok(Some(self.enter(AlarmState::Arming, Some(now + arming_time))))
    }

    /// Disarm from any state. Disarming a disarmed panel is a no-op.
    pub fn disarm(&mut self, pin: PinSource<'_>, keypad: &Keypad, mac: &str) -> Result<Option<Transition>> {
        if self.state == AlarmState::Disarmed {
            return Ok(None);
        }
        let supplied = self.take_pin(pin);
        if keypad.disarm_required && !supplied.as_deref().is_some_and(|p| keypad.accepts(p)) {
            return Err(GatewayError::PinRejected { mac: mac.to_string() });
        }
        self.armed_target = None;
        self.stable = None;
        Ok(Some(self.enter(AlarmState::Disarmed, None)))
    }

    /// Motion seen by the keypad. Only an armed panel reacts.
    pub fn motion(&mut self, keypad: &Keypad, defaults: &KeypadDefaults, now: Instant) -> Option<Transition> {
        let origin = match self.state {
            AlarmState::ArmedHome | AlarmState::ArmedAway => self.stable?,
            _ => return None,
        };
        let delay = resolve_timer(TimerKind::Delay, origin, keypad, defaults);
        if delay.is_zero() {
            return Some(self.trigger(origin, keypad, defaults, now));
        }
        Some(self.enter(AlarmState::Pending, Some(now + delay)))
    }

    /// Store a pin typed on the keypad. Returns the pin when it should be
    /// published on the exposed-pin topic.
    pub fn pin_entered(&mut self, pin: &str, keypad: &Keypad) -> Result<Option<String>> {
        validate_pin(pin)?;
        self.pin_buffer = Some(pin.to_string());
        Ok(keypad.expose_pin.then(|| pin.to_string()))
    }

    /// A scheduled deadline elapsed. Late or superseded timers are ignored.
    pub fn timer_fired(
        &mut self,
        generation: u64,
        keypad: &Keypad,
        defaults: &KeypadDefaults,
        now: Instant,
    ) -> Option<Transition> {
        if generation != self.generation {
            return None;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }

        match self.state {
            AlarmState::Arming => {
                let target = self.armed_target?;
                Some(self.settle(target))
            }
            AlarmState::Pending => {
                let origin = self.stable?;
                Some(self.trigger(origin, keypad, defaults, now))
            }
            AlarmState::Triggered => {
                if keypad.disarm_after_trigger(defaults) {
                    self.stable = None;
                    return Some(self.enter(AlarmState::Disarmed, None));
                }
                let origin = self.stable?;
                Some(self.settle(origin))
            }
            AlarmState::Disarmed | AlarmState::ArmedHome | AlarmState::ArmedAway => None,
        }
    }

    /// A keypad button consumes the last pin typed on the keypad. A remote
    /// command never sees that buffer.
    fn take_pin(&mut self, source: PinSource<'_>) -> Option<String> {
        match source {
            PinSource::Command(pin) => pin.map(str::to_string),
            PinSource::Keypad => self.pin_buffer.take(),
        }
    }

    fn settle(&mut self, target: ArmTarget) -> Transition {
        self.armed_target = None;
        self.stable = Some(target);
        self.enter(target.armed_state(), None)
    }

    /// A zero trigger time leaves the panel triggered until disarmed.
    fn trigger(&mut self, origin: ArmTarget, keypad: &Keypad, defaults: &KeypadDefaults, now: Instant) -> Transition {
        let trigger_time = resolve_timer(TimerKind::Trigger, origin, keypad, defaults);
        let deadline = (!trigger_time.is_zero()).then(|| now + trigger_time);
        self.enter(AlarmState::Triggered, deadline)
    }

    fn enter(&mut self, to: AlarmState, deadline: Option<Instant>) -> Transition {
        let from = self.state;
        self.state = to;
        self.deadline = deadline;
        self.generation += 1;
        Transition {
            from,
            to,
            deadline,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::devices::keypad::StateTimers;

    const MAC: &str = "7A000001";

    fn secs(t0: Instant, s: u64) -> Instant {
        t0 + Duration::from_secs(s)
    }

    /// Fire the machine's current timer at its deadline.
    fn expire(m: &mut AlarmMachine, keypad: &Keypad, defaults: &KeypadDefaults) -> Option<Transition> {
        let deadline = m.deadline()?;
        m.timer_fired(m.generation(), keypad, defaults, deadline)
    }

    fn timeline_keypad() -> Keypad {
        Keypad {
            arming_time: Some(30),
            trigger_time: Some(4),
            disarm_after_trigger: Some(false),
            armed_away: Some(StateTimers {
                delay_time: Some(20),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_full_timeline_reverts_to_armed_away() {
        let defaults = KeypadDefaults::default();
        let keypad = timeline_keypad();
        let t0 = Instant::now();
        let mut m = AlarmMachine::new();

        let t = m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, t0).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::Arming);
        assert_eq!(t.deadline, Some(secs(t0, 30)));
        assert_eq!(m.armed_target(), Some(ArmTarget::Away));

        let t = m.timer_fired(m.generation(), &keypad, &defaults, secs(t0, 30)).unwrap();
        assert_eq!(t.to, AlarmState::ArmedAway);
        assert_eq!(t.deadline, None);

        let t = m.motion(&keypad, &defaults, secs(t0, 35)).unwrap();
        assert_eq!(t.to, AlarmState::Pending);
        assert_eq!(t.deadline, Some(secs(t0, 55)));

        let t = m.timer_fired(m.generation(), &keypad, &defaults, secs(t0, 55)).unwrap();
        assert_eq!(t.to, AlarmState::Triggered);
        assert_eq!(t.deadline, Some(secs(t0, 59)));

        let t = m.timer_fired(m.generation(), &keypad, &defaults, secs(t0, 59)).unwrap();
        assert_eq!(t.from, AlarmState::Triggered);
        assert_eq!(t.to, AlarmState::ArmedAway);
        assert_eq!(m.state(), AlarmState::ArmedAway);
    }

    #[test]
    fn test_disarm_after_trigger() {
        let mut defaults = KeypadDefaults::default();
        defaults.disarm_after_trigger = true;
        let keypad = Keypad {
            arming_time: Some(0),
            delay_time: Some(0),
            trigger_time: Some(10),
            ..Default::default()
        };
        let t0 = Instant::now();
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Home, PinSource::Command(None), &keypad, &defaults, MAC, t0).unwrap();
        assert_eq!(m.state(), AlarmState::ArmedHome);

        let t = m.motion(&keypad, &defaults, t0).unwrap();
        assert_eq!(t.to, AlarmState::Triggered);

        let t = expire(&mut m, &keypad, &defaults).unwrap();
        assert_eq!(t.to, AlarmState::Disarmed);
    }

    #[test]
    fn test_zero_arming_time_arms_immediately() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            armed_home: Some(StateTimers {
                arming_time: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut m = AlarmMachine::new();
        let t = m
            .arm(ArmTarget::Home, PinSource::Command(None), &keypad, &defaults, MAC, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(t.from, AlarmState::Disarmed);
        assert_eq!(t.to, AlarmState::ArmedHome);
        assert!(m.deadline().is_none());
    }

    #[test]
    fn test_arm_required_rejects_missing_or_wrong_pin() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            pin: vec!["0000".into()],
            arm_required: true,
            ..Default::default()
        };
        let mut m = AlarmMachine::new();
        let now = Instant::now();
        assert!(matches!(
            m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, now),
            Err(GatewayError::PinRejected { .. })
        ));
        assert!(m.arm(ArmTarget::Away, PinSource::Command(Some("1111")), &keypad, &defaults, MAC, now).is_err());
        assert_eq!(m.state(), AlarmState::Disarmed);
        assert_eq!(m.generation(), 0);

        let t = m.arm(ArmTarget::Away, PinSource::Command(Some("0000")), &keypad, &defaults, MAC, now).unwrap();
        assert_eq!(t.map(|t| t.to), Some(AlarmState::Arming));
    }

    #[test]
    fn test_wrong_pin_entry_never_unlocks_disarm() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            pin: vec!["0000".into()],
            disarm_required: true,
            arming_time: Some(0),
            ..Default::default()
        };
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, Instant::now()).unwrap();

        m.pin_entered("1234", &keypad).unwrap();
        assert!(m.disarm(PinSource::Keypad, &keypad, MAC).is_err());
        assert_eq!(m.state(), AlarmState::ArmedAway);

        // The rejected attempt consumed the buffer
        assert!(m.pin_buffer().is_none());
        assert!(m.disarm(PinSource::Keypad, &keypad, MAC).is_err());

        m.pin_entered("0000", &keypad).unwrap();
        let t = m.disarm(PinSource::Keypad, &keypad, MAC).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::Disarmed);
    }

    #[test]
    fn test_remote_disarm_ignores_typed_pin() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            pin: vec!["0000".into()],
            disarm_required: true,
            arming_time: Some(0),
            ..Default::default()
        };
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, Instant::now())
            .unwrap();

        m.pin_entered("0000", &keypad).unwrap();
        assert!(matches!(
            m.disarm(PinSource::Command(None), &keypad, MAC),
            Err(GatewayError::PinRejected { .. })
        ));
        assert_eq!(m.state(), AlarmState::ArmedAway);
        // Left for the keypad's own buttons
        assert_eq!(m.pin_buffer(), Some("0000"));
        assert!(m.disarm(PinSource::Keypad, &keypad, MAC).unwrap().is_some());
    }

    #[test]
    fn test_correct_pin_disarms_from_every_state() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            pin: vec!["0000".into()],
            disarm_required: true,
            arming_time: Some(10),
            delay_time: Some(10),
            trigger_time: Some(10),
            ..Default::default()
        };
        let t0 = Instant::now();

        // arming
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, t0).unwrap();
        assert_eq!(m.state(), AlarmState::Arming);
        assert!(m.disarm(PinSource::Command(Some("0000")), &keypad, MAC).unwrap().is_some());

        // armed, pending, triggered
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, t0).unwrap();
        expire(&mut m, &keypad, &defaults);
        let mut snapshots = vec![m.clone()];
        m.motion(&keypad, &defaults, secs(t0, 10));
        snapshots.push(m.clone());
        expire(&mut m, &keypad, &defaults);
        snapshots.push(m.clone());

        let states: Vec<_> = snapshots.iter().map(|m| m.state()).collect();
        assert_eq!(
            states,
            [AlarmState::ArmedAway, AlarmState::Pending, AlarmState::Triggered]
        );
        for mut m in snapshots {
            let t = m.disarm(PinSource::Command(Some("0000")), &keypad, MAC).unwrap().unwrap();
            assert_eq!(t.to, AlarmState::Disarmed);
            assert!(m.deadline().is_none());
        }
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            arming_time: Some(30),
            ..Default::default()
        };
        let t0 = Instant::now();
        let mut m = AlarmMachine::new();
        let t = m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, t0).unwrap().unwrap();
        m.disarm(PinSource::Command(None), &keypad, MAC).unwrap();

        // The arming timer fires after the disarm
        assert!(m.timer_fired(t.generation, &keypad, &defaults, secs(t0, 30)).is_none());
        assert_eq!(m.state(), AlarmState::Disarmed);
    }

    #[test]
    fn test_early_timer_is_ignored() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad::default();
        let t0 = Instant::now();
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Home, PinSource::Command(None), &keypad, &defaults, MAC, t0).unwrap();
        assert!(m.timer_fired(m.generation(), &keypad, &defaults, secs(t0, 1)).is_none());
        assert_eq!(m.state(), AlarmState::Arming);
    }

    #[test]
    fn test_motion_ignored_unless_armed() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad::default();
        let now = Instant::now();
        let mut m = AlarmMachine::new();
        assert!(m.motion(&keypad, &defaults, now).is_none());
        m.arm(ArmTarget::Home, PinSource::Command(None), &keypad, &defaults, MAC, now).unwrap();
        assert!(m.motion(&keypad, &defaults, now).is_none());
        assert_eq!(m.state(), AlarmState::Arming);
    }

    #[test]
    fn test_arm_rejected_while_pending() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            arming_time: Some(0),
            ..Default::default()
        };
        let now = Instant::now();
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Home, PinSource::Command(None), &keypad, &defaults, MAC, now).unwrap();
        m.motion(&keypad, &defaults, now).unwrap();
        assert!(matches!(
            m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, now),
            Err(GatewayError::InvalidTransition { action: "arm", state: AlarmState::Pending })
        ));
    }

    #[test]
    fn test_rearm_same_mode_is_noop() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            arming_time: Some(0),
            ..Default::default()
        };
        let now = Instant::now();
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, now).unwrap();
        let generation = m.generation();
        assert!(m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, now).unwrap().is_none());
        assert_eq!(m.generation(), generation);

        let t = m.arm(ArmTarget::Home, PinSource::Command(None), &keypad, &defaults, MAC, now).unwrap().unwrap();
        assert_eq!(t.from, AlarmState::ArmedAway);
        assert_eq!(t.to, AlarmState::ArmedHome);
    }

    #[test]
    fn test_zero_trigger_time_stays_triggered() {
        let defaults = KeypadDefaults::default();
        let keypad = Keypad {
            arming_time: Some(0),
            delay_time: Some(0),
            trigger_time: Some(0),
            ..Default::default()
        };
        let now = Instant::now();
        let mut m = AlarmMachine::new();
        m.arm(ArmTarget::Away, PinSource::Command(None), &keypad, &defaults, MAC, now).unwrap();
        let t = m.motion(&keypad, &defaults, now).unwrap();
        assert_eq!(t.to, AlarmState::Triggered);
        assert!(t.deadline.is_none());
    }

    #[test]
    fn test_pin_exposure() {
        let mut keypad = Keypad::default();
        let mut m = AlarmMachine::new();
        assert_eq!(m.pin_entered("1234", &keypad).unwrap(), None);
        assert_eq!(m.pin_buffer(), Some("1234"));

        keypad.expose_pin = true;
        assert_eq!(m.pin_entered("4321", &keypad).unwrap().as_deref(), Some("4321"));
        assert!(matches!(m.pin_entered("12ab", &keypad), Err(GatewayError::InvalidPin)));
        assert_eq!(m.pin_buffer(), Some("4321"));
    }
}
