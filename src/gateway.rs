// MIT License - Copyright (c) 2026 Peter Wright
// Gateway event loop: routes bridge and MQTT events to the registry,
// availability tracker and keypad state machines

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::alarm::{AlarmMachine, AlarmState, ArmTarget, PinSource, Transition};
use crate::availability::{AvailabilityTracker, SavedState};
use crate::bridge::{Bridge, BridgeEvent, ScanResult, SensorReport};
use crate::command::{self, Command, KeypadAction};
use crate::config::Config;
use crate::devices::keypad::validate_pin;
use crate::devices::sensor::state_is_on;
use crate::devices::{Entity, Keypad, KeypadDefaults, Mac, SensorKind};
use crate::discovery::{LiveState, Publisher};
use crate::error::{GatewayError, Result};
use crate::registry::{Registry, RegistryBackend};

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum GatewayEvent {
    Bridge(BridgeEvent),
    /// A message on one of the subscribed command topics.
    Mqtt { topic: String, payload: Vec<u8> },
    TimerFired { mac: Mac, generation: u64 },
    Sweep { now: DateTime<Utc> },
    ScanFinished {
        src: CommandSource,
        result: Result<Option<ScanResult>>,
    },
    UnpairFinished {
        mac: Mac,
        src: CommandSource,
        result: Result<()>,
    },
    Reload,
    Shutdown,
}

/// The command message a deferred acknowledgement refers to.
#[derive(Debug, Clone)]
pub struct CommandSource {
    pub topic: String,
    pub payload: String,
}

/// Slack on top of a bridge's own request deadline. The bridge times out
/// first and clears its pending request; this only catches a bridge that
/// never answers at all.
const BRIDGE_GRACE: Duration = Duration::from_secs(5);

/// Tunables the event loop needs from the configuration.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub keypad: KeypadDefaults,
    pub scan_timeout: Duration,
    pub command_timeout: Duration,
    /// Where availability data is saved on shutdown and reload.
    pub state_file: Option<PathBuf>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            keypad: KeypadDefaults::default(),
            scan_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(5),
            state_file: None,
        }
    }
}

impl GatewayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            keypad: config.keypad.clone(),
            scan_timeout: config.bridge.scan_timeout(),
            command_timeout: config.bridge.command_timeout(),
            state_file: Some(config.gateway.state_file.clone()),
        }
    }
}

/// Result of executing a command.
enum Outcome {
    Done,
    /// Acknowledged later, when a spawned bridge request completes.
    Deferred,
}

/// The gateway state engine.
///
/// All registry, availability and alarm mutation happens in [`Gateway::handle`],
/// called from a single task draining the inbox. Timers and bridge requests
/// run as their own tasks and report back through the inbox.
pub struct Gateway<S, B> {
    registry: Registry<S>,
    availability: AvailabilityTracker,
    publisher: Publisher,
    bridge: Arc<B>,
    options: GatewayOptions,
    inbox: mpsc::Sender<GatewayEvent>,
    live: HashMap<Mac, LiveState>,
    alarms: HashMap<Mac, AlarmMachine>,
    timers: HashMap<Mac, JoinHandle<()>>,
}

impl<S: RegistryBackend, B: Bridge> Gateway<S, B> {
    pub fn new(
        registry: Registry<S>,
        publisher: Publisher,
        bridge: Arc<B>,
        options: GatewayOptions,
        inbox: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            registry,
            availability: AvailabilityTracker::new(),
            publisher,
            bridge,
            options,
            inbox,
            live: HashMap::new(),
            alarms: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    pub fn availability(&self) -> &AvailabilityTracker {
        &self.availability
    }

    pub fn alarm_state(&self, mac: &Mac) -> Option<AlarmState> {
        self.alarms.get(mac).map(AlarmMachine::state)
    }

    pub fn alarm(&self, mac: &Mac) -> Option<&AlarmMachine> {
        self.alarms.get(mac)
    }

    pub fn live_state(&self, mac: &Mac) -> Option<&LiveState> {
        self.live.get(mac)
    }

    /// Whether a keypad timer task is scheduled for `mac`.
    pub fn has_timer(&self, mac: &Mac) -> bool {
        self.timers.get(mac).is_some_and(|h| !h.is_finished())
    }

    /// How often the availability sweep should run.
    pub fn sweep_interval(&self) -> Duration {
        self.availability.sweep_interval()
    }

    /// Track every registered entity, restore saved availability and publish
    /// discovery for everything.
    pub fn start(&mut self) {
        let snapshot = self.registry.snapshot();
        for (mac, entity) in snapshot.iter() {
            self.availability.track(mac, entity.effective_timeout());
            if entity.as_keypad().is_some() {
                self.alarms.entry(mac.clone()).or_default();
                self.live.entry(mac.clone()).or_default().alarm = Some(AlarmState::Disarmed);
            }
        }
        self.restore_state();
        for (mac, entity) in snapshot.iter() {
            self.announce(mac, entity);
        }
        info!("Gateway started with {} entities", snapshot.len());
    }

    /// Drain the inbox until shutdown.
    pub async fn run(mut self, mut rx: mpsc::Receiver<GatewayEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        info!("Gateway event loop stopped");
    }

    /// Process one event. Returns `false` once the gateway has shut down.
    pub fn handle(&mut self, event: GatewayEvent) -> bool {
        match event {
            GatewayEvent::Bridge(BridgeEvent::SensorReport(report)) => self.on_report(report),
            GatewayEvent::Bridge(BridgeEvent::ScanResult(result)) => {
                if let Err(e) = self.on_scan_result(result) {
                    warn!("Ignoring scan result: {e}");
                }
            }
            GatewayEvent::Bridge(BridgeEvent::BridgeReady) => self.on_bridge_ready(),
            GatewayEvent::Mqtt { topic, payload } => self.on_mqtt(&topic, &payload),
            GatewayEvent::TimerFired { mac, generation } => self.on_timer(&mac, generation),
            GatewayEvent::Sweep { now } => {
                for change in self.availability.sweep(now) {
                    self.publisher.publish_availability(&change.mac, change.available);
                }
            }
            GatewayEvent::ScanFinished { src, result } => {
                let result = result.and_then(|found| match found {
                    Some(scan) => self.on_scan_result(scan),
                    None => {
                        info!("Scan finished, no new sensor");
                        Ok(())
                    }
                });
                self.ack(&src, result);
            }
            GatewayEvent::UnpairFinished { mac, src, result } => {
                let result = result.and_then(|()| self.remove_entity(&mac));
                self.ack(&src, result);
            }
            GatewayEvent::Reload => {
                if let Err(e) = self.reload() {
                    error!("Reload failed, keeping current registry: {e}");
                }
            }
            GatewayEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Bridge events
    // -----------------------------------------------------------------------

    fn on_report(&mut self, report: SensorReport) {
        let mac = match Mac::parse(&report.mac) {
            Ok(mac) => mac,
            Err(e) => {
                warn!("Ignoring report: {e}");
                return;
            }
        };
        debug!("Report from {mac}: {report:?}");

        let entity = match self.ensure_registered(&mac, report.kind, report.sw_version) {
            Ok(entity) => entity,
            Err(e) => {
                warn!("Ignoring report from {mac}: {e}");
                return;
            }
        };

        if let Some(change) = self.availability.record_seen(&mac, report.timestamp) {
            self.publisher.publish_availability(&change.mac, change.available);
        }

        {
            let live = self.live.entry(mac.clone()).or_default();
            live.battery = report.battery_percent().or(live.battery);
            live.signal_strength = report.signal_dbm().or(live.signal_strength);
            live.last_seen = Some(report.timestamp);
        }

        match (&entity, report.state.as_deref()) {
            (Entity::BinarySensor(sensor), Some(raw)) => {
                let payload = sensor.state_payload(raw);
                self.live.entry(mac.clone()).or_default().state = Some(payload);
            }
            (Entity::Keypad(keypad), Some(raw)) => {
                if let Err(e) = self.on_keypad_report(&mac, keypad, raw) {
                    warn!("Keypad {mac}: {e}");
                    let src = CommandSource {
                        topic: self.publisher.topics().bridge_event(),
                        payload: serde_json::json!({ "mac": mac.as_str(), "state": raw }).to_string(),
                    };
                    self.ack(&src, Err(e));
                }
            }
            (_, None) => {}
        }
        self.publish_state(&mac);
    }

    /// Interpret a keypad report: motion, a button press, or a typed pin.
    fn on_keypad_report(&mut self, mac: &Mac, keypad: &Keypad, raw: &str) -> Result<()> {
        match raw {
            "active" | "inactive" => self.set_motion(mac, keypad, state_is_on(raw, keypad.invert_state)),
            _ if validate_pin(raw).is_ok() => self.pin_entered(mac, keypad, raw),
            _ => {
                let action = KeypadAction::parse(raw)?;
                self.keypad_action(mac, keypad, action, PinSource::Keypad)
            }
        }
    }

    fn on_scan_result(&mut self, result: ScanResult) -> Result<()> {
        let mac = Mac::parse(&result.mac)?;
        info!("Scan found {mac} ({})", result.kind.as_str());
        self.ensure_registered(&mac, result.kind, result.sw_version)?;
        // A freshly paired sensor is evidently in range
        if let Some(change) = self.availability.record_seen(&mac, Utc::now()) {
            self.publisher.publish_availability(&change.mac, change.available);
        }
        Ok(())
    }

    fn on_bridge_ready(&mut self) {
        info!("Bridge ready, republishing all entities");
        let snapshot = self.registry.snapshot();
        for (mac, entity) in snapshot.iter() {
            self.announce(mac, entity);
        }
    }

    /// Look up `mac`, registering it with defaults if it has never been seen
    /// and recording hardware details the bridge revealed.
    fn ensure_registered(&mut self, mac: &Mac, kind: SensorKind, sw_version: Option<u32>) -> Result<Entity> {
        let Some(existing) = self.registry.get(mac).cloned() else {
            let entity = Entity::discovered(kind, sw_version);
            self.registry.upsert(mac.clone(), entity.clone())?;
            warn!(
                "Linked sensor {mac} ({}) automatically added to the registry",
                kind.as_str()
            );
            self.availability.track(mac, entity.effective_timeout());
            if entity.as_keypad().is_some() {
                self.alarms.entry(mac.clone()).or_default();
                self.live.entry(mac.clone()).or_default().alarm = Some(AlarmState::Disarmed);
            }
            self.publisher.publish_discovery(mac, &entity);
            return Ok(entity);
        };

        if !existing.matches_kind(kind) {
            return Err(GatewayError::malformed(
                mac.as_str(),
                format!("{} report for a registered {}", kind.as_str(), existing.type_label()),
            ));
        }
        let Some(updated) = existing.with_hardware(kind, sw_version) else {
            return Ok(existing);
        };
        match self.registry.upsert(mac.clone(), updated.clone()) {
            Ok(_) => {
                info!("Updated hardware details for {mac}");
                self.availability.track(mac, updated.effective_timeout());
                self.publisher.publish_discovery(mac, &updated);
                Ok(updated)
            }
            Err(e) => {
                warn!("Could not record hardware details for {mac}: {e}");
                Ok(existing)
            }
        }
    }

    // -----------------------------------------------------------------------
    // MQTT commands
    // -----------------------------------------------------------------------

    fn on_mqtt(&mut self, topic: &str, payload: &[u8]) {
        let src = CommandSource {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };
        let command = match command::parse(self.publisher.topics(), topic, payload) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                warn!("Rejected command on {topic}: {e}");
                self.ack(&src, Err(e));
                return;
            }
        };
        info!("Command: {} ({topic})", command.op());
        match self.execute(command, &src) {
            Ok(Outcome::Done) => self.ack(&src, Ok(())),
            Ok(Outcome::Deferred) => {}
            Err(e) => {
                warn!("Command on {topic} failed: {e}");
                self.ack(&src, Err(e));
            }
        }
    }

    fn execute(&mut self, command: Command, src: &CommandSource) -> Result<Outcome> {
        match command {
            Command::Scan => {
                self.spawn_scan(src.clone());
                Ok(Outcome::Deferred)
            }
            Command::Remove { mac } => {
                if !self.registry.contains(&mac) {
                    return Err(GatewayError::NotFound { mac: mac.to_string() });
                }
                self.spawn_unpair(mac, src.clone());
                Ok(Outcome::Deferred)
            }
            Command::Reload => {
                self.reload()?;
                Ok(Outcome::Done)
            }
            Command::Set { mac, action, pin } => {
                let keypad = self.keypad(&mac)?;
                self.keypad_action(&mac, &keypad, action, PinSource::Command(pin.as_deref()))?;
                Ok(Outcome::Done)
            }
            Command::Pin { mac, pin } => {
                let keypad = self.keypad(&mac)?;
                self.pin_entered(&mac, &keypad, &pin)?;
                Ok(Outcome::Done)
            }
            Command::Motion { mac, active } => {
                let keypad = self.keypad(&mac)?;
                self.set_motion(&mac, &keypad, active)?;
                self.publish_state(&mac);
                Ok(Outcome::Done)
            }
        }
    }

    fn spawn_scan(&self, src: CommandSource) {
        let bridge = Arc::clone(&self.bridge);
        let inbox = self.inbox.clone();
        let limit = self.options.scan_timeout + self.options.command_timeout + BRIDGE_GRACE;
        info!("Starting scan for {}s", self.options.scan_timeout.as_secs());
        tokio::spawn(async move {
            let result = timeout(limit, bridge.scan())
                .await
                .unwrap_or_else(|_| Err(GatewayError::BridgeTimeout { op: "scan".to_string() }));
            if inbox.send(GatewayEvent::ScanFinished { src, result }).await.is_err() {
                debug!("Gateway stopped before scan finished");
            }
        });
    }

    fn spawn_unpair(&self, mac: Mac, src: CommandSource) {
        let bridge = Arc::clone(&self.bridge);
        let inbox = self.inbox.clone();
        let limit = self.options.command_timeout + BRIDGE_GRACE;
        tokio::spawn(async move {
            let result = timeout(limit, bridge.unpair(&mac))
                .await
                .unwrap_or_else(|_| Err(GatewayError::BridgeTimeout { op: "unpair".to_string() }));
            if inbox.send(GatewayEvent::UnpairFinished { mac, src, result }).await.is_err() {
                debug!("Gateway stopped before unpair finished");
            }
        });
    }

    fn ack(&self, src: &CommandSource, result: Result<()>) {
        let error = result.err().map(|e| format!("{}: {e}", e.kind()));
        self.publisher.publish_ack(&src.topic, &src.payload, error);
    }

    // -----------------------------------------------------------------------
    // Keypads
    // -----------------------------------------------------------------------

    fn keypad(&self, mac: &Mac) -> Result<Keypad> {
        match self.registry.get(mac) {
            Some(Entity::Keypad(k)) => Ok(k.clone()),
            Some(Entity::BinarySensor(_)) => Err(GatewayError::NotAKeypad { mac: mac.to_string() }),
            None => Err(GatewayError::NotFound { mac: mac.to_string() }),
        }
    }

    fn keypad_action(&mut self, mac: &Mac, keypad: &Keypad, action: KeypadAction, pin: PinSource<'_>) -> Result<()> {
        let machine = self.alarms.entry(mac.clone()).or_default();
        let defaults = &self.options.keypad;
        let now = Instant::now();
        let transition = match action {
            KeypadAction::ArmHome => machine.arm(ArmTarget::Home, pin, keypad, defaults, mac.as_str(), now)?,
            KeypadAction::ArmAway => machine.arm(ArmTarget::Away, pin, keypad, defaults, mac.as_str(), now)?,
            KeypadAction::Disarm => machine.disarm(pin, keypad, mac.as_str())?,
        };
        match transition {
            Some(t) => self.apply_transition(mac, t),
            None => debug!("{mac}: {} is a no-op", action.as_str()),
        }
        Ok(())
    }

    fn pin_entered(&mut self, mac: &Mac, keypad: &Keypad, pin: &str) -> Result<()> {
        let machine = self.alarms.entry(mac.clone()).or_default();
        if let Some(exposed) = machine.pin_entered(pin, keypad)? {
            self.publisher.publish_pin(mac, &exposed);
        }
        Ok(())
    }

    fn set_motion(&mut self, mac: &Mac, keypad: &Keypad, active: bool) -> Result<()> {
        self.live.entry(mac.clone()).or_default().motion = Some(if active { "active" } else { "inactive" });
        if !active {
            return Ok(());
        }
        let machine = self.alarms.entry(mac.clone()).or_default();
        if let Some(t) = machine.motion(keypad, &self.options.keypad, Instant::now()) {
            self.apply_transition(mac, t);
        }
        Ok(())
    }

    fn on_timer(&mut self, mac: &Mac, generation: u64) {
        let Ok(keypad) = self.keypad(mac) else {
            debug!("Timer for unregistered {mac} ignored");
            return;
        };
        let Some(machine) = self.alarms.get_mut(mac) else {
            return;
        };
        match machine.timer_fired(generation, &keypad, &self.options.keypad, Instant::now()) {
            Some(t) => self.apply_transition(mac, t),
            None => debug!("{mac}: stale timer (generation {generation}) ignored"),
        }
    }

    /// Publish a state change and replace the keypad's timer task.
    fn apply_transition(&mut self, mac: &Mac, t: Transition) {
        info!("{mac}: alarm {} -> {}", t.from, t.to);
        self.cancel_timer(mac);
        if let Some(deadline) = t.deadline {
            self.schedule_timer(mac, t.generation, deadline);
        }
        self.live.entry(mac.clone()).or_default().alarm = Some(t.to);
        self.publish_state(mac);
    }

    fn schedule_timer(&mut self, mac: &Mac, generation: u64, deadline: Instant) {
        let inbox = self.inbox.clone();
        let timer_mac = mac.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = inbox
                .send(GatewayEvent::TimerFired {
                    mac: timer_mac,
                    generation,
                })
                .await;
        });
        self.timers.insert(mac.clone(), handle);
    }

    fn cancel_timer(&mut self, mac: &Mac) {
        if let Some(handle) = self.timers.remove(mac) {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Registry lifecycle
    // -----------------------------------------------------------------------

    fn remove_entity(&mut self, mac: &Mac) -> Result<()> {
        let entity = self
            .registry
            .get(mac)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound { mac: mac.to_string() })?;
        self.registry.remove(mac)?;
        self.drop_runtime_state(mac);
        self.publisher.retract_discovery(mac, &entity);
        Ok(())
    }

    fn drop_runtime_state(&mut self, mac: &Mac) {
        self.cancel_timer(mac);
        self.alarms.remove(mac);
        self.live.remove(mac);
        self.availability.forget(mac);
    }

    /// Re-read the registry. Entities still present keep their alarm state
    /// and timers.
    pub fn reload(&mut self) -> Result<()> {
        self.save_state();
        let before = self.registry.snapshot();
        let diff = self.registry.reload()?;

        for (mac, old) in &diff.removed {
            self.drop_runtime_state(mac);
            self.publisher.retract_discovery(mac, old);
        }

        let after = self.registry.snapshot();
        for mac in diff.added.iter().chain(&diff.changed) {
            let Some(entity) = after.get(mac) else {
                continue;
            };
            if let Some(old) = before.get(mac) {
                let dropped = old.capabilities() - entity.capabilities();
                if !dropped.is_empty() {
                    self.publisher.retract_capabilities(mac, dropped);
                }
            }
            self.availability.track(mac, entity.effective_timeout());
            if entity.as_keypad().is_some() {
                self.alarms.entry(mac.clone()).or_default();
                let live = self.live.entry(mac.clone()).or_default();
                live.alarm.get_or_insert(AlarmState::Disarmed);
            } else if self.alarms.remove(mac).is_some() {
                self.cancel_timer(mac);
                if let Some(live) = self.live.get_mut(mac) {
                    live.alarm = None;
                    live.motion = None;
                }
            }
            self.announce(mac, entity);
        }
        Ok(())
    }

    /// Publish discovery, availability and any known state for an entity.
    fn announce(&self, mac: &Mac, entity: &Entity) {
        self.publisher.publish_discovery(mac, entity);
        self.publisher
            .publish_availability(mac, self.availability.is_available(mac));
        if let Some(live) = self.live.get(mac) {
            self.publisher.publish_state(mac, entity, live);
        }
    }

    fn publish_state(&self, mac: &Mac) {
        if let (Some(entity), Some(live)) = (self.registry.get(mac), self.live.get(mac)) {
            self.publisher.publish_state(mac, entity, live);
        }
    }

    // -----------------------------------------------------------------------
    // Availability state file
    // -----------------------------------------------------------------------

    fn restore_state(&mut self) {
        let Some(path) = &self.options.state_file else {
            return;
        };
        match SavedState::load(path) {
            Ok(Some(saved)) => {
                let restored = self.availability.restore(&saved, Utc::now());
                info!("Restored availability for {restored} entities");
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable state file: {e}"),
        }
    }

    fn save_state(&self) {
        let Some(path) = &self.options.state_file else {
            return;
        };
        if let Err(e) = self.availability.snapshot(Utc::now()).save(path) {
            error!("Failed to save state file: {e}");
        }
    }

    fn shutdown(&mut self) {
        info!("Gateway shutting down");
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.save_state();
        self.publisher.publish_gateway_status(false);
    }
}
