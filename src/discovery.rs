// MIT License - Copyright (c) 2026 Peter Wright
// Home Assistant discovery documents and outbound state topics

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::alarm::AlarmState;
use crate::devices::{Capabilities, Entity, Mac};

const MANUFACTURER: &str = "Wyze";
const VIA_DEVICE: &str = "wyzesense2mqtt";

/// One outbound MQTT publish. An empty payload on a retained topic clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Topic layout under the gateway and Home Assistant roots.
#[derive(Debug, Clone)]
pub struct Topics {
    pub self_root: String,
    pub hass_root: String,
}

impl Topics {
    pub fn new(self_root: impl Into<String>, hass_root: impl Into<String>) -> Self {
        Self {
            self_root: self_root.into(),
            hass_root: hass_root.into(),
        }
    }

    pub fn state(&self, mac: &Mac) -> String {
        format!("{}/{mac}", self.self_root)
    }

    pub fn availability(&self, mac: &Mac) -> String {
        format!("{}/{mac}/status", self.self_root)
    }

    pub fn pin_entered(&self, mac: &Mac) -> String {
        format!("{}/{mac}/pin_entered", self.self_root)
    }

    pub fn set(&self, mac: &Mac) -> String {
        format!("{}/{mac}/set", self.self_root)
    }

    pub fn gateway_status(&self) -> String {
        format!("{}/status", self.self_root)
    }

    pub fn ack(&self) -> String {
        format!("{}/ack", self.self_root)
    }

    pub fn scan(&self) -> String {
        format!("{}/scan", self.self_root)
    }

    pub fn remove(&self) -> String {
        format!("{}/remove", self.self_root)
    }

    pub fn reload(&self) -> String {
        format!("{}/reload", self.self_root)
    }

    pub fn bridge_request(&self) -> String {
        format!("{}/bridge/request", self.self_root)
    }

    pub fn bridge_reply(&self) -> String {
        format!("{}/bridge/reply", self.self_root)
    }

    pub fn bridge_event(&self) -> String {
        format!("{}/bridge/event", self.self_root)
    }

    /// `<hass_root>/<component>/wyzesense_<MAC>/<object_id>/config`
    pub fn discovery(&self, component: &str, mac: &Mac, object_id: &str) -> String {
        format!("{}/{component}/wyzesense_{mac}/{object_id}/config", self.hass_root)
    }

    /// Command topics the gateway subscribes to.
    pub fn command_filters(&self) -> Vec<String> {
        let root = &self.self_root;
        vec![
            self.scan(),
            self.remove(),
            self.reload(),
            format!("{root}/+/set"),
            format!("{root}/+/pin"),
            format!("{root}/+/motion"),
        ]
    }
}

/// Live values of an entity, published as JSON on its state topic. The
/// gateway keeps one per entity and republishes it whole, so every field a
/// discovery `value_template` reads is always present once known.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<AlarmState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct StateDoc<'a> {
    mac: &'a Mac,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(flatten)]
    live: &'a LiveState,
}

#[derive(Serialize)]
struct AvailabilityTopic {
    topic: String,
}

#[derive(Serialize)]
struct DeviceBlock<'a> {
    identifiers: [String; 2],
    manufacturer: &'static str,
    model: &'static str,
    name: &'a str,
    sw_version: String,
    via_device: &'static str,
}

/// A discovery document. Field order is fixed, so republishing the same
/// entity is byte-identical.
#[derive(Serialize)]
struct DiscoveryDoc<'a> {
    name: Option<&'static str>,
    unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    state_topic: String,
    value_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_template: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_arm_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_disarm_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    supported_features: Option<[&'static str; 2]>,
    availability: [AvailabilityTopic; 2],
    availability_mode: &'static str,
    device: DeviceBlock<'a>,
    platform: &'static str,
}

/// `{now, op: "CMD_ACK", success, src, error?}` on `<root>/ack`.
#[derive(Serialize)]
struct CmdAck<'a> {
    now: u64,
    op: &'static str,
    success: bool,
    src: AckSource<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct AckSource<'a> {
    topic: &'a str,
    payload: &'a str,
}

const ALARM_COMMAND_TEMPLATE: &str = r#"{"action": "{{ action }}", "pin": "{{ code }}"}"#;

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Turns registry entries and live state into MQTT messages on the outbound
/// queue. Publishing never blocks; the queue is drained in order by a single
/// task, so messages for one entity reach the broker in the order produced.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<MqttMessage>,
    topics: Topics,
    hass_discovery: bool,
    retain_state: bool,
}

impl Publisher {
    pub fn new(
        tx: mpsc::UnboundedSender<MqttMessage>,
        topics: Topics,
        hass_discovery: bool,
        retain_state: bool,
    ) -> Self {
        Self {
            tx,
            topics,
            hass_discovery,
            retain_state,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    fn send(&self, topic: String, payload: String, retain: bool) {
        if self.tx.send(MqttMessage { topic, payload, retain }).is_err() {
            error!("Publish queue closed, dropping message");
        }
    }

    fn send_json(&self, topic: String, payload: &impl Serialize, retain: bool) {
        match serde_json::to_string(payload) {
            Ok(json) => self.send(topic, json, retain),
            Err(e) => error!("Failed to serialize MQTT payload: {e}"),
        }
    }

    /// Publish one retained discovery document per exposed capability.
    pub fn publish_discovery(&self, mac: &Mac, entity: &Entity) {
        if !self.hass_discovery {
            return;
        }
        info!("Publishing discovery topics for {mac}");
        let name = entity.display_name(mac);
        for (_, object_id, component) in entity.capabilities().entries() {
            let doc = self.discovery_doc(mac, entity, &name, object_id);
            let topic = self.topics.discovery(component, mac, object_id);
            debug!("  {topic}");
            self.send_json(topic, &doc, true);
        }
    }

    /// Clear every discovery document the entity could have published, along
    /// with its retained state and availability.
    pub fn retract_discovery(&self, mac: &Mac, entity: &Entity) {
        info!("Clearing topics for {mac}");
        self.send(self.topics.availability(mac), String::new(), true);
        self.send(self.topics.state(mac), String::new(), true);
        self.retract_capabilities(mac, entity.all_capabilities());
    }

    /// Clear the discovery documents of `caps` only, e.g. after a reload
    /// turned off `expose_pin`.
    pub fn retract_capabilities(&self, mac: &Mac, caps: Capabilities) {
        if !self.hass_discovery {
            return;
        }
        for (_, object_id, component) in caps.entries() {
            self.send(self.topics.discovery(component, mac, object_id), String::new(), true);
        }
    }

    pub fn publish_state(&self, mac: &Mac, entity: &Entity, live: &LiveState) {
        let device_class = match entity {
            Entity::BinarySensor(s) => Some(s.class.as_str()),
            Entity::Keypad(_) => None,
        };
        let doc = StateDoc {
            mac,
            name: entity.display_name(mac),
            device_class,
            live,
        };
        self.send_json(self.topics.state(mac), &doc, self.retain_state);
    }

    pub fn publish_availability(&self, mac: &Mac, available: bool) {
        let payload = if available { "online" } else { "offline" };
        self.send(self.topics.availability(mac), payload.to_string(), true);
    }

    pub fn publish_gateway_status(&self, online: bool) {
        let payload = if online { "online" } else { "offline" };
        self.send(self.topics.gateway_status(), payload.to_string(), true);
    }

    /// Side channel for a pin typed on a keypad with `expose_pin` set.
    pub fn publish_pin(&self, mac: &Mac, pin: &str) {
        self.send(self.topics.pin_entered(mac), pin.to_string(), false);
    }

    pub fn publish_ack(&self, topic: &str, payload: &str, error: Option<String>) {
        let ack = CmdAck {
            now: now_epoch_ms(),
            op: "CMD_ACK",
            success: error.is_none(),
            src: AckSource { topic, payload },
            error,
        };
        self.send_json(self.topics.ack(), &ack, false);
    }

    fn discovery_doc<'a>(
        &self,
        mac: &Mac,
        entity: &Entity,
        name: &'a str,
        object_id: &str,
    ) -> DiscoveryDoc<'a> {
        let state_topic = self.topics.state(mac);
        let mut doc = DiscoveryDoc {
            name: None,
            unique_id: format!("wyzesense_{mac}_{object_id}"),
            device_class: None,
            state_class: None,
            unit_of_measurement: None,
            entity_category: None,
            payload_on: None,
            payload_off: None,
            state_topic: state_topic.clone(),
            value_template: format!("{{{{ value_json.{object_id} }}}}"),
            json_attributes_topic: None,
            command_topic: None,
            command_template: None,
            code: None,
            code_arm_required: None,
            code_disarm_required: None,
            supported_features: None,
            availability: [
                AvailabilityTopic {
                    topic: self.topics.availability(mac),
                },
                AvailabilityTopic {
                    topic: self.topics.gateway_status(),
                },
            ],
            availability_mode: "all",
            device: DeviceBlock {
                identifiers: [format!("wyzesense_{mac}"), mac.to_string()],
                manufacturer: MANUFACTURER,
                model: entity.model(),
                name,
                sw_version: entity
                    .sw_version()
                    .map_or_else(|| "unknown".to_string(), |v| v.to_string()),
                via_device: VIA_DEVICE,
            },
            platform: "mqtt",
        };

        match (entity, object_id) {
            (Entity::BinarySensor(s), "state") => {
                let (on, off) = s.class.payloads();
                doc.device_class = Some(s.class.as_str());
                doc.payload_on = Some(on);
                doc.payload_off = Some(off);
                doc.json_attributes_topic = Some(state_topic);
            }
            (Entity::Keypad(k), "alarm") => {
                let needs_code = k.arm_required || k.disarm_required;
                doc.json_attributes_topic = Some(state_topic);
                doc.command_topic = Some(self.topics.set(mac));
                doc.command_template = Some(ALARM_COMMAND_TEMPLATE);
                doc.code = needs_code.then_some("REMOTE_CODE");
                doc.code_arm_required = Some(k.arm_required);
                doc.code_disarm_required = Some(k.disarm_required);
                doc.supported_features = Some(["arm_home", "arm_away"]);
            }
            (Entity::Keypad(_), "motion") => {
                doc.name = Some("Motion");
                doc.device_class = Some("motion");
                doc.payload_on = Some("active");
                doc.payload_off = Some("inactive");
            }
            (_, "battery") => {
                doc.name = Some("Battery");
                doc.device_class = Some("battery");
                doc.state_class = Some("measurement");
                doc.unit_of_measurement = Some("%");
                doc.entity_category = Some("diagnostic");
            }
            (_, "signal_strength") => {
                doc.name = Some("Signal Strength");
                doc.device_class = Some("signal_strength");
                doc.state_class = Some("measurement");
                doc.unit_of_measurement = Some("dBm");
                doc.entity_category = Some("diagnostic");
            }
            (Entity::Keypad(_), "pin") => {
                doc.name = Some("Pin");
                doc.state_topic = self.topics.pin_entered(mac);
                doc.value_template = "{{ value }}".to_string();
            }
            _ => {}
        }
        doc
    }
}
