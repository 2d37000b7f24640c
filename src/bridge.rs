// MIT License - Copyright (c) 2026 Peter Wright
// USB bridge events and the relay that reaches the bridge over MQTT

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::devices::{Mac, SensorKind};
use crate::discovery::MqttMessage;
use crate::error::{GatewayError, Result};

fn unknown_kind() -> SensorKind {
    SensorKind::Unknown
}

/// A sensor or keypad reported in. Heartbeats carry no `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
    /// Raw MAC as received; validated by the gateway.
    pub mac: String,
    #[serde(default = "unknown_kind")]
    pub kind: SensorKind,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub battery: Option<u8>,
    /// Signal strength magnitude as reported by the radio.
    #[serde(default)]
    pub signal: Option<i32>,
    #[serde(default)]
    pub sw_version: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl SensorReport {
    /// Battery percentage. V2 contact sensors run on a single 1.5V cell and
    /// report half the level of the 3V sensors.
    pub fn battery_percent(&self) -> Option<u8> {
        self.battery.map(|b| {
            let level = if self.kind == SensorKind::SwitchV2 {
                u16::from(b) * 2
            } else {
                u16::from(b)
            };
            level.min(100) as u8
        })
    }

    /// Signal strength in dBm.
    pub fn signal_dbm(&self) -> Option<i32> {
        self.signal.map(|s| -s.abs())
    }
}

/// A sensor paired during a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub mac: String,
    #[serde(default = "unknown_kind")]
    pub kind: SensorKind,
    #[serde(default)]
    pub sw_version: Option<u32>,
}

/// Everything the bridge can tell the gateway unprompted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    SensorReport(SensorReport),
    ScanResult(ScanResult),
    BridgeReady,
}

impl BridgeEvent {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| GatewayError::malformed(topic, e.to_string()))
    }
}

/// Operations the gateway asks of the bridge. Each call may take as long as
/// the bridge needs; callers bound them with their own deadline.
#[async_trait::async_trait]
pub trait Bridge: Send + Sync + 'static {
    /// Put the bridge in pairing mode. Resolves to the sensor paired, if any.
    async fn scan(&self) -> Result<Option<ScanResult>>;

    /// Forget a paired sensor.
    async fn unpair(&self, mac: &Mac) -> Result<()>;
}

#[derive(Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mac: Option<&'a str>,
}

/// `{id, ok, result?, error?}` on `<root>/bridge/reply`.
#[derive(Debug, Deserialize)]
pub struct BridgeReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// [`Bridge`] implementation for a relay process that owns the USB dongle
/// and talks to the gateway over MQTT.
///
/// Requests go out through the shared publish queue; replies are routed back
/// by [`MqttRelayBridge::handle_reply`], called from the MQTT event loop.
pub struct MqttRelayBridge {
    tx: mpsc::UnboundedSender<MqttMessage>,
    request_topic: String,
    /// Map of request ids to their reply senders
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeReply>>>>,
    next_id: AtomicU64,
    scan_timeout: Duration,
    command_timeout: Duration,
}

impl MqttRelayBridge {
    pub fn new(
        tx: mpsc::UnboundedSender<MqttMessage>,
        request_topic: String,
        scan_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            request_topic,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            scan_timeout,
            command_timeout,
        }
    }

    /// Requests still waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Route a reply to the request waiting for it. Replies nobody waits for
    /// (timed out, or from a previous run) are dropped.
    pub async fn handle_reply(&self, payload: &[u8]) -> Result<()> {
        let reply: BridgeReply = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::malformed(&format!("{}/reply", self.request_topic), e.to_string()))?;
        match self.pending.lock().await.remove(&reply.id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("Dropping reply for unknown request {}", reply.id),
        }
        Ok(())
    }

    async fn request(&self, op: &'static str, mac: Option<&Mac>, limit: Duration) -> Result<Option<serde_json::Value>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = BridgeRequest {
            id,
            op,
            mac: mac.map(Mac::as_str),
        };
        let payload = serde_json::to_string(&request).map_err(|e| GatewayError::Serialize(e.to_string()))?;
        debug!("Bridge request {id}: {payload}");
        let sent = self.tx.send(MqttMessage {
            topic: self.request_topic.clone(),
            payload,
            retain: false,
        });
        if sent.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::ChannelClosed);
        }

        match timeout(limit, rx).await {
            Ok(Ok(reply)) if reply.ok => Ok(reply.result),
            Ok(Ok(reply)) => Err(GatewayError::BridgeFailed {
                op: op.to_string(),
                reason: reply.error.unwrap_or_else(|| "unspecified error".to_string()),
            }),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::ChannelClosed)
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!("Bridge request {id} ({op}) timed out after {}s", limit.as_secs());
                Err(GatewayError::BridgeTimeout { op: op.to_string() })
            }
        }
    }
}

#[async_trait::async_trait]
impl Bridge for MqttRelayBridge {
    async fn scan(&self) -> Result<Option<ScanResult>> {
        // The relay itself scans for up to scan_timeout; allow it to reply
        let limit = self.scan_timeout + self.command_timeout;
        match self.request("scan", None, limit).await? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| GatewayError::BridgeFailed {
                    op: "scan".to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    async fn unpair(&self, mac: &Mac) -> Result<()> {
        self.request("unpair", Some(mac), self.command_timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> (Arc<MqttRelayBridge>, mpsc::UnboundedReceiver<MqttMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = MqttRelayBridge::new(
            tx,
            "wyzesense2mqtt/bridge/request".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        (Arc::new(bridge), rx)
    }

    /// Answer the next request with `reply`, echoing its id.
    fn answer(bridge: Arc<MqttRelayBridge>, mut rx: mpsc::UnboundedReceiver<MqttMessage>, reply: serde_json::Value) {
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
            let mut reply = reply;
            reply["id"] = request["id"].clone();
            bridge.handle_reply(reply.to_string().as_bytes()).await.unwrap();
        });
    }

    #[test]
    fn test_parse_bridge_events() {
        let ev = BridgeEvent::parse(
            "wyzesense2mqtt/bridge/event",
            br#"{"event":"sensor_report","mac":"777A4656","kind":"motion","state":"active","battery":95,"signal":55,"sw_version":19,"timestamp":"2026-03-01T12:00:00Z"}"#,
        )
        .unwrap();
        match ev {
            BridgeEvent::SensorReport(report) => {
                assert_eq!(report.kind, SensorKind::Motion);
                assert_eq!(report.state.as_deref(), Some("active"));
                assert_eq!(report.signal_dbm(), Some(-55));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let ev = BridgeEvent::parse("t", br#"{"event":"bridge_ready"}"#).unwrap();
        assert_eq!(ev, BridgeEvent::BridgeReady);

        let ev = BridgeEvent::parse("t", br#"{"event":"scan_result","mac":"777A4656","kind":"doorbell"}"#).unwrap();
        assert!(matches!(ev, BridgeEvent::ScanResult(ScanResult { kind: SensorKind::Unknown, .. })));

        assert!(BridgeEvent::parse("t", b"not json").is_err());
    }

    #[test]
    fn test_battery_normalization() {
        let mut report = SensorReport {
            mac: "777A4656".into(),
            kind: SensorKind::SwitchV2,
            state: None,
            battery: Some(48),
            signal: None,
            sw_version: None,
            timestamp: Utc::now(),
        };
        assert_eq!(report.battery_percent(), Some(96));
        report.battery = Some(60);
        assert_eq!(report.battery_percent(), Some(100));
        report.kind = SensorKind::Switch;
        assert_eq!(report.battery_percent(), Some(60));
    }

    #[tokio::test]
    async fn test_scan_reply_routed() {
        let (bridge, rx) = relay();
        answer(
            Arc::clone(&bridge),
            rx,
            serde_json::json!({"ok": true, "result": {"mac": "777A4656", "kind": "switchv2", "sw_version": 23}}),
        );
        let result = bridge.scan().await.unwrap().unwrap();
        assert_eq!(result.mac, "777A4656");
        assert_eq!(result.kind, SensorKind::SwitchV2);
        assert!(bridge.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_without_new_sensor() {
        let (bridge, rx) = relay();
        answer(Arc::clone(&bridge), rx, serde_json::json!({"ok": true, "result": null}));
        assert!(bridge.scan().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpair_failure_reported() {
        let (bridge, rx) = relay();
        answer(Arc::clone(&bridge), rx, serde_json::json!({"ok": false, "error": "not paired"}));
        let mac = Mac::parse("777A4656").unwrap();
        let err = bridge.unpair(&mac).await.unwrap_err();
        assert!(matches!(err, GatewayError::BridgeFailed { ref reason, .. } if reason == "not paired"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpair_times_out() {
        let (bridge, mut rx) = relay();
        let mac = Mac::parse("777A4656").unwrap();
        let err = bridge.unpair(&mac).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        assert!(bridge.pending.lock().await.is_empty());

        let request: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap().payload).unwrap();
        assert_eq!(request["op"], "unpair");
        assert_eq!(request["mac"], "777A4656");

        // A late reply is dropped quietly
        let late = format!(r#"{{"id":{},"ok":true}}"#, request["id"]);
        bridge.handle_reply(late.as_bytes()).await.unwrap();
    }
}
