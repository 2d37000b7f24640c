// MIT License - Copyright (c) 2026 Peter Wright
// WyzeSense gateway state engine
//
//! # wyzesense-gateway
//!
//! Keeps the authoritative state of WyzeSense contact, motion and leak
//! sensors and keypads paired to a USB bridge, and republishes it as MQTT
//! topics with Home Assistant discovery.
//!
//! The engine is a single serialized event loop ([`Gateway`]) fed by bridge
//! events, MQTT command topics, keypad timers and a periodic availability
//! sweep. Outbound messages are queued as [`MqttMessage`]s for one publisher
//! task to drain.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tokio::sync::mpsc;
//! use wyzesense_gateway::{
//!     Gateway, GatewayOptions, MqttRelayBridge, Publisher, Registry, TomlFile, Topics,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topics = Topics::new("wyzesense2mqtt", "homeassistant");
//!     let (publish_tx, mut publish_rx) = mpsc::unbounded_channel();
//!     let (inbox_tx, inbox_rx) = mpsc::channel(256);
//!
//!     let bridge = Arc::new(MqttRelayBridge::new(
//!         publish_tx.clone(),
//!         topics.bridge_request(),
//!         Duration::from_secs(60),
//!         Duration::from_secs(5),
//!     ));
//!     let publisher = Publisher::new(publish_tx, topics, true, true);
//!     let registry = Registry::load(TomlFile::new("sensors.toml"))?;
//!
//!     let mut gateway = Gateway::new(registry, publisher, bridge, GatewayOptions::default(), inbox_tx);
//!     gateway.start();
//!     tokio::spawn(gateway.run(inbox_rx));
//!
//!     while let Some(msg) = publish_rx.recv().await {
//!         println!("{} {}", msg.topic, msg.payload);
//!     }
//!     Ok(())
//! }
//! ```

pub mod alarm;
pub mod availability;
pub mod bridge;
pub mod command;
pub mod config;
pub mod devices;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod registry;

// Re-exports for convenience
pub use alarm::{AlarmMachine, AlarmState, ArmTarget, PinSource, Transition};
pub use availability::{AvailabilityChange, AvailabilityTracker, SavedState};
pub use bridge::{Bridge, BridgeEvent, MqttRelayBridge, ScanResult, SensorReport};
pub use command::{Command, KeypadAction};
pub use config::Config;
pub use devices::{BinarySensor, Capabilities, Entity, Keypad, KeypadDefaults, Mac, SensorClass, SensorKind};
pub use discovery::{LiveState, MqttMessage, Publisher, Topics};
pub use error::{ErrorKind, GatewayError, Result};
pub use gateway::{CommandSource, Gateway, GatewayEvent, GatewayOptions};
pub use registry::{Registry, RegistryBackend, ReloadDiff, TomlFile};
