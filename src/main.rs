// MIT License - Copyright (c) 2026 Peter Wright
// MQTT gateway

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};

use wyzesense_gateway::{
    BridgeEvent, Config, Gateway, GatewayEvent, GatewayOptions, MqttMessage, MqttRelayBridge, Publisher,
    Registry, TomlFile, Topics,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "wyzesense2mqtt")]
#[command(about = "Bridge between WyzeSense sensors and MQTT with Home Assistant discovery")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "WYZESENSE2MQTT_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

// ---------------------------------------------------------------------------
// MQTT plumbing
// ---------------------------------------------------------------------------

fn mqtt_options(config: &Config, topics: &Topics) -> MqttOptions {
    let mqtt = &config.mqtt;
    let mut opts = MqttOptions::new(&mqtt.client_id, &mqtt.host, mqtt.port);
    opts.set_keep_alive(mqtt.keepalive());
    opts.set_clean_session(mqtt.clean_session);
    if let Some(username) = &mqtt.username {
        opts.set_credentials(username, mqtt.password.as_deref().unwrap_or_default());
    }
    opts.set_last_will(LastWill::new(topics.gateway_status(), "offline", QoS::AtLeastOnce, true));
    opts
}

/// Drain the outbound queue in order. On `stop`, flush what is queued and
/// disconnect.
async fn run_publisher(
    client: AsyncClient,
    qos: QoS,
    mut rx: mpsc::UnboundedReceiver<MqttMessage>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => publish(&client, qos, msg).await,
                None => break,
            },
            _ = &mut stop => {
                while let Ok(msg) = rx.try_recv() {
                    publish(&client, qos, msg).await;
                }
                break;
            }
        }
    }
    if let Err(e) = client.disconnect().await {
        warn!("MQTT disconnect failed: {e}");
    }
}

async fn publish(client: &AsyncClient, qos: QoS, msg: MqttMessage) {
    debug!("Publishing {} ({} bytes)", msg.topic, msg.payload.len());
    if let Err(e) = client.publish(&msg.topic, qos, msg.retain, msg.payload).await {
        error!("Failed to publish to {}: {e}", msg.topic);
    }
}

async fn subscribe_all(client: &AsyncClient, filters: &[String], qos: QoS) {
    for filter in filters {
        if let Err(e) = client.subscribe(filter, qos).await {
            error!("Failed to subscribe to {filter}: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=wyzesense_gateway=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).context("Failed to load config file")?;
    config
        .apply_env(std::env::vars())
        .context("Invalid environment override")?;

    let topics = Topics::new(&config.gateway.self_topic_root, &config.gateway.hass_topic_root);
    let qos = config.mqtt.qos();

    let (publish_tx, publish_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox_rx) = mpsc::channel(256);

    let bridge = Arc::new(MqttRelayBridge::new(
        publish_tx.clone(),
        topics.bridge_request(),
        config.bridge.scan_timeout(),
        config.bridge.command_timeout(),
    ));
    let publisher = Publisher::new(
        publish_tx.clone(),
        topics.clone(),
        config.gateway.hass_discovery,
        config.mqtt.retain,
    );

    let registry = Registry::load(TomlFile::new(&config.gateway.sensors_file))
        .with_context(|| format!("Failed to load {}", config.gateway.sensors_file.display()))?;

    let mut gateway = Gateway::new(
        registry,
        publisher.clone(),
        Arc::clone(&bridge),
        GatewayOptions::from_config(&config),
        inbox_tx.clone(),
    );
    gateway.start();
    let sweep_interval = gateway.sweep_interval();

    info!(
        "Connecting to MQTT broker at {}:{}",
        config.mqtt.host, config.mqtt.port
    );
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config, &topics), 256);

    // Task 1: outbound publisher
    let (stop_tx, stop_rx) = oneshot::channel();
    let publisher_handle = tokio::spawn(run_publisher(client.clone(), qos, publish_rx, stop_rx));

    // Task 2: MQTT event loop (receives commands, bridge replies and events)
    let mut filters = topics.command_filters();
    filters.push(topics.bridge_reply());
    filters.push(topics.bridge_event());
    let reply_topic = topics.bridge_reply();
    let event_topic = topics.bridge_event();
    let client_sub = client.clone();
    let bridge_replies = Arc::clone(&bridge);
    let inbox_mqtt = inbox_tx.clone();
    let publisher_status = publisher.clone();
    let mqtt_handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // rumqttc does not resubscribe after a reconnect
                    info!("MQTT: connected, subscribing to {} topics", filters.len());
                    subscribe_all(&client_sub, &filters, qos).await;
                    publisher_status.publish_gateway_status(true);
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    if msg.topic == reply_topic {
                        if let Err(e) = bridge_replies.handle_reply(&msg.payload).await {
                            warn!("Bad bridge reply: {e}");
                        }
                        continue;
                    }
                    let event = if msg.topic == event_topic {
                        match BridgeEvent::parse(&msg.topic, &msg.payload) {
                            Ok(ev) => GatewayEvent::Bridge(ev),
                            Err(e) => {
                                warn!("Bad bridge event: {e}");
                                continue;
                            }
                        }
                    } else {
                        GatewayEvent::Mqtt {
                            topic: msg.topic.clone(),
                            payload: msg.payload.to_vec(),
                        }
                    };
                    if inbox_mqtt.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT: disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Task 3: availability sweep
    let inbox_sweep = inbox_tx.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        // Skip the first immediate tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if inbox_sweep.send(GatewayEvent::Sweep { now: Utc::now() }).await.is_err() {
                break;
            }
        }
    });
    info!("Availability sweep every {}s", sweep_interval.as_secs());

    // Task 4: the gateway itself
    let gateway_handle = tokio::spawn(gateway.run(inbox_rx));

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    info!("Gateway running. Send SIGHUP to reload sensors, SIGINT/SIGTERM to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading sensors...");
                if inbox_tx.send(GatewayEvent::Reload).await.is_err() {
                    break;
                }
            }
        }
    }

    // Let the gateway save state and publish offline before the queue is flushed
    sweep_handle.abort();
    if inbox_tx.send(GatewayEvent::Shutdown).await.is_ok()
        && let Err(e) = gateway_handle.await
    {
        error!("Gateway task failed: {e}");
    }
    let _ = stop_tx.send(());
    if let Err(e) = publisher_handle.await {
        error!("Publisher task failed: {e}");
    }
    if timeout(Duration::from_secs(5), mqtt_handle).await.is_err() {
        warn!("MQTT event loop did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}
