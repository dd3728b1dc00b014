//! Domain event publication
//!
//! Use cases hand `OutboundEvent` envelopes to an `EventPublisher`:
//! - `ChannelEventPublisher` enqueues on a bounded mpsc channel without
//!   blocking; a full channel is reported as `PublishError::QueueFull`
//! - `MqttPublisher` is the actor draining that channel to the broker
//!   (QoS 1, topic `{prefix}/{event_type}`)
//! - `InMemoryEventPublisher` records envelopes for tests
//! - `LogEventPublisher` only logs, for runs without a broker
//!
//! Delivery is at-least-once; `aggregate_id` is the downstream partition and
//! idempotency key.

use crate::infra::config::Config;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub const EVENT_STATUS_UPDATED: &str = "tracking.status.updated";
pub const EVENT_NEW: &str = "tracking.event.new";
pub const EVENT_DELIVERED: &str = "tracking.delivered";
pub const EVENT_ADDED: &str = "tracking.added";
pub const EVENT_REACTIVATED: &str = "tracking.reactivated";

const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub event_type: String,
    pub aggregate_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

impl OutboundEvent {
    pub fn new(event_type: &str, aggregate_id: &str, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            data,
            timestamp,
            version: ENVELOPE_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish queue full, event {0} dropped")]
    QueueFull(String),

    #[error("publisher closed")]
    Closed,

    #[error("broker rejected publish: {0}")]
    Broker(String),

    #[error("event encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError>;
}

/// Non-blocking handle onto the publish queue. Clone freely.
#[derive(Clone)]
pub struct ChannelEventPublisher {
    tx: mpsc::Sender<OutboundEvent>,
}

/// Create a publish channel pair.
///
/// The receiver is meant for `MqttPublisher::run`.
pub fn create_publish_channel(buffer_size: usize) -> (ChannelEventPublisher, mpsc::Receiver<OutboundEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ChannelEventPublisher { tx }, rx)
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => Err(PublishError::QueueFull(event.event_type)),
            Err(TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }
}

/// Records everything it is given
#[derive(Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<OutboundEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<OutboundEvent> {
        self.events.lock().iter().filter(|e| e.event_type == event_type).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError> {
        debug!(event_type = %event.event_type, aggregate_id = %event.aggregate_id, "event_recorded");
        self.events.lock().push(event);
        Ok(())
    }
}

/// Logs every envelope and drops it
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError> {
        info!(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            data = %event.data,
            "event_published_to_log"
        );
        Ok(())
    }
}

/// MQTT publisher actor
///
/// Receives envelopes from the publish channel and publishes them to the broker.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<OutboundEvent>,
    topic_prefix: String,
}

impl MqttPublisher {
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<OutboundEvent>) -> Self {
        let client_id = format!("{}-publisher-{}", config.mqtt_client_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_publisher_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_publisher_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_publisher_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.mqtt_topic_prefix().to_string() }
    }

    /// Runs until shutdown, then drains whatever is still queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic_prefix = %self.topic_prefix, "mqtt_publisher_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let mut drained = 0usize;
                        while let Ok(event) = self.rx.try_recv() {
                            self.publish_event(event).await;
                            drained += 1;
                        }
                        info!(drained = %drained, "mqtt_publisher_shutdown");
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(event) => self.publish_event(event).await,
                        None => {
                            info!("mqtt_publisher_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn publish_event(&self, event: OutboundEvent) {
        let topic = topic_for(&self.topic_prefix, &event.event_type);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_type = %event.event_type, error = %e, "mqtt_publish_encode_failed");
                return;
            }
        };

        // QoS 1: at-least-once
        if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            error!(topic = %topic, aggregate_id = %event.aggregate_id, error = %e, "mqtt_publish_failed");
        }
    }
}

pub fn topic_for(prefix: &str, event_type: &str) -> String {
    if prefix.is_empty() {
        event_type.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), event_type)
    }
}
