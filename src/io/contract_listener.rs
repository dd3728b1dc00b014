//! MQTT subscriber for `contract.created` messages
//!
//! The eventloop only parses and enqueues (try_send, never blocks); a
//! separate worker drains the queue into the registration use case.

use crate::domain::error::ValidationError;
use crate::domain::tracking::TrackingMetadata;
use crate::domain::types::{Carrier, TrackingCodeValue};
use crate::infra::config::Config;
use crate::services::registration::RegistrationService;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub const CONTRACT_CREATED: &str = "contract.created";

/// A validated request to start tracking a shipment
#[derive(Debug, Clone, PartialEq)]
pub struct ContractMessage {
    pub code: TrackingCodeValue,
    pub carrier: Carrier,
    pub metadata: TrackingMetadata,
}

#[derive(Debug, Error)]
pub enum ContractParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ignored event type {0}")]
    IgnoredEventType(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    event_type: String,
    #[serde(default)]
    data: Option<ContractData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractData {
    tracking_code: Option<String>,
    carrier: Option<String>,
    contract_id: Option<String>,
    customer_id: Option<String>,
    origin: Option<String>,
    destination: Option<String>,
}

/// Parse one broker payload.
///
/// Other event types on the topic come back as `IgnoredEventType`.
pub fn parse_contract_message(payload: &str) -> Result<ContractMessage, ContractParseError> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    if envelope.event_type != CONTRACT_CREATED {
        return Err(ContractParseError::IgnoredEventType(envelope.event_type));
    }

    let data = envelope.data.ok_or(ContractParseError::MissingField("data"))?;
    let raw_code = data
        .tracking_code
        .filter(|c| !c.trim().is_empty())
        .ok_or(ContractParseError::MissingField("trackingCode"))?;
    let carrier: Carrier = data
        .carrier
        .filter(|c| !c.trim().is_empty())
        .ok_or(ContractParseError::MissingField("carrier"))?
        .parse()?;
    let code = TrackingCodeValue::parse_for(&raw_code, carrier)?;

    Ok(ContractMessage {
        code,
        carrier,
        metadata: TrackingMetadata {
            customer_id: data.customer_id,
            contract_id: data.contract_id,
            origin: data.origin,
            destination: data.destination,
            ..TrackingMetadata::default()
        },
    })
}

/// Subscribe to the contract topic and enqueue valid messages until shutdown
pub async fn start_contract_listener(
    config: &Config,
    tx: mpsc::Sender<ContractMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("{}-contracts-{}", config.mqtt_client_id(), std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_contract_topic(), QoS::AtLeastOnce).await?;

    info!(
        topic = %config.mqtt_contract_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "contract_listener_subscribed"
    );

    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("contract_listener_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                            warn!(topic = %publish.topic, "contract_message_not_utf8");
                            continue;
                        };
                        match parse_contract_message(payload) {
                            Ok(message) => match tx.try_send(message) {
                                Ok(()) => {}
                                Err(TrySendError::Full(message)) => {
                                    // Rate-limit drop warnings to 1 per second
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!(code = %message.code, "contract_message_dropped");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                Err(TrySendError::Closed(_)) => {
                                    info!("contract_channel_closed");
                                    return Ok(());
                                }
                            },
                            Err(ContractParseError::IgnoredEventType(event_type)) => {
                                debug!(event_type = %event_type, "contract_message_ignored");
                            }
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "contract_message_invalid");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("contract_listener_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "contract_listener_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Drain the contract queue into the registration use case
pub async fn run_contract_worker(mut rx: mpsc::Receiver<ContractMessage>, registration: Arc<RegistrationService>) {
    while let Some(message) = rx.recv().await {
        match registration.register(message.code.as_str(), message.carrier, message.metadata).await {
            Ok((tracking, outcome)) => {
                debug!(code = %tracking.code(), outcome = %outcome.as_str(), "contract_registered");
            }
            Err(e) => {
                error!(code = %message.code, carrier = %message.carrier, error = %e, "contract_register_failed");
            }
        }
    }
    info!("contract_worker_stopped");
}
