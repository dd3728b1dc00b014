//! IO modules - external system interfaces
//!
//! - `carrier_client` - resilient HTTP client for carrier tracking APIs
//! - `circuit_breaker` - per-client rolling-window circuit breaker
//! - `repository` - tracking persistence (in-memory with JSONL snapshot)
//! - `publisher` - domain event publication (channel, MQTT, in-memory)
//! - `contract_listener` - MQTT subscriber feeding registration
//! - `cache` - last-check TTL cache
//! - `prometheus` - metrics and health HTTP endpoint

pub mod cache;
pub mod carrier_client;
pub mod circuit_breaker;
pub mod contract_listener;
pub mod prometheus;
pub mod publisher;
pub mod repository;

pub use carrier_client::{CarrierClient, CarrierClients, CarrierEndpoint, CarrierError, ResilientCarrierClient};
pub use publisher::{create_publish_channel, EventPublisher, MqttPublisher, OutboundEvent};
pub use repository::{InMemoryTrackingRepository, TrackingRepository};
