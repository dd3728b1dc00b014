//! Resilient carrier client
//!
//! `ResilientCarrierClient` wraps a raw `CarrierTransport` (normally the
//! reqwest-based `HttpTransport`) with:
//! - a per-client circuit breaker; rejected calls never reach the transport
//! - a fixed per-call timeout surfaced as `CarrierError::Timeout`
//! - typed error classification (`CarrierErrorKind`)
//!
//! Health checks bypass the breaker and carry no credentials.

use crate::domain::types::{Carrier, TrackingCodeValue};
use crate::infra::metrics::Metrics;
use crate::io::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const USER_AGENT_VALUE: &str = concat!("tracking-reconciler/", env!("CARGO_PKG_VERSION"));
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure classes reported by a carrier call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarrierErrorKind {
    NotFound,
    RateLimited,
    Timeout,
    ServerError,
    CircuitOpen,
    Transport,
    MalformedResponse,
}

impl CarrierErrorKind {
    pub const COUNT: usize = 7;

    pub const ALL: [CarrierErrorKind; Self::COUNT] = [
        CarrierErrorKind::NotFound,
        CarrierErrorKind::RateLimited,
        CarrierErrorKind::Timeout,
        CarrierErrorKind::ServerError,
        CarrierErrorKind::CircuitOpen,
        CarrierErrorKind::Transport,
        CarrierErrorKind::MalformedResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierErrorKind::NotFound => "not_found",
            CarrierErrorKind::RateLimited => "rate_limited",
            CarrierErrorKind::Timeout => "timeout",
            CarrierErrorKind::ServerError => "server_error",
            CarrierErrorKind::CircuitOpen => "circuit_open",
            CarrierErrorKind::Transport => "transport",
            CarrierErrorKind::MalformedResponse => "malformed_response",
        }
    }

    /// Position in `ALL`, used to index per-kind counters
    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CarrierError {
    #[error("shipment not found at carrier")]
    NotFound,

    #[error("rate limited by carrier")]
    RateLimited,

    #[error("carrier request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("carrier server error: HTTP {0}")]
    ServerError(u16),

    #[error("circuit open, call rejected locally")]
    CircuitOpen,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed carrier response: {0}")]
    MalformedResponse(String),
}

impl CarrierError {
    pub fn kind(&self) -> CarrierErrorKind {
        match self {
            CarrierError::NotFound => CarrierErrorKind::NotFound,
            CarrierError::RateLimited => CarrierErrorKind::RateLimited,
            CarrierError::Timeout(_) => CarrierErrorKind::Timeout,
            CarrierError::ServerError(_) => CarrierErrorKind::ServerError,
            CarrierError::CircuitOpen => CarrierErrorKind::CircuitOpen,
            CarrierError::Transport(_) => CarrierErrorKind::Transport,
            CarrierError::MalformedResponse(_) => CarrierErrorKind::MalformedResponse,
        }
    }

    /// Whether this outcome says the carrier is unhealthy.
    ///
    /// A 404 is a valid answer from a healthy carrier.
    fn trips_breaker(&self) -> bool {
        !matches!(self, CarrierError::NotFound | CarrierError::CircuitOpen)
    }
}

/// One event exactly as the carrier reported it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarrierEvent {
    pub timestamp: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub raw: Value,
}

/// Event as it appears on the wire. Carriers name the time `timestamp` or
/// `date`; when both are present `timestamp` wins.
#[derive(Deserialize)]
struct WireEvent {
    timestamp: Option<DateTime<Utc>>,
    date: Option<DateTime<Utc>>,
    status: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    description: String,
}

impl CarrierEvent {
    pub fn new(timestamp: DateTime<Utc>, status: &str) -> Self {
        Self {
            timestamp,
            status: status.to_string(),
            location: String::new(),
            description: String::new(),
            raw: Value::Null,
        }
    }
}

/// Extract events from a carrier body.
///
/// Accepts both `{ "success": true, "data": { "events": [...] } }` and a bare
/// `{ "events": [...] }`. A missing or non-array `events` field is rejected.
pub fn parse_tracking_response(body: &str) -> Result<Vec<CarrierEvent>, CarrierError> {
    let root: Value =
        serde_json::from_str(body).map_err(|e| CarrierError::MalformedResponse(e.to_string()))?;

    let payload = match (root.get("success"), root.get("data")) {
        (Some(Value::Bool(true)), Some(data)) if data.is_object() => data,
        _ => &root,
    };

    let events = match payload.get("events") {
        Some(Value::Array(events)) => events,
        Some(_) => return Err(CarrierError::MalformedResponse("events is not an array".into())),
        None => return Err(CarrierError::MalformedResponse("events field missing".into())),
    };

    events
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let wire: WireEvent = serde_json::from_value(raw.clone())
                .map_err(|e| CarrierError::MalformedResponse(format!("event {i}: {e}")))?;
            let timestamp = wire
                .timestamp
                .or(wire.date)
                .ok_or_else(|| CarrierError::MalformedResponse(format!("event {i}: missing timestamp")))?;
            Ok(CarrierEvent {
                timestamp,
                status: wire.status,
                location: wire.location,
                description: wire.description,
                raw: raw.clone(),
            })
        })
        .collect()
}

/// Raw access to one carrier, without resilience
#[async_trait]
pub trait CarrierTransport: Send + Sync {
    async fn get_tracking(&self, code: &TrackingCodeValue) -> Result<Vec<CarrierEvent>, CarrierError>;

    async fn health(&self) -> bool;
}

/// What the reconciliation engine talks to
#[async_trait]
pub trait CarrierClient: Send + Sync {
    fn carrier(&self) -> Carrier;

    async fn fetch_events(&self, code: &TrackingCodeValue) -> Result<Vec<CarrierEvent>, CarrierError>;

    /// Readiness probe, independent of the circuit breaker
    async fn health_check(&self) -> bool;
}

/// Connection settings for one carrier HTTP API
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CarrierEndpoint {
    pub name: Carrier,
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tracking_path")]
    pub tracking_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Parallel reconciliations allowed against this carrier per tick
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_tracking_path() -> String {
    "/client/Carriers/Tracking/{code}".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl CarrierEndpoint {
    pub fn new(name: Carrier, base_url: &str, token: &str) -> Self {
        Self {
            name,
            base_url: base_url.to_string(),
            token: token.to_string(),
            timeout_ms: default_timeout_ms(),
            tracking_path: default_tracking_path(),
            health_path: default_health_path(),
            max_concurrency: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn tracking_url(&self, code: &TrackingCodeValue) -> String {
        self.url(&self.tracking_path.replace("{code}", code.as_str()))
    }

    pub fn health_url(&self) -> String {
        self.url(&self.health_path)
    }
}

/// reqwest transport with bearer authentication
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: CarrierEndpoint,
}

impl HttpTransport {
    pub fn new(endpoint: CarrierEndpoint) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(endpoint.timeout()).build()?;
        Ok(Self { http, endpoint })
    }

    fn classify_status(status: StatusCode) -> CarrierError {
        match status {
            StatusCode::NOT_FOUND => CarrierError::NotFound,
            StatusCode::TOO_MANY_REQUESTS => CarrierError::RateLimited,
            s if s.is_server_error() => CarrierError::ServerError(s.as_u16()),
            s => CarrierError::Transport(format!("unexpected HTTP status {}", s.as_u16())),
        }
    }

    fn classify_reqwest(&self, e: reqwest::Error) -> CarrierError {
        if e.is_timeout() {
            CarrierError::Timeout(self.endpoint.timeout())
        } else {
            CarrierError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl CarrierTransport for HttpTransport {
    async fn get_tracking(&self, code: &TrackingCodeValue) -> Result<Vec<CarrierEvent>, CarrierError> {
        let url = self.endpoint.tracking_url(code);
        debug!(carrier = %self.endpoint.name, url = %url, "carrier_request");

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.endpoint.token))
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .send()
            .await
            .map_err(|e| self.classify_reqwest(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status));
        }

        let body = response.text().await.map_err(|e| self.classify_reqwest(e))?;
        parse_tracking_response(&body)
    }

    async fn health(&self) -> bool {
        let result = self
            .http
            .get(self.endpoint.health_url())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                warn!(carrier = %self.endpoint.name, error = %e, "carrier_health_check_failed");
                false
            }
        }
    }
}

pub struct ResilientCarrierClient<T = HttpTransport> {
    carrier: Carrier,
    transport: T,
    breaker: CircuitBreaker,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl ResilientCarrierClient<HttpTransport> {
    /// HTTP client for a configured endpoint
    pub fn from_endpoint(
        endpoint: CarrierEndpoint,
        breaker: &CircuitBreakerConfig,
        metrics: Arc<Metrics>,
    ) -> reqwest::Result<Self> {
        let carrier = endpoint.name;
        let timeout = endpoint.timeout();
        Ok(Self::new(carrier, HttpTransport::new(endpoint)?, breaker, timeout, metrics))
    }
}

impl<T: CarrierTransport> ResilientCarrierClient<T> {
    pub fn new(
        carrier: Carrier,
        transport: T,
        breaker: &CircuitBreakerConfig,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            carrier,
            transport,
            breaker: CircuitBreaker::new(carrier.as_str(), breaker),
            timeout,
            metrics,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: CarrierTransport> CarrierClient for ResilientCarrierClient<T> {
    fn carrier(&self) -> Carrier {
        self.carrier
    }

    async fn fetch_events(&self, code: &TrackingCodeValue) -> Result<Vec<CarrierEvent>, CarrierError> {
        let Some(permit) = self.breaker.try_acquire() else {
            self.metrics.record_carrier_error(CarrierErrorKind::CircuitOpen);
            return Err(CarrierError::CircuitOpen);
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.transport.get_tracking(code)).await {
            Ok(result) => result,
            Err(_) => Err(CarrierError::Timeout(self.timeout)),
        };
        self.metrics.record_carrier_latency(started.elapsed().as_millis() as u64);

        match result {
            Ok(events) => {
                permit.success();
                debug!(carrier = %self.carrier, code = %code, event_count = %events.len(), "carrier_response");
                Ok(events)
            }
            Err(e) => {
                if e.trips_breaker() {
                    permit.failure();
                } else {
                    permit.success();
                }
                self.metrics.record_carrier_error(e.kind());
                Err(e)
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.transport.health().await
    }
}

/// Clients keyed by carrier, built once at startup
#[derive(Clone, Default)]
pub struct CarrierClients {
    clients: FxHashMap<Carrier, Arc<dyn CarrierClient>>,
}

impl CarrierClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: Arc<dyn CarrierClient>) {
        self.clients.insert(client.carrier(), client);
    }

    pub fn with(mut self, client: Arc<dyn CarrierClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn get(&self, carrier: Carrier) -> Option<&Arc<dyn CarrierClient>> {
        self.clients.get(&carrier)
    }

    pub fn carriers(&self) -> Vec<Carrier> {
        let mut carriers: Vec<Carrier> = self.clients.keys().copied().collect();
        carriers.sort();
        carriers
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Run every client's health check, sorted by carrier
    pub async fn health(&self) -> Vec<(Carrier, bool)> {
        let mut report = Vec::with_capacity(self.clients.len());
        for carrier in self.carriers() {
            if let Some(client) = self.clients.get(&carrier) {
                report.push((carrier, client.health_check().await));
            }
        }
        report
    }
}
