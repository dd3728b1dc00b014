//! Shared value types for the tracking domain

use crate::domain::error::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

/// 2 letters + 11 digits + 2 letters (e.g. `AB12345678901CD`)
static ELEVEN_DIGIT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}\d{11}[A-Z]{2}$").expect("valid regex"));

/// 2 letters + 9 digits + 2 letters (postal format, e.g. `AB123456789BR`)
static NINE_DIGIT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}\d{9}[A-Z]{2}$").expect("valid regex"));

/// Supported carriers. The set is closed: adding a carrier means adding a
/// variant, its code pattern, and its client configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Carrier {
    Carriers,
    Correios,
    Acme,
}

impl Carrier {
    pub const ALL: [Carrier; 3] = [Carrier::Carriers, Carrier::Correios, Carrier::Acme];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Carriers => "Carriers",
            Carrier::Correios => "Correios",
            Carrier::Acme => "Acme",
        }
    }

    /// Tracking code format accepted by this carrier
    fn pattern(&self) -> &'static Regex {
        match self {
            Carrier::Carriers | Carrier::Acme => &ELEVEN_DIGIT_PATTERN,
            Carrier::Correios => &NINE_DIGIT_PATTERN,
        }
    }

    /// Check an already-normalized code against this carrier's format
    pub fn accepts(&self, code: &str) -> bool {
        self.pattern().is_match(code)
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Carrier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Carrier::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnsupportedCarrier(s.to_string()))
    }
}

/// Carrier-scoped tracking code (natural key of the aggregate)
///
/// Always stored trimmed and upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingCodeValue(String);

impl TrackingCodeValue {
    /// Normalize and validate against any known carrier format.
    ///
    /// Used to reject garbage before any I/O, when the carrier is not yet known.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let code = normalize(raw);
        if Carrier::ALL.iter().any(|c| c.accepts(&code)) {
            Ok(Self(code))
        } else {
            Err(ValidationError::InvalidFormat { code, carrier: None })
        }
    }

    /// Normalize and validate against a specific carrier's format
    pub fn parse_for(raw: &str, carrier: Carrier) -> Result<Self, ValidationError> {
        let code = normalize(raw);
        if carrier.accepts(&code) {
            Ok(Self(code))
        } else {
            Err(ValidationError::InvalidFormat { code, carrier: Some(carrier) })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackingCodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Opaque aggregate identity (UUIDv7, time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingCodeId(pub Uuid);

impl TrackingCodeId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TrackingCodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical shipment status, independent of carrier wording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    InTransit,
    OutForDelivery,
    Delivered,
    Exception,
    Cancelled,
    Unknown,
}

impl TrackingStatus {
    pub const ALL: [TrackingStatus; 7] = [
        TrackingStatus::Pending,
        TrackingStatus::InTransit,
        TrackingStatus::OutForDelivery,
        TrackingStatus::Delivered,
        TrackingStatus::Exception,
        TrackingStatus::Cancelled,
        TrackingStatus::Unknown,
    ];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::InTransit => "in_transit",
            TrackingStatus::OutForDelivery => "out_for_delivery",
            TrackingStatus::Delivered => "delivered",
            TrackingStatus::Exception => "exception",
            TrackingStatus::Cancelled => "cancelled",
            TrackingStatus::Unknown => "unknown",
        }
    }

    /// Shipment lifecycle is over; polling only continues to catch revivals
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackingStatus::Delivered | TrackingStatus::Cancelled)
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_string()))
    }
}
