//! Domain validation errors

use crate::domain::types::Carrier;
use thiserror::Error;

/// Rejections raised before any I/O takes place
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Code does not match the carrier's pattern (or any pattern when the
    /// carrier is not known yet)
    #[error("invalid tracking code format: {code}{}", carrier_suffix(.carrier))]
    InvalidFormat { code: String, carrier: Option<Carrier> },

    #[error("unsupported carrier: {0}")]
    UnsupportedCarrier(String),

    #[error("unknown tracking status: {0}")]
    UnknownStatus(String),

    /// A stored record violates an aggregate invariant
    #[error("invalid tracking record: {0}")]
    InvalidRecord(String),
}

fn carrier_suffix(carrier: &Option<Carrier>) -> String {
    carrier.map(|c| format!(" for carrier {c}")).unwrap_or_default()
}
