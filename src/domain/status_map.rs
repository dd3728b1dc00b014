//! Carrier-native status wording → canonical status
//!
//! The table is plain immutable data, built once at startup and shared behind
//! an `Arc`. Matching is exact on the trimmed string; wording that is not in
//! the table maps to `TrackingStatus::Unknown` rather than being guessed at.

use crate::domain::types::TrackingStatus;
use rustc_hash::{FxHashMap, FxHashSet};

/// Result of classifying one carrier status string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedStatus {
    pub status: TrackingStatus,
    pub delivered: bool,
    pub exception: bool,
}

#[derive(Debug, Clone)]
pub struct StatusMappingTable {
    statuses: FxHashMap<String, TrackingStatus>,
    delivered: FxHashSet<String>,
    exceptions: FxHashSet<String>,
}

impl StatusMappingTable {
    /// Build a table from explicit entries
    pub fn new<S: Into<String>>(
        statuses: impl IntoIterator<Item = (S, TrackingStatus)>,
        delivered: impl IntoIterator<Item = S>,
        exceptions: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            statuses: statuses.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            delivered: delivered.into_iter().map(Into::into).collect(),
            exceptions: exceptions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn classify(&self, carrier_status: &str) -> MappedStatus {
        let key = carrier_status.trim();
        MappedStatus {
            status: self.statuses.get(key).copied().unwrap_or(TrackingStatus::Unknown),
            delivered: self.delivered.contains(key),
            exception: self.exceptions.contains(key),
        }
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl Default for StatusMappingTable {
    fn default() -> Self {
        use TrackingStatus::*;
        Self::new(
            [
                ("Objeto postado", Pending),
                ("Em trânsito", InTransit),
                ("Saiu para entrega", OutForDelivery),
                ("Entregue", Delivered),
                ("Tentativa de entrega", Exception),
                ("Endereço incorreto", Exception),
                ("Destinatário ausente", Exception),
                ("Recusado pelo destinatário", Exception),
                ("Produto avariado", Exception),
                ("Cancelado", Cancelled),
                // Carriers that already speak the canonical vocabulary
                ("posted", Pending),
                ("pending", Pending),
                ("in_transit", InTransit),
                ("out_for_delivery", OutForDelivery),
                ("delivered", Delivered),
                ("Delivered", Delivered),
                ("exception", Exception),
                ("cancelled", Cancelled),
            ],
            ["Entregue", "Delivered", "delivered"],
            [
                "Tentativa de entrega",
                "Endereço incorreto",
                "Destinatário ausente",
                "Recusado pelo destinatário",
                "Produto avariado",
                "exception",
            ],
        )
    }
}
