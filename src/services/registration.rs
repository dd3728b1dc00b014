//! Registration use case: start tracking a code, or bring an inactive one back.

use crate::domain::error::ValidationError;
use crate::domain::interval::IntervalStrategy;
use crate::domain::tracking::{TrackingCode, TrackingMetadata};
use crate::domain::types::{Carrier, TrackingCodeValue};
use crate::infra::metrics::Metrics;
use crate::io::publisher::{EventPublisher, OutboundEvent, EVENT_ADDED, EVENT_REACTIVATED};
use crate::io::repository::{RepositoryError, TrackingRepository};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    AlreadyActive,
    Reactivated,
}

impl Registration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Registration::Created => "created",
            Registration::AlreadyActive => "already_active",
            Registration::Reactivated => "reactivated",
        }
    }
}

pub struct RegistrationService {
    repository: Arc<dyn TrackingRepository>,
    publisher: Arc<dyn EventPublisher>,
    strategy: Arc<IntervalStrategy>,
    metrics: Arc<Metrics>,
}

impl RegistrationService {
    pub fn new(
        repository: Arc<dyn TrackingRepository>,
        publisher: Arc<dyn EventPublisher>,
        strategy: Arc<IntervalStrategy>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { repository, publisher, strategy, metrics }
    }

    /// Register `code` for `carrier`.
    ///
    /// An active code is returned untouched; `metadata` only applies to new codes.
    pub async fn register(
        &self,
        code: &str,
        carrier: Carrier,
        metadata: TrackingMetadata,
    ) -> Result<(TrackingCode, Registration), RegisterError> {
        let value = TrackingCodeValue::parse_for(code, carrier)?;
        let now = Utc::now();

        match self.repository.find_by_code(&value).await? {
            Some(existing) if existing.is_active() => {
                debug!(code = %value, "tracking_already_active");
                Ok((existing, Registration::AlreadyActive))
            }
            Some(mut existing) => {
                existing.reactivate(now, &self.strategy);
                self.repository.upsert(&existing).await?;
                self.metrics.record_reactivated();
                info!(code = %value, carrier = %existing.carrier(), id = %existing.id(), "tracking_reactivated");

                let data = json!({
                    "trackingCodeId": existing.id().to_string(),
                    "trackingCode": value.as_str(),
                    "carrier": existing.carrier().as_str(),
                    "reactivatedAt": now,
                });
                self.publish(EVENT_REACTIVATED, &existing, data).await;
                Ok((existing, Registration::Reactivated))
            }
            None => {
                let tracking = TrackingCode::create(value.as_str(), carrier, metadata, now, &self.strategy)?;
                self.repository.upsert(&tracking).await?;
                self.metrics.record_registered();
                info!(code = %value, carrier = %carrier, id = %tracking.id(), "tracking_registered");

                let data = json!({
                    "trackingCodeId": tracking.id().to_string(),
                    "trackingCode": value.as_str(),
                    "carrier": carrier.as_str(),
                    "customerId": tracking.metadata().customer_id,
                    "contractId": tracking.metadata().contract_id,
                    "origin": tracking.metadata().origin,
                    "destination": tracking.metadata().destination,
                    "nextCheckAt": tracking.next_check_at(),
                });
                self.publish(EVENT_ADDED, &tracking, data).await;
                Ok((tracking, Registration::Created))
            }
        }
    }

    async fn publish(&self, event_type: &str, tracking: &TrackingCode, data: serde_json::Value) {
        let event = OutboundEvent::new(event_type, &tracking.id().to_string(), data, Utc::now());
        match self.publisher.publish(event).await {
            Ok(()) => self.metrics.record_published(),
            Err(e) => {
                self.metrics.record_publish_failed();
                error!(code = %tracking.code(), event_type = %event_type, error = %e, "event_publish_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::publisher::InMemoryEventPublisher;
    use crate::io::repository::InMemoryTrackingRepository;

    fn service() -> (RegistrationService, Arc<InMemoryTrackingRepository>, Arc<InMemoryEventPublisher>) {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let service = RegistrationService::new(
            repo.clone(),
            publisher.clone(),
            Arc::new(IntervalStrategy::default()),
            Arc::new(Metrics::new()),
        );
        (service, repo, publisher)
    }

    #[tokio::test]
    async fn test_register_new_code() {
        let (service, repo, publisher) = service();
        let metadata = TrackingMetadata { contract_id: Some("C-1".into()), ..TrackingMetadata::default() };

        let (tracking, outcome) = service.register(" ab12345678901cd ", Carrier::Acme, metadata).await.unwrap();
        assert_eq!(outcome, Registration::Created);
        assert_eq!(tracking.code().as_str(), "AB12345678901CD");
        assert_eq!(repo.len(), 1);

        let added = publisher.of_type(EVENT_ADDED);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].aggregate_id, tracking.id().to_string());
        assert_eq!(added[0].data["contractId"], "C-1");
    }

    #[tokio::test]
    async fn test_register_active_code_is_noop() {
        let (service, _repo, publisher) = service();
        let (first, _) = service.register("AB12345678901CD", Carrier::Acme, TrackingMetadata::default()).await.unwrap();
        publisher.clear();

        let (second, outcome) =
            service.register("AB12345678901CD", Carrier::Acme, TrackingMetadata::default()).await.unwrap();
        assert_eq!(outcome, Registration::AlreadyActive);
        assert_eq!(second.id(), first.id());
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_register_inactive_code_reactivates() {
        let (service, repo, publisher) = service();
        let tracking = TrackingCode::create(
            "AB12345678901CD",
            Carrier::Acme,
            TrackingMetadata::default(),
            Utc::now(),
            &IntervalStrategy::default(),
        )
        .unwrap();
        let mut record = tracking.to_record();
        record.active = false;
        repo.upsert(&TrackingCode::from_record(record).unwrap()).await.unwrap();

        let (tracking, outcome) =
            service.register("AB12345678901CD", Carrier::Acme, TrackingMetadata::default()).await.unwrap();
        assert_eq!(outcome, Registration::Reactivated);
        assert!(tracking.is_active());
        assert_eq!(publisher.of_type(EVENT_REACTIVATED).len(), 1);

        let stored = repo.find_by_code(tracking.code()).await.unwrap().unwrap();
        assert!(stored.is_active());
    }

    #[tokio::test]
    async fn test_register_rejects_wrong_format() {
        let (service, repo, _) = service();
        let err = service.register("AB12345678901CD", Carrier::Correios, TrackingMetadata::default()).await;
        assert!(matches!(err, Err(RegisterError::Validation(_))));
        assert!(repo.is_empty());
    }
}
