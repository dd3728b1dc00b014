//! Reconciliation use case
//!
//! One invocation refreshes one tracking code:
//! 1. validate the code and load the aggregate (created and persisted lazily
//!    when absent)
//! 2. fetch carrier events; on a classified error (or a stored code whose
//!    carrier has no client) record it on the aggregate, persist, and
//!    return the error
//! 3. map events to the canonical vocabulary, merge, record the check,
//!    persist
//! 4. only if something new was merged: publish `tracking.status.updated`
//!    (status changed), one `tracking.event.new` per merged event and
//!    `tracking.delivered` (status is delivered)
//!
//! Persistence always completes before publication. Publication failures
//! are logged and counted, never returned: the next cycle re-derives state
//! from storage.

use crate::domain::error::ValidationError;
use crate::domain::interval::IntervalStrategy;
use crate::domain::status_map::StatusMappingTable;
use crate::domain::tracking::{TrackingCode, TrackingEvent, TrackingMetadata};
use crate::domain::types::{Carrier, TrackingCodeValue, TrackingStatus};
use crate::infra::metrics::Metrics;
use crate::io::cache::LastCheckCache;
use crate::io::carrier_client::{CarrierClients, CarrierError, CarrierErrorKind, CarrierEvent};
use crate::io::publisher::{
    EventPublisher, OutboundEvent, EVENT_DELIVERED, EVENT_NEW, EVENT_STATUS_UPDATED,
};
use crate::io::repository::{RepositoryError, TrackingRepository};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no carrier client configured for {0}")]
    NoClient(Carrier),

    #[error("{code}: carrier {carrier} call failed: {source}")]
    Carrier {
        code: TrackingCodeValue,
        carrier: Carrier,
        #[source]
        source: CarrierError,
    },

    #[error("{code}: repository error: {source}")]
    Repository {
        code: TrackingCodeValue,
        #[source]
        source: RepositoryError,
    },
}

impl ReconcileError {
    pub fn carrier_kind(&self) -> Option<CarrierErrorKind> {
        match self {
            ReconcileError::Carrier { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Result of one successful reconciliation
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub code: TrackingCodeValue,
    pub carrier: Carrier,
    pub previous_status: TrackingStatus,
    pub status: TrackingStatus,
    /// Events merged by this run, oldest first
    pub new_events: Vec<TrackingEvent>,
    /// Full history after the merge
    pub events: Vec<TrackingEvent>,
    pub published: usize,
}

impl ReconcileOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.status
    }
}

pub struct Reconciler {
    repository: Arc<dyn TrackingRepository>,
    clients: CarrierClients,
    publisher: Arc<dyn EventPublisher>,
    status_map: Arc<StatusMappingTable>,
    strategy: Arc<IntervalStrategy>,
    metrics: Arc<Metrics>,
    cache: Option<Arc<LastCheckCache>>,
    default_carrier: Carrier,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn TrackingRepository>,
        clients: CarrierClients,
        publisher: Arc<dyn EventPublisher>,
        status_map: Arc<StatusMappingTable>,
        strategy: Arc<IntervalStrategy>,
        metrics: Arc<Metrics>,
        default_carrier: Carrier,
    ) -> Self {
        Self {
            repository,
            clients,
            publisher,
            status_map,
            strategy,
            metrics,
            cache: None,
            default_carrier,
        }
    }

    pub fn with_cache(mut self, cache: Arc<LastCheckCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clients(&self) -> &CarrierClients {
        &self.clients
    }

    /// Refresh one code against its carrier.
    ///
    /// `carrier` only matters when the code is not stored yet; an existing
    /// aggregate keeps the carrier it was created with.
    pub async fn reconcile(
        &self,
        raw_code: &str,
        carrier: Option<Carrier>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let code = match carrier {
            Some(carrier) => TrackingCodeValue::parse_for(raw_code, carrier)?,
            None => TrackingCodeValue::parse(raw_code)?,
        };

        let stored = self
            .repository
            .find_by_code(&code)
            .await
            .map_err(|source| ReconcileError::Repository { code: code.clone(), source })?;

        let target = stored.as_ref().map_or(carrier.unwrap_or(self.default_carrier), |t| t.carrier());
        let Some(client) = self.clients.get(target) else {
            // A stored code still gets its check and error recorded so it
            // backs off instead of staying at the head of the due list
            if let Some(mut tracking) = stored {
                let reason = ReconcileError::NoClient(target).to_string();
                self.record_failure(&mut tracking, &reason).await;
                warn!(
                    code = %code,
                    carrier = %target,
                    error_count = %tracking.metadata().error_count,
                    next_check_at = %tracking.next_check_at(),
                    "reconcile_no_client"
                );
            }
            self.metrics.record_reconcile_failed();
            return Err(ReconcileError::NoClient(target));
        };

        let mut tracking = match stored {
            Some(tracking) => tracking,
            None => self.create_lazily(&code, target).await?,
        };

        let fetched = client.fetch_events(tracking.code()).await;

        let raw_events = match fetched {
            Ok(events) => events,
            Err(source) => {
                self.record_failure(&mut tracking, &source.to_string()).await;
                self.metrics.record_reconcile_failed();
                warn!(
                    code = %code,
                    carrier = %target,
                    kind = %source.kind().as_str(),
                    error_count = %tracking.metadata().error_count,
                    next_check_at = %tracking.next_check_at(),
                    "reconcile_carrier_error"
                );
                return Err(ReconcileError::Carrier { code, carrier: target, source });
            }
        };

        let checked_at = Utc::now();
        let mapped: Vec<TrackingEvent> = raw_events.into_iter().map(|e| self.map_event(e)).collect();
        let previous_status = tracking.status();

        tracking.reset_error_count();
        let new_events = tracking.append_events(mapped, checked_at, &self.strategy);
        tracking.record_check(checked_at, &self.strategy);

        self.repository
            .upsert(&tracking)
            .await
            .map_err(|source| ReconcileError::Repository { code: code.clone(), source })?;

        if let Some(cache) = &self.cache {
            cache.record(code.as_str());
        }
        self.metrics.record_reconciled(new_events.len());

        let published = self.publish_changes(&tracking, previous_status, &new_events).await;

        info!(
            code = %code,
            carrier = %target,
            status = %tracking.status(),
            new_events = %new_events.len(),
            published = %published,
            next_check_at = %tracking.next_check_at(),
            "reconcile_completed"
        );

        Ok(ReconcileOutcome {
            code,
            carrier: target,
            previous_status,
            status: tracking.status(),
            new_events,
            events: tracking.events().to_vec(),
            published,
        })
    }

    /// Record a failed poll and persist it. A storage failure here is only
    /// logged; the caller already reports the original error.
    async fn record_failure(&self, tracking: &mut TrackingCode, message: &str) {
        let now = Utc::now();
        tracking.record_check(now, &self.strategy);
        tracking.record_error(message, now, &self.strategy);
        if let Err(e) = self.repository.upsert(tracking).await {
            log_error_persist_failed(tracking.code(), &e);
        }
    }

    async fn create_lazily(
        &self,
        code: &TrackingCodeValue,
        carrier: Carrier,
    ) -> Result<TrackingCode, ReconcileError> {
        let tracking = TrackingCode::create(
            code.as_str(),
            carrier,
            TrackingMetadata::default(),
            Utc::now(),
            &self.strategy,
        )?;
        self.repository
            .upsert(&tracking)
            .await
            .map_err(|source| ReconcileError::Repository { code: code.clone(), source })?;
        info!(code = %code, carrier = %carrier, id = %tracking.id(), "tracking_created_on_reconcile");
        Ok(tracking)
    }

    fn map_event(&self, event: CarrierEvent) -> TrackingEvent {
        let mapped = self.status_map.classify(&event.status);
        if mapped.status == TrackingStatus::Unknown {
            debug!(carrier_status = %event.status, "carrier_status_unmapped");
        }
        let description =
            if event.description.is_empty() { event.status.clone() } else { event.description };
        TrackingEvent {
            timestamp: event.timestamp,
            status: mapped.status,
            carrier_status: event.status,
            location: event.location,
            description,
            delivered: mapped.delivered,
            exception: mapped.exception,
            raw: event.raw,
        }
    }

    /// Returns how many envelopes the publisher accepted
    async fn publish_changes(
        &self,
        tracking: &TrackingCode,
        previous_status: TrackingStatus,
        new_events: &[TrackingEvent],
    ) -> usize {
        if new_events.is_empty() {
            return 0;
        }

        let now = Utc::now();
        let id = tracking.id().to_string();
        let code = tracking.code().as_str();
        let carrier = tracking.carrier().as_str();
        let mut envelopes = Vec::with_capacity(new_events.len() + 2);

        if previous_status != tracking.status() {
            envelopes.push(OutboundEvent::new(
                EVENT_STATUS_UPDATED,
                &id,
                json!({
                    "trackingCodeId": id,
                    "trackingCode": code,
                    "carrier": carrier,
                    "previousStatus": previous_status,
                    "currentStatus": tracking.status(),
                    "isDelivered": tracking.status() == TrackingStatus::Delivered,
                }),
                now,
            ));
        }

        for event in new_events {
            envelopes.push(OutboundEvent::new(
                EVENT_NEW,
                &id,
                json!({
                    "trackingCodeId": id,
                    "trackingCode": code,
                    "carrier": carrier,
                    "event": {
                        "timestamp": event.timestamp,
                        "status": event.status,
                        "carrierStatus": event.carrier_status,
                        "location": event.location,
                        "description": event.description,
                        "isDelivered": event.delivered,
                        "isException": event.exception,
                    },
                }),
                now,
            ));
        }

        if tracking.status() == TrackingStatus::Delivered {
            let delivered_at = tracking.events().last().map(|e| e.timestamp);
            envelopes.push(OutboundEvent::new(
                EVENT_DELIVERED,
                &id,
                json!({
                    "trackingCodeId": id,
                    "trackingCode": code,
                    "carrier": carrier,
                    "deliveredAt": delivered_at,
                    "totalEvents": tracking.events().len(),
                    "customerId": tracking.metadata().customer_id,
                    "contractId": tracking.metadata().contract_id,
                }),
                now,
            ));
        }

        let mut published = 0;
        for envelope in envelopes {
            let event_type = envelope.event_type.clone();
            match self.publisher.publish(envelope).await {
                Ok(()) => {
                    published += 1;
                    self.metrics.record_published();
                }
                Err(e) => {
                    self.metrics.record_publish_failed();
                    log_publish_failed(code, &event_type, &e.to_string());
                }
            }
        }
        published
    }
}

#[cold]
fn log_error_persist_failed(code: &TrackingCodeValue, e: &RepositoryError) {
    error!(code = %code, error = %e, "reconcile_error_persist_failed");
}

#[cold]
fn log_publish_failed(code: &str, event_type: &str, error: &str) {
    error!(code = %code, event_type = %event_type, error = %error, "event_publish_failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::carrier_client::CarrierClient;
    use crate::io::publisher::InMemoryEventPublisher;
    use crate::io::repository::{InMemoryTrackingRepository, PurgeReport};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Carrier fake that replays a fixed response
    struct FixedCarrier {
        carrier: Carrier,
        response: Mutex<Result<Vec<CarrierEvent>, CarrierError>>,
    }

    #[async_trait]
    impl CarrierClient for FixedCarrier {
        fn carrier(&self) -> Carrier {
            self.carrier
        }

        async fn fetch_events(&self, _code: &TrackingCodeValue) -> Result<Vec<CarrierEvent>, CarrierError> {
            self.response.lock().clone()
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    /// Repository whose writes can be switched off
    struct FlakyRepository {
        inner: InMemoryTrackingRepository,
        reject_writes: AtomicBool,
    }

    #[async_trait]
    impl TrackingRepository for FlakyRepository {
        async fn find_by_code(&self, code: &TrackingCodeValue) -> Result<Option<TrackingCode>, RepositoryError> {
            self.inner.find_by_code(code).await
        }

        async fn upsert(&self, tracking: &TrackingCode) -> Result<(), RepositoryError> {
            if self.reject_writes.load(Ordering::Relaxed) {
                return Err(RepositoryError::Unavailable("write rejected".to_string()));
            }
            self.inner.upsert(tracking).await
        }

        async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TrackingCode>, RepositoryError> {
            self.inner.find_due(now, limit).await
        }

        async fn find_all(&self, limit: usize) -> Result<Vec<TrackingCode>, RepositoryError> {
            self.inner.find_all(limit).await
        }

        async fn count_by_status(&self, status: TrackingStatus) -> Result<usize, RepositoryError> {
            self.inner.count_by_status(status).await
        }

        async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, RepositoryError> {
            self.inner.purge_events_before(cutoff).await
        }
    }

    struct Harness {
        reconciler: Reconciler,
        repo: Arc<InMemoryTrackingRepository>,
        publisher: Arc<InMemoryEventPublisher>,
        carrier: Arc<FixedCarrier>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let carrier = Arc::new(FixedCarrier { carrier: Carrier::Acme, response: Mutex::new(Ok(Vec::new())) });
        let reconciler = Reconciler::new(
            repo.clone(),
            CarrierClients::new().with(carrier.clone()),
            publisher.clone(),
            Arc::new(StatusMappingTable::default()),
            Arc::new(IntervalStrategy::default()),
            Arc::new(Metrics::new()),
            Carrier::Acme,
        );
        Harness { reconciler, repo, publisher, carrier }
    }

    #[tokio::test]
    async fn test_invalid_code_rejected_before_io() {
        let h = harness();
        let err = h.reconciler.reconcile("NOT-A-CODE", None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_missing_client_is_reported() {
        let h = harness();
        let err = h.reconciler.reconcile("AB123456789BR", Some(Carrier::Correios)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoClient(Carrier::Correios)));
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_description_falls_back_to_carrier_status() {
        let h = harness();
        let t1 = Utc::now() - Duration::hours(1);
        *h.carrier.response.lock() = Ok(vec![CarrierEvent::new(t1, "Em trânsito")]);

        let outcome = h.reconciler.reconcile("AB12345678901CD", None).await.unwrap();
        assert_eq!(outcome.events[0].description, "Em trânsito");
        assert_eq!(outcome.events[0].status, TrackingStatus::InTransit);
    }

    #[tokio::test]
    async fn test_unmapped_status_schedules_as_in_transit() {
        let h = harness();
        let t1 = Utc::now() - Duration::hours(1);
        *h.carrier.response.lock() = Ok(vec![CarrierEvent::new(t1, "Aguardando retirada")]);

        let outcome = h.reconciler.reconcile("AB12345678901CD", None).await.unwrap();
        assert_eq!(outcome.events[0].status, TrackingStatus::Unknown);
        assert_eq!(outcome.status, TrackingStatus::InTransit);
    }

    #[tokio::test]
    async fn test_error_path_persists_backoff() {
        let h = harness();
        *h.carrier.response.lock() = Err(CarrierError::RateLimited);

        let err = h.reconciler.reconcile("AB12345678901CD", None).await.unwrap_err();
        assert_eq!(err.carrier_kind(), Some(CarrierErrorKind::RateLimited));

        let code = TrackingCodeValue::parse("AB12345678901CD").unwrap();
        let stored = h.repo.find_by_code(&code).await.unwrap().unwrap();
        assert_eq!(stored.metadata().error_count, 1);
        assert_eq!(stored.metadata().total_checks, 1);
        assert_eq!(stored.interval_secs(), 600);
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_success_resets_error_count() {
        let h = harness();
        *h.carrier.response.lock() = Err(CarrierError::ServerError(503));
        let _ = h.reconciler.reconcile("AB12345678901CD", None).await;

        *h.carrier.response.lock() = Ok(Vec::new());
        let outcome = h.reconciler.reconcile("AB12345678901CD", None).await.unwrap();
        assert!(outcome.new_events.is_empty());

        let stored = h.repo.find_by_code(&outcome.code).await.unwrap().unwrap();
        assert_eq!(stored.metadata().error_count, 0);
        assert_eq!(stored.interval_secs(), 300);
    }

    #[tokio::test]
    async fn test_existing_code_keeps_its_carrier() {
        let h = harness();
        let _ = h.reconciler.reconcile("AB12345678901CD", Some(Carrier::Acme)).await.unwrap();

        // A later request naming another carrier still uses the stored one
        let outcome = h.reconciler.reconcile("AB12345678901CD", Some(Carrier::Carriers)).await.unwrap();
        assert_eq!(outcome.carrier, Carrier::Acme);
    }

    #[tokio::test]
    async fn test_stored_code_without_client_still_advances_schedule() {
        let h = harness();
        let strategy = IntervalStrategy::default();
        let created = Utc::now() - Duration::hours(2);
        let orphan =
            TrackingCode::create("AB123456789BR", Carrier::Correios, TrackingMetadata::default(), created, &strategy)
                .unwrap();
        h.repo.upsert(&orphan).await.unwrap();

        let err = h.reconciler.reconcile("AB123456789BR", None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoClient(Carrier::Correios)));

        let stored = h.repo.find_by_code(orphan.code()).await.unwrap().unwrap();
        assert_eq!(stored.metadata().error_count, 1);
        assert_eq!(stored.metadata().total_checks, 1);
        assert!(stored.metadata().last_error.as_deref().is_some_and(|e| e.contains("Correios")));
        assert!(stored.last_checked_at() > orphan.last_checked_at());
        assert!(stored.next_check_at() > Utc::now());
    }

    #[tokio::test]
    async fn test_error_path_survives_storage_failure() {
        let repo = Arc::new(FlakyRepository {
            inner: InMemoryTrackingRepository::new(),
            reject_writes: AtomicBool::new(false),
        });
        let carrier = Arc::new(FixedCarrier { carrier: Carrier::Acme, response: Mutex::new(Ok(Vec::new())) });
        let reconciler = Reconciler::new(
            repo.clone(),
            CarrierClients::new().with(carrier.clone()),
            Arc::new(InMemoryEventPublisher::new()),
            Arc::new(StatusMappingTable::default()),
            Arc::new(IntervalStrategy::default()),
            Arc::new(Metrics::new()),
            Carrier::Acme,
        );
        reconciler.reconcile("AB12345678901CD", None).await.unwrap();

        repo.reject_writes.store(true, Ordering::Relaxed);
        *carrier.response.lock() = Err(CarrierError::ServerError(502));

        // The carrier failure is reported, not the storage one
        let err = reconciler.reconcile("AB12345678901CD", None).await.unwrap_err();
        assert_eq!(err.carrier_kind(), Some(CarrierErrorKind::ServerError));

        let code = TrackingCodeValue::parse("AB12345678901CD").unwrap();
        let stored = repo.find_by_code(&code).await.unwrap().unwrap();
        assert_eq!(stored.metadata().error_count, 0);
        assert_eq!(stored.metadata().total_checks, 1);

        // Once storage recovers the next failure is recorded as usual
        repo.reject_writes.store(false, Ordering::Relaxed);
        let _ = reconciler.reconcile("AB12345678901CD", None).await.unwrap_err();
        let stored = repo.find_by_code(&code).await.unwrap().unwrap();
        assert_eq!(stored.metadata().error_count, 1);
        assert_eq!(stored.metadata().total_checks, 2);
    }
}
