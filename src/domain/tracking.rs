//! Tracking aggregate: one tracked code and its ordered event history
//!
//! Invariants held after every public operation:
//! - events sorted ascending by timestamp, no two with the same timestamp
//! - `status` derived from the last event (`pending` with no events), except
//!   right after `reactivate`, which forces `pending` until new events arrive
//! - `next_check_at == last_checked_at + interval_secs`
//! - `id`, `code` and `carrier` never change after creation

use crate::domain::error::ValidationError;
use crate::domain::interval::{IntervalStrategy, MAX_INTERVAL_SECS};
use crate::domain::types::{Carrier, TrackingCodeId, TrackingCodeValue, TrackingStatus};
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// A single carrier event, already mapped to the canonical vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub timestamp: DateTime<Utc>,
    pub status: TrackingStatus,
    /// Status wording as reported by the carrier
    pub carrier_status: String,
    pub location: String,
    pub description: String,
    pub delivered: bool,
    pub exception: bool,
    /// Untouched carrier payload, kept for audit
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl TrackingEvent {
    pub fn new(timestamp: DateTime<Utc>, status: TrackingStatus) -> Self {
        Self {
            timestamp,
            status,
            carrier_status: status.as_str().to_string(),
            location: String::new(),
            description: String::new(),
            delivered: status == TrackingStatus::Delivered,
            exception: status == TrackingStatus::Exception,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Canonical status implied by an event.
///
/// Delivered flag beats exception flag beats the mapped status. `unknown`
/// carrier wording is scheduled like `in_transit`.
pub fn derive_status(event: &TrackingEvent) -> TrackingStatus {
    if event.delivered {
        return TrackingStatus::Delivered;
    }
    if event.exception {
        return TrackingStatus::Exception;
    }
    match event.status {
        TrackingStatus::Unknown => TrackingStatus::InTransit,
        other => other,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingMetadata {
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub total_checks: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub estimated_delivery: Option<DateTime<Utc>>,
}

/// Plain storage shape of the aggregate.
///
/// Only `TrackingCode::from_record` turns this back into an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub id: TrackingCodeId,
    pub code: String,
    pub carrier: Carrier,
    pub status: TrackingStatus,
    pub active: bool,
    pub events: Vec<TrackingEvent>,
    pub last_checked_at: DateTime<Utc>,
    pub next_check_at: DateTime<Utc>,
    pub interval_secs: u64,
    pub metadata: TrackingMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pruned_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactivated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingCode {
    id: TrackingCodeId,
    code: TrackingCodeValue,
    carrier: Carrier,
    status: TrackingStatus,
    active: bool,
    events: Vec<TrackingEvent>,
    last_checked_at: DateTime<Utc>,
    next_check_at: DateTime<Utc>,
    interval_secs: u64,
    metadata: TrackingMetadata,
    created_at: DateTime<Utc>,
    /// Events older than this were pruned by retention and must not be re-merged
    pruned_before: Option<DateTime<Utc>>,
    /// Reset to `pending` by reactivation; cleared once new events arrive
    reactivated: bool,
}

impl TrackingCode {
    /// Start tracking a code.
    ///
    /// The code must match the carrier's format. Counters in `metadata` are
    /// reset; only the descriptive fields are kept.
    pub fn create(
        code: &str,
        carrier: Carrier,
        metadata: TrackingMetadata,
        now: DateTime<Utc>,
        strategy: &IntervalStrategy,
    ) -> Result<Self, ValidationError> {
        let code = TrackingCodeValue::parse_for(code, carrier)?;
        let interval_secs = strategy.min_secs();

        Ok(Self {
            id: TrackingCodeId::generate(),
            code,
            carrier,
            status: TrackingStatus::Pending,
            active: true,
            events: Vec::new(),
            last_checked_at: now,
            next_check_at: now + secs(interval_secs),
            interval_secs,
            metadata: TrackingMetadata {
                error_count: 0,
                total_checks: 0,
                last_error: None,
                ..metadata
            },
            created_at: now,
            pruned_before: None,
            reactivated: false,
        })
    }

    /// Rebuild an aggregate from storage, re-checking its invariants
    pub fn from_record(record: TrackingRecord) -> Result<Self, ValidationError> {
        let code = TrackingCodeValue::parse_for(&record.code, record.carrier)?;

        let mut events = record.events;
        events.sort_by_key(|e| e.timestamp);
        if let Some(pair) = events.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
            return Err(ValidationError::InvalidRecord(format!(
                "{code}: duplicate event timestamp {}",
                pair[0].timestamp.to_rfc3339()
            )));
        }

        let derived = events.last().map_or(TrackingStatus::Pending, derive_status);
        let reset_by_reactivation = record.reactivated && record.status == TrackingStatus::Pending;
        if record.status != derived && !reset_by_reactivation {
            return Err(ValidationError::InvalidRecord(format!(
                "{code}: status {} does not follow from the event history ({derived})",
                record.status
            )));
        }

        if checked_after(record.last_checked_at, record.interval_secs) != Some(record.next_check_at) {
            return Err(ValidationError::InvalidRecord(format!(
                "{code}: next_check_at does not match last_checked_at + interval"
            )));
        }

        Ok(Self {
            id: record.id,
            code,
            carrier: record.carrier,
            status: record.status,
            active: record.active,
            events,
            last_checked_at: record.last_checked_at,
            next_check_at: record.next_check_at,
            interval_secs: record.interval_secs,
            metadata: record.metadata,
            created_at: record.created_at,
            pruned_before: record.pruned_before,
            reactivated: record.reactivated,
        })
    }

    pub fn to_record(&self) -> TrackingRecord {
        TrackingRecord {
            id: self.id,
            code: self.code.as_str().to_string(),
            carrier: self.carrier,
            status: self.status,
            active: self.active,
            events: self.events.clone(),
            last_checked_at: self.last_checked_at,
            next_check_at: self.next_check_at,
            interval_secs: self.interval_secs,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            pruned_before: self.pruned_before,
            reactivated: self.reactivated,
        }
    }

    /// Merge carrier events into the history.
    ///
    /// Events whose timestamp is already present (or repeated within
    /// `incoming`) are dropped. Returns the events that were actually added,
    /// oldest first; an empty result means nothing changed.
    pub fn append_events(
        &mut self,
        incoming: Vec<TrackingEvent>,
        now: DateTime<Utc>,
        strategy: &IntervalStrategy,
    ) -> Vec<TrackingEvent> {
        let mut seen: FxHashSet<DateTime<Utc>> =
            self.events.iter().map(|e| e.timestamp).collect();

        let mut added: Vec<TrackingEvent> = incoming
            .into_iter()
            .filter(|e| self.pruned_before.is_none_or(|cutoff| e.timestamp >= cutoff))
            .filter(|e| seen.insert(e.timestamp))
            .collect();

        if added.is_empty() {
            return added;
        }

        added.sort_by_key(|e| e.timestamp);
        self.events.extend(added.iter().cloned());
        self.events.sort_by_key(|e| e.timestamp);

        if let Some(last) = self.events.last() {
            self.status = derive_status(last);
        }
        self.reactivated = false;

        self.recompute_next_check(now, strategy);
        added
    }

    /// A poll happened (successful or not)
    pub fn record_check(&mut self, now: DateTime<Utc>, strategy: &IntervalStrategy) {
        self.last_checked_at = now;
        self.metadata.total_checks += 1;
        self.recompute_next_check(now, strategy);
    }

    /// A poll failed; the error count feeds the backoff
    pub fn record_error(&mut self, message: &str, now: DateTime<Utc>, strategy: &IntervalStrategy) {
        self.metadata.error_count = self.metadata.error_count.saturating_add(1);
        self.metadata.last_error = Some(message.to_string());
        self.recompute_next_check(now, strategy);
    }

    /// Clear the error streak. Leaves the interval alone.
    pub fn reset_error_count(&mut self) {
        self.metadata.error_count = 0;
    }

    /// Bring an inactive code back into the polling population
    pub fn reactivate(&mut self, now: DateTime<Utc>, strategy: &IntervalStrategy) {
        self.active = true;
        self.status = TrackingStatus::Pending;
        self.reactivated = true;
        self.recompute_next_check(now, strategy);
    }

    /// Drop events older than `cutoff`, always keeping the most recent one.
    ///
    /// Returns how many events were removed.
    pub fn prune_events_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let Some(last_ts) = self.events.last().map(|e| e.timestamp) else {
            return 0;
        };
        let before = self.events.len();
        self.events.retain(|e| e.timestamp >= cutoff || e.timestamp == last_ts);
        let removed = before - self.events.len();
        if removed > 0 {
            let watermark = cutoff.min(last_ts);
            self.pruned_before = Some(self.pruned_before.map_or(watermark, |w| w.max(watermark)));
        }
        removed
    }

    fn recompute_next_check(&mut self, now: DateTime<Utc>, strategy: &IntervalStrategy) {
        let interval = strategy.calculate(
            self.status,
            self.events.len(),
            self.hours_since_last_event(now),
            self.metadata.error_count,
        );
        self.interval_secs = interval;
        self.next_check_at = self.last_checked_at + secs(interval);
    }

    fn hours_since_last_event(&self, now: DateTime<Utc>) -> f64 {
        self.events
            .last()
            .map(|e| (now - e.timestamp).num_seconds().max(0) as f64 / 3600.0)
            .unwrap_or(0.0)
    }

    /// Due for a poll at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_check_at <= now
    }

    pub fn id(&self) -> TrackingCodeId {
        self.id
    }

    pub fn code(&self) -> &TrackingCodeValue {
        &self.code
    }

    pub fn carrier(&self) -> Carrier {
        self.carrier
    }

    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn events(&self) -> &[TrackingEvent] {
        &self.events
    }

    pub fn last_checked_at(&self) -> DateTime<Utc> {
        self.last_checked_at
    }

    pub fn next_check_at(&self) -> DateTime<Utc> {
        self.next_check_at
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn metadata(&self) -> &TrackingMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Intervals reaching the aggregate come from `IntervalStrategy`, which caps
/// them at `MAX_INTERVAL_SECS`
fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(MAX_INTERVAL_SECS) as i64)
}

/// `at + s` seconds, `None` when it leaves chrono's range
fn checked_after(at: DateTime<Utc>, s: u64) -> Option<DateTime<Utc>> {
    let delta = Duration::try_seconds(i64::try_from(s).ok()?)?;
    at.checked_add_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const CODE: &str = "AB12345678901CD";

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 20, hour, minute, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        t(23, 0)
    }

    fn new_code() -> TrackingCode {
        TrackingCode::create(CODE, Carrier::Acme, TrackingMetadata::default(), t(8, 0), &IntervalStrategy::default())
            .unwrap()
    }

    fn assert_invariants(tracking: &TrackingCode) {
        let events = tracking.events();
        assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let expected = events.last().map(derive_status).unwrap_or(TrackingStatus::Pending);
        assert_eq!(tracking.status(), expected);
        assert_eq!(
            tracking.next_check_at(),
            tracking.last_checked_at() + Duration::seconds(tracking.interval_secs() as i64)
        );
    }

    #[test]
    fn test_create_initial_state() {
        let tracking = new_code();
        assert_eq!(tracking.code().as_str(), CODE);
        assert_eq!(tracking.carrier(), Carrier::Acme);
        assert_eq!(tracking.status(), TrackingStatus::Pending);
        assert!(tracking.is_active());
        assert!(tracking.events().is_empty());
        assert_eq!(tracking.interval_secs(), 300);
        assert_invariants(&tracking);
    }

    #[test]
    fn test_create_rejects_wrong_format() {
        let err = TrackingCode::create(
            "AB123456789CD",
            Carrier::Acme,
            TrackingMetadata::default(),
            now(),
            &IntervalStrategy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFormat { .. }));
    }

    #[test]
    fn test_create_resets_counters_but_keeps_details() {
        let metadata = TrackingMetadata {
            customer_id: Some("cust-1".to_string()),
            error_count: 9,
            total_checks: 4,
            last_error: Some("old".to_string()),
            ..TrackingMetadata::default()
        };
        let tracking =
            TrackingCode::create(CODE, Carrier::Carriers, metadata, now(), &IntervalStrategy::default())
                .unwrap();
        assert_eq!(tracking.metadata().customer_id.as_deref(), Some("cust-1"));
        assert_eq!(tracking.metadata().error_count, 0);
        assert_eq!(tracking.metadata().total_checks, 0);
        assert!(tracking.metadata().last_error.is_none());
    }

    #[test]
    fn test_append_events_is_idempotent() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        let events = vec![
            TrackingEvent::new(t(9, 0), TrackingStatus::Pending),
            TrackingEvent::new(t(10, 0), TrackingStatus::InTransit),
        ];

        let added = tracking.append_events(events.clone(), now(), &strategy);
        assert_eq!(added.len(), 2);
        let snapshot = tracking.clone();

        let added = tracking.append_events(events, now(), &strategy);
        assert!(added.is_empty());
        assert_eq!(tracking, snapshot);
    }

    #[test]
    fn test_append_sorts_and_dedups_any_order() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();

        tracking.append_events(
            vec![
                TrackingEvent::new(t(12, 0), TrackingStatus::OutForDelivery),
                TrackingEvent::new(t(9, 0), TrackingStatus::Pending),
                TrackingEvent::new(t(9, 0), TrackingStatus::InTransit),
            ],
            now(),
            &strategy,
        );
        assert_invariants(&tracking);
        assert_eq!(tracking.events().len(), 2);
        // First occurrence wins for a repeated timestamp
        assert_eq!(tracking.events()[0].status, TrackingStatus::Pending);

        let added = tracking.append_events(
            vec![
                TrackingEvent::new(t(10, 30), TrackingStatus::InTransit),
                TrackingEvent::new(t(12, 0), TrackingStatus::InTransit),
            ],
            now(),
            &strategy,
        );
        assert_eq!(added.len(), 1);
        assert_invariants(&tracking);
        assert_eq!(tracking.status(), TrackingStatus::OutForDelivery);
    }

    #[test]
    fn test_status_follows_chronologically_last_event() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        tracking.append_events(
            vec![
                TrackingEvent::new(t(15, 0), TrackingStatus::Delivered),
                TrackingEvent::new(t(9, 0), TrackingStatus::InTransit),
            ],
            now(),
            &strategy,
        );
        assert_eq!(tracking.status(), TrackingStatus::Delivered);

        // An older late-arriving event does not change the status
        tracking.append_events(vec![TrackingEvent::new(t(11, 0), TrackingStatus::Exception)], now(), &strategy);
        assert_eq!(tracking.status(), TrackingStatus::Delivered);
        assert_invariants(&tracking);
    }

    #[test]
    fn test_flags_take_precedence_over_mapped_status() {
        let mut delivered = TrackingEvent::new(t(9, 0), TrackingStatus::InTransit);
        delivered.delivered = true;
        delivered.exception = true;
        assert_eq!(derive_status(&delivered), TrackingStatus::Delivered);

        let mut exception = TrackingEvent::new(t(9, 0), TrackingStatus::OutForDelivery);
        exception.exception = true;
        assert_eq!(derive_status(&exception), TrackingStatus::Exception);

        let unknown = TrackingEvent::new(t(9, 0), TrackingStatus::Unknown);
        assert_eq!(derive_status(&unknown), TrackingStatus::InTransit);
    }

    #[test]
    fn test_record_check_advances_schedule() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        tracking.record_check(now(), &strategy);
        assert_eq!(tracking.last_checked_at(), now());
        assert_eq!(tracking.metadata().total_checks, 1);
        assert_eq!(tracking.next_check_at(), now() + Duration::seconds(300));
    }

    #[test]
    fn test_record_error_backs_off() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        for _ in 0..3 {
            tracking.record_check(now(), &strategy);
            tracking.record_error("timeout", now(), &strategy);
        }
        assert_eq!(tracking.metadata().error_count, 3);
        assert_eq!(tracking.metadata().last_error.as_deref(), Some("timeout"));
        assert_eq!(tracking.interval_secs(), 2400);
        assert_invariants(&tracking);

        tracking.reset_error_count();
        assert_eq!(tracking.metadata().error_count, 0);
        assert_eq!(tracking.interval_secs(), 2400);
    }

    #[test]
    fn test_reactivate_resets_status() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        tracking.append_events(vec![TrackingEvent::new(t(9, 0), TrackingStatus::Delivered)], now(), &strategy);
        let mut record = tracking.to_record();
        record.active = false;
        let mut tracking = TrackingCode::from_record(record).unwrap();

        tracking.reactivate(now(), &strategy);
        assert!(tracking.is_active());
        assert_eq!(tracking.status(), TrackingStatus::Pending);

        // The pending reset survives storage until new events arrive
        let restored = TrackingCode::from_record(tracking.to_record()).unwrap();
        assert_eq!(restored.status(), TrackingStatus::Pending);

        tracking.append_events(vec![TrackingEvent::new(t(10, 0), TrackingStatus::InTransit)], now(), &strategy);
        assert_eq!(tracking.status(), TrackingStatus::InTransit);
        assert!(!tracking.to_record().reactivated);
    }

    #[test]
    fn test_record_round_trip() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        tracking.append_events(vec![TrackingEvent::new(t(9, 0), TrackingStatus::InTransit)], now(), &strategy);
        tracking.record_check(now(), &strategy);

        let json = serde_json::to_string(&tracking.to_record()).unwrap();
        let record: TrackingRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(TrackingCode::from_record(record).unwrap(), tracking);
    }

    #[test]
    fn test_from_record_rejects_broken_invariants() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        tracking.append_events(vec![TrackingEvent::new(t(9, 0), TrackingStatus::InTransit)], now(), &strategy);

        let mut dup = tracking.to_record();
        dup.events.push(TrackingEvent::new(t(9, 0), TrackingStatus::Delivered));
        assert!(matches!(TrackingCode::from_record(dup), Err(ValidationError::InvalidRecord(_))));

        let mut schedule = tracking.to_record();
        schedule.next_check_at = schedule.next_check_at + Duration::seconds(1);
        assert!(matches!(TrackingCode::from_record(schedule), Err(ValidationError::InvalidRecord(_))));

        let mut carrier = tracking.to_record();
        carrier.carrier = Carrier::Correios;
        assert!(matches!(TrackingCode::from_record(carrier), Err(ValidationError::InvalidFormat { .. })));
    }

    #[test]
    fn test_from_record_rejects_status_not_matching_history() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        tracking.append_events(vec![TrackingEvent::new(t(9, 0), TrackingStatus::InTransit)], now(), &strategy);

        let mut record = tracking.to_record();
        record.status = TrackingStatus::Delivered;
        assert!(matches!(TrackingCode::from_record(record), Err(ValidationError::InvalidRecord(_))));

        // Without the reactivation marker a pending reset is not allowed either
        let mut record = tracking.to_record();
        record.status = TrackingStatus::Pending;
        assert!(matches!(TrackingCode::from_record(record), Err(ValidationError::InvalidRecord(_))));

        let mut empty = new_code().to_record();
        empty.status = TrackingStatus::Delivered;
        assert!(matches!(TrackingCode::from_record(empty), Err(ValidationError::InvalidRecord(_))));
    }

    #[test]
    fn test_from_record_rejects_out_of_range_interval() {
        for interval_secs in [u64::MAX, u64::MAX / 4, i64::MAX as u64] {
            let mut record = new_code().to_record();
            record.interval_secs = interval_secs;
            assert!(matches!(TrackingCode::from_record(record), Err(ValidationError::InvalidRecord(_))));
        }
    }

    #[test]
    fn test_prune_keeps_last_event_and_blocks_remerge() {
        let strategy = IntervalStrategy::default();
        let mut tracking = new_code();
        let events = vec![
            TrackingEvent::new(t(9, 0), TrackingStatus::Pending),
            TrackingEvent::new(t(10, 0), TrackingStatus::InTransit),
            TrackingEvent::new(t(11, 0), TrackingStatus::Delivered),
        ];
        tracking.append_events(events.clone(), now(), &strategy);

        let removed = tracking.prune_events_before(t(22, 0));
        assert_eq!(removed, 2);
        assert_eq!(tracking.events().len(), 1);
        assert_eq!(tracking.status(), TrackingStatus::Delivered);

        let added = tracking.append_events(events, now(), &strategy);
        assert!(added.is_empty());
        assert_eq!(tracking.events().len(), 1);
        assert_invariants(&tracking);
    }

    #[test]
    fn test_prune_without_events_is_noop() {
        let mut tracking = new_code();
        assert_eq!(tracking.prune_events_before(now()), 0);
    }

    #[test]
    fn test_is_due() {
        let tracking = new_code();
        assert!(!tracking.is_due(t(8, 4)));
        assert!(tracking.is_due(t(8, 5)));
    }
}
