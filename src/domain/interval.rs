//! Adaptive polling interval
//!
//! Pure function of (status, event count, staleness, consecutive errors).
//! All values are in seconds.

use crate::domain::types::TrackingStatus;
use serde::Deserialize;

/// Hard ceiling for any computed interval (one year)
pub const MAX_INTERVAL_SECS: u64 = 365 * 86_400;

/// Base intervals and shaping parameters, supplied by configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub pending: u64,
    pub in_transit: u64,
    pub out_for_delivery: u64,
    /// 0 marks a terminal status
    pub delivered: u64,
    pub exception: u64,
    /// 0 marks a terminal status
    pub cancelled: u64,
    pub unknown: u64,
    pub min_secs: u64,
    pub max_secs: u64,
    /// Above this many events the shipment is treated as noisy and polled half as often
    pub spam_event_threshold: usize,
    /// Above this many hours without a new event the shipment is polled a third as often
    pub stale_after_hours: f64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            pending: 300,
            in_transit: 1800,
            out_for_delivery: 600,
            delivered: 0,
            exception: 900,
            cancelled: 0,
            unknown: 3600,
            min_secs: 300,
            max_secs: 86_400,
            spam_event_threshold: 20,
            stale_after_hours: 72.0,
        }
    }
}

impl IntervalConfig {
    pub fn base_for(&self, status: TrackingStatus) -> u64 {
        match status {
            TrackingStatus::Pending => self.pending,
            TrackingStatus::InTransit => self.in_transit,
            TrackingStatus::OutForDelivery => self.out_for_delivery,
            TrackingStatus::Delivered => self.delivered,
            TrackingStatus::Exception => self.exception,
            TrackingStatus::Cancelled => self.cancelled,
            TrackingStatus::Unknown => self.unknown,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntervalStrategy {
    config: IntervalConfig,
}

impl IntervalStrategy {
    pub fn new(config: IntervalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntervalConfig {
        &self.config
    }

    /// Shortest interval, used for freshly created codes
    pub fn min_secs(&self) -> u64 {
        self.config.min_secs.min(MAX_INTERVAL_SECS)
    }

    /// Next poll delay in seconds, always within `[min_secs, max_secs]`.
    ///
    /// A base of 0 ("stop polling") yields `max_secs`: codes are never
    /// deactivated, so terminal shipments keep a slow daily heartbeat instead
    /// of falling through to the minimum.
    pub fn calculate(
        &self,
        status: TrackingStatus,
        event_count: usize,
        hours_since_last_event: f64,
        error_count: u32,
    ) -> u64 {
        let cfg = &self.config;
        let upper = cfg.max_secs.max(cfg.min_secs).min(MAX_INTERVAL_SECS);
        let lower = cfg.min_secs.min(upper);
        let base = cfg.base_for(status);
        if base == 0 {
            return upper;
        }

        let mut interval = backoff(base, error_count).min(upper);

        if event_count > cfg.spam_event_threshold {
            interval = interval.saturating_mul(2);
        }

        if hours_since_last_event > cfg.stale_after_hours {
            interval = interval.saturating_mul(3);
        }

        interval.clamp(lower, upper)
    }
}

/// `base * 2^errors`, saturating
fn backoff(base: u64, error_count: u32) -> u64 {
    1u64.checked_shl(error_count)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(u64::MAX)
}
