//! Reconciliation scheduler
//!
//! Two background tasks share one shutdown signal:
//! - the tick loop selects a batch (`due` or `all`), groups it by carrier and
//!   reconciles each group in sub-batches capped at the carrier's
//!   concurrency, pausing between sub-batches and between carriers
//! - the maintenance loop wakes daily at `maintenance_hour_utc` and prunes
//!   event history past the retention window
//!
//! Every reconciliation in a sub-batch is awaited to completion (settle-all);
//! a failing code never aborts its siblings.

use crate::domain::tracking::TrackingCode;
use crate::domain::types::Carrier;
use crate::infra::config::{Config, SchedulerConfig, SelectionPolicy};
use crate::infra::metrics::Metrics;
use crate::io::cache::LastCheckCache;
use crate::io::carrier_client::CarrierErrorKind;
use crate::io::repository::{InMemoryTrackingRepository, PurgeReport, RepositoryError, TrackingRepository};
use crate::services::reconciler::Reconciler;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub selected: usize,
    pub skipped_fresh: usize,
    pub reconciled: usize,
    pub failed: usize,
    pub not_found: usize,
    pub new_events: usize,
    pub carriers: usize,
}

/// Optional collaborators, fixed at construction
#[derive(Default)]
pub struct SchedulerOptions {
    /// Skip codes checked within the cache TTL when selecting under `all`
    pub cache: Option<Arc<LastCheckCache>>,
    /// Write a snapshot of this repository to the path after each maintenance run
    pub snapshot: Option<(Arc<InMemoryTrackingRepository>, PathBuf)>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    running: Mutex<Option<Running>>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    concurrency: BTreeMap<Carrier, usize>,
    reconciler: Arc<Reconciler>,
    repository: Arc<dyn TrackingRepository>,
    metrics: Arc<Metrics>,
    cache: Option<Arc<LastCheckCache>>,
    snapshot: Option<(Arc<InMemoryTrackingRepository>, PathBuf)>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        reconciler: Arc<Reconciler>,
        repository: Arc<dyn TrackingRepository>,
        metrics: Arc<Metrics>,
        options: SchedulerOptions,
    ) -> Self {
        let concurrency =
            Carrier::ALL.into_iter().map(|c| (c, config.concurrency_for(c).max(1))).collect();
        Self {
            inner: Arc::new(SchedulerInner {
                config: config.scheduler().clone(),
                concurrency,
                reconciler,
                repository,
                metrics,
                cache: options.cache,
                snapshot: options.snapshot,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the tick and maintenance loops. A second call is a no-op.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("scheduler_already_running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tick = tokio::spawn(Arc::clone(&self.inner).tick_loop(shutdown_rx.clone()));
        let maintenance = tokio::spawn(Arc::clone(&self.inner).maintenance_loop(shutdown_rx));
        *running = Some(Running { shutdown_tx, handles: vec![tick, maintenance] });

        info!(
            tick_interval_secs = %self.inner.config.tick_interval_secs,
            batch_size = %self.inner.config.batch_size,
            selection = %self.inner.config.selection.as_str(),
            maintenance_hour_utc = %self.inner.config.maintenance_hour_utc,
            "scheduler_started"
        );
        true
    }

    /// Stop both loops and wait for the current tick to settle
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            debug!("scheduler_not_running");
            return;
        };

        let _ = running.shutdown_tx.send(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler_task_join_failed");
            }
        }
        info!("scheduler_stopped");
    }

    pub async fn run_tick(&self) -> TickReport {
        self.inner.run_tick().await
    }

    pub async fn run_maintenance(&self) -> Result<PurgeReport, RepositoryError> {
        self.inner.run_maintenance(Utc::now()).await
    }
}

impl SchedulerInner {
    async fn tick_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = Utc::now();
            let at = next_maintenance_at(now, self.config.maintenance_hour_utc);
            let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next_run = %at, "maintenance_scheduled");

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.run_maintenance(Utc::now()).await {
                        error!(error = %e, "maintenance_failed");
                    }
                }
            }
        }
    }

    async fn run_tick(&self) -> TickReport {
        let started = Instant::now();
        self.metrics.record_tick();
        let mut report = TickReport::default();

        let selected = match self.select().await {
            Ok(selected) => selected,
            Err(e) => {
                error!(error = %e, "tick_selection_failed");
                return report;
            }
        };
        report.selected = selected.len();

        let mut groups: BTreeMap<Carrier, Vec<String>> = BTreeMap::new();
        for tracking in selected {
            if self.config.selection == SelectionPolicy::All
                && self.cache.as_ref().is_some_and(|c| c.is_fresh(tracking.code().as_str()))
            {
                report.skipped_fresh += 1;
                continue;
            }
            groups.entry(tracking.carrier()).or_default().push(tracking.code().as_str().to_string());
        }
        report.carriers = groups.len();

        for (i, (carrier, codes)) in groups.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.carrier_pause()).await;
            }
            let cap = self.concurrency.get(carrier).copied().unwrap_or(1);
            self.run_group(*carrier, codes, cap, &mut report).await;
        }

        info!(
            selected = %report.selected,
            reconciled = %report.reconciled,
            failed = %report.failed,
            new_events = %report.new_events,
            skipped_fresh = %report.skipped_fresh,
            duration_ms = %started.elapsed().as_millis(),
            "tick_completed"
        );
        report
    }

    async fn select(&self) -> Result<Vec<TrackingCode>, RepositoryError> {
        match self.config.selection {
            SelectionPolicy::Due => self.repository.find_due(Utc::now(), self.config.batch_size).await,
            SelectionPolicy::All => self.repository.find_all(self.config.batch_size).await,
        }
    }

    async fn run_group(&self, carrier: Carrier, codes: &[String], cap: usize, report: &mut TickReport) {
        for (i, chunk) in codes.chunks(cap).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.sub_batch_pause()).await;
            }

            let mut set = JoinSet::new();
            for code in chunk {
                let reconciler = Arc::clone(&self.reconciler);
                let guard = self.metrics.in_flight_guard();
                let code = code.clone();
                set.spawn(async move {
                    let _guard = guard;
                    let result = reconciler.reconcile(&code, Some(carrier)).await;
                    (code, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(outcome))) => {
                        report.reconciled += 1;
                        report.new_events += outcome.new_events.len();
                    }
                    Ok((code, Err(e))) => {
                        report.failed += 1;
                        if e.carrier_kind() == Some(CarrierErrorKind::NotFound) {
                            report.not_found += 1;
                        }
                        debug!(code = %code, carrier = %carrier, error = %e, "tick_reconcile_failed");
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(carrier = %carrier, error = %e, "tick_task_panicked");
                    }
                }
            }
        }
    }

    async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<PurgeReport, RepositoryError> {
        let cutoff = now - ChronoDuration::days(i64::from(self.config.retention_days));
        let report = self.repository.purge_events_before(cutoff).await?;
        self.metrics.record_events_pruned(report.events_removed);

        let expired = self.cache.as_ref().map_or(0, |c| c.purge_expired());

        if let Some((repository, path)) = &self.snapshot {
            match repository.write_snapshot(path) {
                Ok(written) => debug!(path = %path.display(), written = %written, "snapshot_written"),
                Err(e) => error!(path = %path.display(), error = %e, "snapshot_write_failed"),
            }
        }

        info!(
            cutoff = %cutoff,
            codes_touched = %report.codes_touched,
            events_removed = %report.events_removed,
            cache_expired = %expired,
            "maintenance_completed"
        );
        Ok(report)
    }
}

/// Next occurrence of `hour`:00 UTC strictly after `now`
fn next_maintenance_at(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now.date_naive().and_hms_opt(hour.min(23), 0, 0).map(|t| t.and_utc());
    match today {
        Some(at) if at > now => at,
        Some(at) => at + ChronoDuration::days(1),
        None => now + ChronoDuration::days(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::interval::IntervalStrategy;
    use crate::domain::status_map::StatusMappingTable;
    use crate::domain::tracking::{TrackingEvent, TrackingMetadata};
    use crate::domain::types::{TrackingCodeValue, TrackingStatus};
    use crate::io::carrier_client::{CarrierClient, CarrierClients, CarrierError, CarrierEvent};
    use crate::io::publisher::InMemoryEventPublisher;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Slow carrier that records its peak concurrency
    struct SlowCarrier {
        carrier: Carrier,
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_code: Option<&'static str>,
    }

    impl SlowCarrier {
        fn new(carrier: Carrier) -> Self {
            Self {
                carrier,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_code: None,
            }
        }
    }

    #[async_trait]
    impl CarrierClient for SlowCarrier {
        fn carrier(&self) -> Carrier {
            self.carrier
        }

        async fn fetch_events(&self, code: &TrackingCodeValue) -> Result<Vec<CarrierEvent>, CarrierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_code == Some(code.as_str()) {
                return Err(CarrierError::NotFound);
            }
            Ok(vec![CarrierEvent::new(Utc::now() - ChronoDuration::hours(1), "in_transit")])
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    async fn seed(repo: &InMemoryTrackingRepository, codes: &[(&str, Carrier)]) {
        let past = Utc::now() - ChronoDuration::hours(1);
        for (code, carrier) in codes {
            let tracking =
                TrackingCode::create(code, *carrier, TrackingMetadata::default(), past, &IntervalStrategy::default())
                    .unwrap();
            repo.upsert(&tracking).await.unwrap();
        }
    }

    fn scheduler(
        config: Config,
        repo: Arc<InMemoryTrackingRepository>,
        clients: CarrierClients,
        metrics: Arc<Metrics>,
    ) -> Scheduler {
        scheduler_with(config, repo, clients, metrics, SchedulerOptions::default())
    }

    fn scheduler_with(
        config: Config,
        repo: Arc<InMemoryTrackingRepository>,
        clients: CarrierClients,
        metrics: Arc<Metrics>,
        options: SchedulerOptions,
    ) -> Scheduler {
        let reconciler = Reconciler::new(
            repo.clone(),
            clients,
            Arc::new(InMemoryEventPublisher::new()),
            Arc::new(StatusMappingTable::default()),
            Arc::new(IntervalStrategy::default()),
            metrics.clone(),
            Carrier::Acme,
        );
        Scheduler::new(&config, Arc::new(reconciler), repo, metrics, options)
    }

    fn acme_codes(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("AB{:011}CD", i)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_carrier_concurrency() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let codes = acme_codes(7);
        let seeded: Vec<(&str, Carrier)> = codes.iter().map(|c| (c.as_str(), Carrier::Acme)).collect();
        seed(&repo, &seeded).await;

        let carrier = Arc::new(SlowCarrier::new(Carrier::Acme));
        let metrics = Arc::new(Metrics::new());
        let config = Config::default()
            .with_scheduler(SchedulerConfig { batch_size: 10, ..SchedulerConfig::default() });
        let scheduler = scheduler(config, repo, CarrierClients::new().with(carrier.clone()), metrics.clone());

        let report = scheduler.run_tick().await;
        assert_eq!(report.selected, 7);
        assert_eq!(report.reconciled, 7);
        assert_eq!(report.new_events, 7);
        assert_eq!(carrier.calls.load(Ordering::SeqCst), 7);
        // Acme default cap is 2
        assert!(carrier.peak.load(Ordering::SeqCst) <= 2);
        assert!(metrics.in_flight_max() <= 2);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_abort_siblings() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let codes = acme_codes(3);
        let seeded: Vec<(&str, Carrier)> = codes.iter().map(|c| (c.as_str(), Carrier::Acme)).collect();
        seed(&repo, &seeded).await;

        let mut slow = SlowCarrier::new(Carrier::Acme);
        slow.fail_code = Some("AB00000000002CD");
        let scheduler = scheduler(
            Config::default(),
            repo.clone(),
            CarrierClients::new().with(Arc::new(slow)),
            Arc::new(Metrics::new()),
        );

        let report = scheduler.run_tick().await;
        assert_eq!(report.reconciled, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.not_found, 1);

        let failed = repo.find_by_code(&TrackingCodeValue::parse("AB00000000002CD").unwrap()).await.unwrap().unwrap();
        assert_eq!(failed.metadata().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_without_client_does_not_starve_others() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let strategy = IntervalStrategy::default();
        let older = Utc::now() - ChronoDuration::hours(3);
        let newer = Utc::now() - ChronoDuration::hours(1);
        let orphan =
            TrackingCode::create("AB123456789BR", Carrier::Correios, TrackingMetadata::default(), older, &strategy)
                .unwrap();
        let served =
            TrackingCode::create("AB00000000001CD", Carrier::Acme, TrackingMetadata::default(), newer, &strategy)
                .unwrap();
        repo.upsert(&orphan).await.unwrap();
        repo.upsert(&served).await.unwrap();

        let acme = Arc::new(SlowCarrier::new(Carrier::Acme));
        let config = Config::default()
            .with_scheduler(SchedulerConfig { batch_size: 1, ..SchedulerConfig::default() });
        let scheduler = scheduler(config, repo.clone(), CarrierClients::new().with(acme.clone()), Arc::new(Metrics::new()));

        let first = scheduler.run_tick().await;
        assert_eq!(first.failed, 1);
        let second = scheduler.run_tick().await;
        assert_eq!(second.reconciled, 1);
        assert_eq!(acme.calls.load(Ordering::SeqCst), 1);

        let stored = repo.find_by_code(orphan.code()).await.unwrap().unwrap();
        assert_eq!(stored.metadata().error_count, 1);
        assert!(stored.next_check_at() > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_groups_by_carrier() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        seed(&repo, &[("AB00000000001CD", Carrier::Acme), ("AB123456789BR", Carrier::Correios)]).await;

        let acme = Arc::new(SlowCarrier::new(Carrier::Acme));
        let correios = Arc::new(SlowCarrier::new(Carrier::Correios));
        let clients = CarrierClients::new().with(acme.clone()).with(correios.clone());
        let scheduler = scheduler(Config::default(), repo, clients, Arc::new(Metrics::new()));

        let report = scheduler.run_tick().await;
        assert_eq!(report.carriers, 2);
        assert_eq!(acme.calls.load(Ordering::SeqCst), 1);
        assert_eq!(correios.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_policy_skips_codes_not_due() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let fresh = TrackingCode::create(
            "AB00000000001CD",
            Carrier::Acme,
            TrackingMetadata::default(),
            Utc::now(),
            &IntervalStrategy::default(),
        )
        .unwrap();
        repo.upsert(&fresh).await.unwrap();

        let carrier = Arc::new(SlowCarrier::new(Carrier::Acme));
        let scheduler =
            scheduler(Config::default(), repo, CarrierClients::new().with(carrier.clone()), Arc::new(Metrics::new()));

        let report = scheduler.run_tick().await;
        assert_eq!(report.selected, 0);
        assert_eq!(carrier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_policy_skips_cache_fresh_codes() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        seed(&repo, &[("AB00000000001CD", Carrier::Acme), ("AB00000000002CD", Carrier::Acme)]).await;

        let cache = Arc::new(LastCheckCache::new(Duration::from_secs(300)));
        cache.record("AB00000000001CD");

        let carrier = Arc::new(SlowCarrier::new(Carrier::Acme));
        let config = Config::default()
            .with_scheduler(SchedulerConfig { selection: SelectionPolicy::All, ..SchedulerConfig::default() });
        let scheduler = scheduler_with(
            config,
            repo,
            CarrierClients::new().with(carrier.clone()),
            Arc::new(Metrics::new()),
            SchedulerOptions { cache: Some(cache), ..SchedulerOptions::default() },
        );

        let report = scheduler.run_tick().await;
        assert_eq!(report.selected, 2);
        assert_eq!(report.skipped_fresh, 1);
        assert_eq!(carrier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_joins() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let scheduler = scheduler(Config::default(), repo, CarrierClients::new(), Arc::new(Metrics::new()));

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        // stopping twice is harmless
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_maintenance_prunes_old_events() {
        let repo = Arc::new(InMemoryTrackingRepository::new());
        let now = Utc::now();
        let strategy = IntervalStrategy::default();
        let mut tracking =
            TrackingCode::create("AB00000000001CD", Carrier::Acme, TrackingMetadata::default(), now, &strategy)
                .unwrap();
        tracking.append_events(
            vec![
                TrackingEvent::new(now - ChronoDuration::days(200), TrackingStatus::Pending),
                TrackingEvent::new(now - ChronoDuration::days(120), TrackingStatus::InTransit),
                TrackingEvent::new(now - ChronoDuration::days(1), TrackingStatus::InTransit),
            ],
            now,
            &strategy,
        );
        repo.upsert(&tracking).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.jsonl");
        let metrics = Arc::new(Metrics::new());
        let scheduler = scheduler_with(
            Config::default(),
            repo.clone(),
            CarrierClients::new(),
            metrics.clone(),
            SchedulerOptions { snapshot: Some((repo.clone(), path.clone())), ..SchedulerOptions::default() },
        );

        let report = scheduler.run_maintenance().await.unwrap();
        assert_eq!(report.events_removed, 2);
        assert_eq!(metrics.snapshot().events_pruned_total, 2);
        assert!(path.exists());

        let stored = repo.find_by_code(tracking.code()).await.unwrap().unwrap();
        assert_eq!(stored.events().len(), 1);
    }

    #[test]
    fn test_next_maintenance_at() {
        let before = Utc.with_ymd_and_hms(2024, 3, 10, 1, 30, 0).unwrap();
        assert_eq!(next_maintenance_at(before, 2), Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap());

        let after = Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap();
        assert_eq!(next_maintenance_at(after, 2), Utc.with_ymd_and_hms(2024, 3, 11, 2, 0, 0).unwrap());
    }
}
