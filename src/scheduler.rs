//! Time-driven dispatch of scrapes, token sweeps, and retention cleanup.
//!
//! A [`Trigger`] is a pure time function: given an instant it returns the
//! next instant it fires. The [`Scheduler`] keeps one entry per recurring
//! task and, on every [`Scheduler::tick`], starts each due task on its own
//! tokio task so a long scrape never delays the dispatch loop.
//!
//! Scrapes are staggered by giving every source its own minute of the hour.
//! A scrape whose source is still running when its trigger fires is skipped
//! and logged, not queued.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::adapter::AdapterSet;
use crate::cancel::CancelHandle;
use crate::config::Config;
use crate::executor::{Dispatch, Executor};
use crate::history;
use crate::store::Store;
use crate::tokens::TokenManager;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Minute `minute` of every hour.
    HourlyAt { minute: u32 },
    /// Every `Duration`, aligned to the Unix epoch.
    Every(Duration),
    /// Once a day at `hour:minute` UTC.
    DailyAt { hour: u32, minute: u32 },
}

impl Trigger {
    /// First firing instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let next = match *self {
            Self::HourlyAt { minute } => {
                let offset = i64::from(minute.min(59)) * 60;
                aligned_after(secs, HOUR_SECS, offset, t)
            }
            Self::DailyAt { hour, minute } => {
                let offset = i64::from(hour.min(23)) * HOUR_SECS + i64::from(minute.min(59)) * 60;
                aligned_after(secs, DAY_SECS, offset, t)
            }
            Self::Every(period) => {
                let period = i64::try_from(period.as_secs()).unwrap_or(i64::MAX).max(1);
                (secs.div_euclid(period) + 1).saturating_mul(period)
            }
        };
        DateTime::<Utc>::from_timestamp(next, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// `start_of_period(secs) + offset`, moved one period later unless it lies
/// strictly after `t`.
fn aligned_after(secs: i64, period: i64, offset: i64, t: DateTime<Utc>) -> i64 {
    let candidate = secs - secs.rem_euclid(period) + offset;
    match DateTime::<Utc>::from_timestamp(candidate, 0) {
        Some(at) if at > t => candidate,
        _ => candidate.saturating_add(period),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Scrape(String),
    TokenSweep,
    Cleanup,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scrape(source) => write!(f, "scrape:{source}"),
            Self::TokenSweep => f.write_str("token-sweep"),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// What a tick did with one due entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired {
    Dispatched(Task),
    /// The source's previous scrape is still running.
    Skipped(Task),
}

struct Entry {
    task: Task,
    trigger: Trigger,
    next_run: DateTime<Utc>,
}

pub struct Scheduler {
    entries: Vec<Entry>,
    executor: Arc<Executor>,
    adapters: AdapterSet,
    tokens: Arc<TokenManager>,
    store: Arc<dyn Store>,
    retention_days: u32,
    poll_interval: Duration,
    cancel: CancelHandle,
    running: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<Executor>,
        adapters: AdapterSet,
        tokens: Arc<TokenManager>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            entries: Vec::new(),
            executor,
            adapters,
            tokens,
            store,
            retention_days: 90,
            poll_interval: Duration::from_secs(20),
            cancel: CancelHandle::new(),
            running: JoinSet::new(),
        }
    }

    /// Register the standard recurring triggers: one hourly scrape per
    /// adapter at its source's minute, the token sweep, and daily cleanup.
    pub fn with_config(mut self, config: &Config, now: DateTime<Utc>) -> Self {
        self.retention_days = config.schedule.retention_days;
        self.poll_interval = Duration::from_secs(config.schedule.poll_secs.max(1));

        let sources: Vec<String> = self.adapters.keys().cloned().collect();
        for source in sources {
            let minute = config.sources.get(&source).map_or(0, |s| s.minute);
            self.add(Task::Scrape(source), Trigger::HourlyAt { minute }, now);
        }
        self.add(
            Task::TokenSweep,
            Trigger::Every(Duration::from_secs(config.schedule.token_sweep_minutes.max(1) * 60)),
            now,
        );
        self.add(
            Task::Cleanup,
            Trigger::DailyAt {
                hour: config.schedule.cleanup_hour,
                minute: config.schedule.cleanup_minute,
            },
            now,
        );
        self
    }

    pub fn add(&mut self, task: Task, trigger: Trigger, now: DateTime<Utc>) {
        let next_run = trigger.next_after(now);
        tracing::debug!(task = %task, next_run = %next_run, "scheduled");
        self.entries.push(Entry {
            task,
            trigger,
            next_run,
        });
    }

    pub fn next_runs(&self) -> Vec<(Task, DateTime<Utc>)> {
        self.entries
            .iter()
            .map(|e| (e.task.clone(), e.next_run))
            .collect()
    }

    /// Number of dispatched tasks that have not been reaped yet.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Start every entry due at `now`. Entries are rescheduled from `now`, so
    /// a long pause fires each task once rather than replaying the backlog.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Fired> {
        let mut fired = Vec::new();
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.next_run <= now {
                entry.next_run = entry.trigger.next_after(now);
                due.push(entry.task.clone());
            }
        }
        for task in due {
            fired.push(self.dispatch(task, now));
        }
        fired
    }

    fn dispatch(&mut self, task: Task, now: DateTime<Utc>) -> Fired {
        match &task {
            Task::Scrape(source) => {
                let Some(adapter) = self.adapters.get(source).cloned() else {
                    tracing::warn!(source = %source, "no adapter for scheduled source");
                    return Fired::Skipped(task.clone());
                };
                if self.executor.is_running(source) {
                    tracing::info!(source = %source, "previous scrape still running, trigger skipped");
                    return Fired::Skipped(task.clone());
                }
                let executor = self.executor.clone();
                let signal = self.cancel.signal();
                self.running.spawn(async move {
                    match executor.execute(adapter.as_ref(), signal).await {
                        Ok(Dispatch::Completed(_)) | Ok(Dispatch::Skipped { .. }) => {}
                        Err(e) => tracing::error!(source = %adapter.source(), error = %e, "scrape job errored"),
                    }
                });
            }
            Task::TokenSweep => {
                let tokens = self.tokens.clone();
                self.running.spawn(async move {
                    let refreshed = tokens.refresh_sweep().await;
                    tracing::info!(refreshed = refreshed.len(), "token sweep finished");
                });
            }
            Task::Cleanup => {
                let store = self.store.clone();
                let retention_days = self.retention_days;
                self.running.spawn(async move {
                    if let Err(e) = history::prune(store.as_ref(), retention_days, now).await {
                        tracing::error!(error = %e, "retention cleanup failed");
                    }
                });
            }
        }
        tracing::info!(task = %task, "dispatched");
        Fired::Dispatched(task)
    }

    /// Dispatch loop. Returns after `shutdown` flips to `true` and every
    /// running task has finished.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(entries = self.entries.len(), "scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "scheduled task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Wait for every dispatched task to finish on its own.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "scheduled task panicked");
            }
        }
    }

    /// Cancel running jobs and wait for them to close.
    pub async fn shutdown(&mut self) {
        tracing::info!(in_flight = self.running.len(), "scheduler shutting down");
        self.cancel.cancel();
        self.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Page, PageCursor, ScraperAdapter};
    use crate::config::AdapterKind;
    use crate::error::ScrapeError;
    use crate::models::{CanonicalProduct, Category, JobState, Offer};
    use crate::reconcile::ReconciliationEngine;
    use crate::retry::RetryPolicy;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_hourly_trigger() {
        let t = Trigger::HourlyAt { minute: 15 };
        assert_eq!(t.next_after(at(10, 10, 0)), at(10, 15, 0));
        assert_eq!(t.next_after(at(10, 15, 0)), at(11, 15, 0));
        assert_eq!(t.next_after(at(10, 20, 30)), at(11, 15, 0));
        assert_eq!(
            t.next_after(at(23, 50, 0)),
            Utc.with_ymd_and_hms(2024, 5, 11, 0, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_every_trigger_is_epoch_aligned() {
        let t = Trigger::Every(Duration::from_secs(25 * 60));
        let first = t.next_after(at(10, 0, 0));
        assert!(first > at(10, 0, 0));
        assert_eq!(first.timestamp() % (25 * 60), 0);
        assert_eq!(t.next_after(first), first + chrono::Duration::minutes(25));
    }

    #[test]
    fn test_daily_trigger() {
        let t = Trigger::DailyAt { hour: 3, minute: 0 };
        assert_eq!(t.next_after(at(2, 59, 59)), at(3, 0, 0));
        assert_eq!(
            t.next_after(at(3, 0, 0)),
            Utc.with_ymd_and_hms(2024, 5, 11, 3, 0, 0).unwrap()
        );
    }

    /// One category, one product; blocks in `list_products` when `hang` is set.
    struct OneProduct {
        hang: bool,
    }

    #[async_trait]
    impl ScraperAdapter for OneProduct {
        fn source(&self) -> &str {
            "alpha"
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Zahcode
        }

        async fn authenticate(&self) -> Result<(), ScrapeError> {
            Ok(())
        }

        async fn list_categories(&self) -> Result<Vec<Category>, ScrapeError> {
            Ok(vec![Category {
                source: "alpha".into(),
                source_category_id: "c1".into(),
                name: "Rice".into(),
                parent_id: None,
            }])
        }

        async fn list_products(
            &self,
            _category: &Category,
            _cursor: &PageCursor,
        ) -> Result<Page<CanonicalProduct>, ScrapeError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(Page::last(vec![CanonicalProduct {
                source: "alpha".into(),
                source_product_id: "p1".into(),
                name: "Rice".into(),
                barcode: None,
                category_id: None,
                variants: vec![],
                offer_ids: vec![],
            }]))
        }

        async fn list_offers(&self) -> Result<Vec<Offer>, ScrapeError> {
            Ok(vec![])
        }
    }

    fn scheduler(hang: bool) -> (Scheduler, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = Arc::new(ReconciliationEngine::new(store.clone()));
        let policy = RetryPolicy {
            max_attempts: 1,
            min_backoff: Duration::from_millis(10),
            max_retry_after: Duration::from_secs(1),
        };
        let executor = Arc::new(Executor::new(store.clone(), engine, policy, 1));
        let mut adapters = AdapterSet::new();
        adapters.insert("alpha".into(), Arc::new(OneProduct { hang }) as Arc<dyn ScraperAdapter>);
        let tokens = Arc::new(TokenManager::new(store.clone()));
        (Scheduler::new(executor, adapters, tokens, store.clone()), store)
    }

    #[tokio::test]
    async fn test_tick_fires_due_entries_once() {
        let (mut scheduler, store) = scheduler(false);
        scheduler.add(Task::Scrape("alpha".into()), Trigger::HourlyAt { minute: 5 }, at(9, 0, 0));

        assert!(scheduler.tick(at(9, 4, 0)).is_empty());
        assert_eq!(
            scheduler.tick(at(9, 5, 0)),
            vec![Fired::Dispatched(Task::Scrape("alpha".into()))]
        );
        assert!(scheduler.tick(at(9, 6, 0)).is_empty());
        assert_eq!(scheduler.next_runs()[0].1, at(10, 5, 0));

        scheduler.wait_idle().await;
        let jobs = store.list_jobs(Some("alpha"), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped_and_shutdown_cancels() {
        let (mut scheduler, store) = scheduler(true);
        scheduler.add(Task::Scrape("alpha".into()), Trigger::HourlyAt { minute: 0 }, at(8, 30, 0));

        assert_eq!(
            scheduler.tick(at(9, 0, 0)),
            vec![Fired::Dispatched(Task::Scrape("alpha".into()))]
        );
        while store.running_jobs().await.unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            scheduler.tick(at(10, 0, 0)),
            vec![Fired::Skipped(Task::Scrape("alpha".into()))]
        );

        scheduler.shutdown().await;
        assert_eq!(scheduler.in_flight(), 0);
        let jobs = store.list_jobs(Some("alpha"), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::PartiallySucceeded);
        assert_eq!(jobs[0].reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_with_config_staggers_sources() {
        let (scheduler, _) = scheduler(false);
        let config = crate::config::parse_config(
            r#"
            [db]
            path = "./data/pricewatch.sqlite"

            [sources.alpha]
            adapter = "zahcode"
            base_url = "https://alpha.example/api/"
            minute = 20
            username_env = "ALPHA_USER"
            password_env = "ALPHA_PASS"
            "#,
        )
        .unwrap();
        let scheduler = scheduler.with_config(&config, at(9, 0, 0));
        let runs = scheduler.next_runs();
        assert!(runs.contains(&(Task::Scrape("alpha".into()), at(9, 20, 0))));
        assert!(runs.contains(&(Task::Cleanup, Utc.with_ymd_and_hms(2024, 5, 11, 3, 0, 0).unwrap())));
        assert!(runs.iter().any(|(task, _)| *task == Task::TokenSweep));
    }
}
