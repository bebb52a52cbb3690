//! Full-catalog scrape of one source.
//!
//! [`Executor::execute`] owns every transition of a [`ScrapeJob`]:
//!
//! 1. refuse to start when the source already has a running job
//!    ([`Dispatch::Skipped`]);
//! 2. create the job as `running` and rotate the source's device
//!    fingerprint;
//! 3. authenticate, list categories, refresh offers (offer failures are
//!    counted but never abort the job);
//! 4. walk every category page by page, resuming from the stored
//!    [`Checkpoint`] when one exists. Each page is retried through
//!    [`retry::run`] and its products are handed to the reconciliation
//!    engine before the next page is requested;
//! 5. close the job and emit its [`JobOutcome`].
//!
//! Final state:
//!
//! | Walk ended with | State |
//! |-----------------|-------|
//! | auth / schema failure, or retries exhausted before the first category | `failed` |
//! | no successful page | `failed` |
//! | cancellation | `partially_succeeded` (reason `cancelled`) |
//! | some failed pages | `partially_succeeded` |
//! | everything fetched | `succeeded` |
//!
//! The checkpoint is cleared only when the walk reaches the end of the
//! catalog; a cancelled, aborted, or crashed job leaves it for the next
//! run to resume from.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::adapter::{PageCursor, ScraperAdapter};
use crate::cancel::CancelSignal;
use crate::client::RateLimitedClient;
use crate::config::Config;
use crate::error::{ErrorKind, ScrapeError};
use crate::models::{Category, JobOutcome, JobState, ScrapeJob};
use crate::reconcile::ReconciliationEngine;
use crate::retry::{self, RetryPolicy};
use crate::store::{Checkpoint, Store};

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed(JobOutcome),
    /// The source already had a running job.
    Skipped { source: String },
}

impl Dispatch {
    pub fn outcome(&self) -> Option<&JobOutcome> {
        match self {
            Self::Completed(outcome) => Some(outcome),
            Self::Skipped { .. } => None,
        }
    }
}

/// How the catalog walk ended, before it is mapped to a job state.
enum WalkEnd {
    Finished,
    Cancelled,
    Aborted(ScrapeError),
}

pub struct Executor {
    store: Arc<dyn Store>,
    engine: Arc<ReconciliationEngine>,
    client: Option<Arc<RateLimitedClient>>,
    policy: RetryPolicy,
    max_consecutive_page_failures: u32,
    running: Mutex<HashSet<String>>,
}

/// Removes the source from the running set when the job ends.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    source: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.source);
        }
    }
}

impl Executor {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<ReconciliationEngine>,
        policy: RetryPolicy,
        max_consecutive_page_failures: u32,
    ) -> Self {
        Self {
            store,
            engine,
            client: None,
            policy,
            max_consecutive_page_failures: max_consecutive_page_failures.max(1),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        engine: Arc<ReconciliationEngine>,
        client: Arc<RateLimitedClient>,
    ) -> Self {
        Self::new(
            store,
            engine,
            RetryPolicy::from_config(&config.retry),
            config.retry.max_consecutive_page_failures,
        )
        .with_client(client)
    }

    /// Rotate fingerprints on this client at the start of every job.
    pub fn with_client(mut self, client: Arc<RateLimitedClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn is_running(&self, source: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(source))
            .unwrap_or(false)
    }

    fn try_claim(&self, source: &str) -> Result<Option<RunningGuard<'_>>> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("running-job set lock poisoned"))?;
        if !running.insert(source.to_string()) {
            return Ok(None);
        }
        Ok(Some(RunningGuard {
            running: &self.running,
            source: source.to_string(),
        }))
    }

    #[tracing::instrument(skip_all, fields(source = %adapter.source()))]
    pub async fn execute(&self, adapter: &dyn ScraperAdapter, cancel: CancelSignal) -> Result<Dispatch> {
        let source = adapter.source().to_string();
        let Some(_guard) = self.try_claim(&source)? else {
            tracing::info!("previous job still running, trigger skipped");
            return Ok(Dispatch::Skipped { source });
        };
        let running = self.store.running_jobs().await?;
        if let Some(stale) = running.iter().find(|j| j.source == source) {
            tracing::warn!(job_id = %stale.id, "store already has a running job for this source, trigger skipped");
            return Ok(Dispatch::Skipped { source });
        }

        let started = Instant::now();
        let mut job = ScrapeJob::start(&source, Utc::now());
        self.store.create_job(&job).await?;
        tracing::info!(job_id = %job.id, "scrape job started");

        if let Some(client) = &self.client {
            if let Err(e) = client.rotate_fingerprint(&source) {
                tracing::debug!(error = %e, "no fingerprint to rotate");
            }
        }

        let mut last_page_error = None;
        let walk = self.walk(adapter, &mut job, &cancel, &mut last_page_error).await;
        match walk {
            Ok(end) => close_job(&mut job, end, last_page_error),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "scrape job aborted by a storage error");
                job.state = JobState::Failed;
                job.error_kind = Some(ErrorKind::Storage);
                job.reason = Some(format!("{e:#}"));
            }
        }
        job.finished_at = Some(Utc::now());
        self.store.update_job(&job).await?;

        let outcome = JobOutcome::from_job(&job, started.elapsed());
        outcome.emit();
        Ok(Dispatch::Completed(outcome))
    }

    async fn walk(
        &self,
        adapter: &dyn ScraperAdapter,
        job: &mut ScrapeJob,
        cancel: &CancelSignal,
        last_page_error: &mut Option<ScrapeError>,
    ) -> Result<WalkEnd> {
        let source = adapter.source().to_string();

        if let Err(e) = self.fetch(cancel, "authenticate", || adapter.authenticate()).await {
            return Ok(abort_or_cancel(e));
        }

        let categories = match self.fetch(cancel, "categories", || adapter.list_categories()).await {
            Ok(categories) => categories,
            Err(e) => return Ok(abort_or_cancel(e)),
        };
        self.store.upsert_categories(&categories, Utc::now()).await?;
        tracing::info!(categories = categories.len(), "categories listed");

        match self.fetch(cancel, "offers", || adapter.list_offers()).await {
            Ok(offers) => {
                self.store.upsert_offers(&offers, Utc::now()).await?;
            }
            Err(ScrapeError::Cancelled) => return Ok(WalkEnd::Cancelled),
            Err(e) => {
                job.counts.errors += 1;
                tracing::warn!(error = %e, "offer listing failed, continuing with products");
            }
        }

        let (start_index, mut resume) = self.resume_point(&source, &categories).await?;

        for (index, category) in categories.iter().enumerate().skip(start_index) {
            let mut cursor = resume.take().unwrap_or_else(PageCursor::first);
            let mut consecutive_failures = 0;

            loop {
                if cancel.is_cancelled() {
                    return Ok(WalkEnd::Cancelled);
                }
                let label = format!("{}:{}", category.source_category_id, cursor.page);
                let next = match self
                    .fetch(cancel, &label, || adapter.list_products(category, &cursor))
                    .await
                {
                    Ok(page) => {
                        consecutive_failures = 0;
                        job.counts.pages_ok += 1;
                        job.counts.items_fetched += page.items.len() as u64;
                        for product in &page.items {
                            let ingested = self.engine.ingest(product, Some(&job.id), Utc::now()).await?;
                            job.counts.items_written += 1;
                            job.counts.price_changes += ingested.price_changes as u64;
                        }
                        page.next
                    }
                    Err(ScrapeError::Cancelled) => return Ok(WalkEnd::Cancelled),
                    Err(e) if e.is_fatal() => return Ok(WalkEnd::Aborted(e)),
                    Err(e) => {
                        consecutive_failures += 1;
                        job.counts.pages_failed += 1;
                        job.counts.errors += 1;
                        tracing::warn!(page = %label, error = %e, "page failed after retries");
                        *last_page_error = Some(e);
                        if consecutive_failures >= self.max_consecutive_page_failures {
                            tracing::warn!(
                                category = %category.source_category_id,
                                consecutive_failures,
                                "giving up on category"
                            );
                            None
                        } else {
                            cursor.skip_failed()
                        }
                    }
                };
                self.store.update_job(job).await?;

                match next {
                    Some(next) => {
                        cursor = next;
                        self.checkpoint(&source, job, index, category, &cursor).await?;
                    }
                    None => break,
                }
            }

            if let Some(following) = categories.get(index + 1) {
                self.checkpoint(&source, job, index + 1, following, &PageCursor::first())
                    .await?;
            }
        }

        self.store.clear_checkpoint(&source).await?;
        Ok(WalkEnd::Finished)
    }

    /// Run `op` with retries, giving up early when `cancel` fires.
    async fn fetch<T, F, Fut>(&self, cancel: &CancelSignal, label: &str, mut op: F) -> Result<T, ScrapeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
    {
        let mut signal = cancel.clone();
        let outcome = tokio::select! {
            outcome = retry::run(&self.policy, cancel, label, |_| op()) => outcome,
            _ = signal.cancelled() => return Err(ScrapeError::Cancelled),
        };
        if outcome.attempts() > 1 {
            tracing::debug!(
                label,
                attempts = outcome.attempts(),
                backoff_ms = outcome.backoff().as_millis() as u64,
                "request needed retries"
            );
        }
        outcome.into_result()
    }

    async fn resume_point(
        &self,
        source: &str,
        categories: &[Category],
    ) -> Result<(usize, Option<PageCursor>)> {
        let Some(checkpoint) = self.store.get_checkpoint(source).await? else {
            return Ok((0, None));
        };
        match categories
            .iter()
            .position(|c| c.source_category_id == checkpoint.category_id)
        {
            Some(index) => {
                tracing::info!(
                    from_job = %checkpoint.job_id,
                    category = %checkpoint.category_id,
                    page = checkpoint.cursor.page,
                    "resuming from checkpoint"
                );
                Ok((index, Some(checkpoint.cursor)))
            }
            None => {
                tracing::info!(
                    category = %checkpoint.category_id,
                    "checkpoint category no longer listed, starting over"
                );
                Ok((0, None))
            }
        }
    }

    async fn checkpoint(
        &self,
        source: &str,
        job: &ScrapeJob,
        index: usize,
        category: &Category,
        cursor: &PageCursor,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            job_id: job.id.clone(),
            category_index: index,
            category_id: category.source_category_id.clone(),
            cursor: cursor.clone(),
        };
        self.store.set_checkpoint(source, &checkpoint).await
    }
}

fn abort_or_cancel(error: ScrapeError) -> WalkEnd {
    match error {
        ScrapeError::Cancelled => WalkEnd::Cancelled,
        other => WalkEnd::Aborted(other),
    }
}

fn close_job(job: &mut ScrapeJob, end: WalkEnd, last_page_error: Option<ScrapeError>) {
    let counts = &job.counts;
    let (state, kind, reason) = match end {
        WalkEnd::Aborted(e) => (JobState::Failed, Some(e.kind()), Some(e.to_string())),
        WalkEnd::Cancelled => (
            JobState::PartiallySucceeded,
            Some(ErrorKind::Cancelled),
            Some("cancelled".to_string()),
        ),
        WalkEnd::Finished if counts.pages_ok == 0 => (
            JobState::Failed,
            last_page_error.as_ref().map(ScrapeError::kind),
            Some(match &last_page_error {
                Some(e) => format!("no page succeeded, last error: {e}"),
                None => "no product pages listed".to_string(),
            }),
        ),
        WalkEnd::Finished if counts.pages_failed > 0 => (
            JobState::PartiallySucceeded,
            last_page_error.as_ref().map(ScrapeError::kind),
            Some(format!(
                "{} of {} pages failed",
                counts.pages_failed,
                counts.pages_ok + counts.pages_failed
            )),
        ),
        WalkEnd::Finished => (JobState::Succeeded, None, None),
    };
    job.state = state;
    job.error_kind = kind;
    job.reason = reason;
}

/// Close jobs left `running` by a previous process. Their ingested data is
/// kept; the jobs end as `partially_succeeded` with reason `interrupted`.
pub async fn recover_interrupted(store: &dyn Store) -> Result<usize> {
    let running = store.running_jobs().await?;
    let now = Utc::now();
    for job in &running {
        let mut job = job.clone();
        job.state = JobState::PartiallySucceeded;
        job.finished_at = Some(now);
        job.reason = Some("interrupted".to_string());
        store.update_job(&job).await?;
        tracing::warn!(job_id = %job.id, source = %job.source, "closed interrupted job");
    }
    Ok(running.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Page;
    use crate::config::AdapterKind;
    use crate::models::{CanonicalProduct, Offer, UnitVariant};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    type Scripted = Result<Page<CanonicalProduct>, ScrapeError>;

    /// Adapter replaying scripted pages. Unscripted pages are empty and last.
    struct ScriptedAdapter {
        categories: Vec<Category>,
        auth_error: Option<ScrapeError>,
        pages: Mutex<HashMap<(String, u32), VecDeque<Scripted>>>,
        calls: Mutex<Vec<(String, u32)>>,
        hang_on: Option<(String, u32)>,
        hold_categories: Option<Arc<tokio::sync::Notify>>,
    }

    impl ScriptedAdapter {
        fn new(categories: &[&str]) -> Self {
            Self {
                categories: categories
                    .iter()
                    .map(|id| Category {
                        source: "alpha".into(),
                        source_category_id: id.to_string(),
                        name: id.to_string(),
                        parent_id: None,
                    })
                    .collect(),
                auth_error: None,
                pages: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                hang_on: None,
                hold_categories: None,
            }
        }

        fn script(self, category: &str, page: u32, result: Scripted) -> Self {
            self.pages
                .lock()
                .unwrap()
                .entry((category.to_string(), page))
                .or_default()
                .push_back(result);
            self
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScraperAdapter for ScriptedAdapter {
        fn source(&self) -> &str {
            "alpha"
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::PagedRest
        }

        async fn authenticate(&self) -> Result<(), ScrapeError> {
            match &self.auth_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn list_categories(&self) -> Result<Vec<Category>, ScrapeError> {
            if let Some(gate) = &self.hold_categories {
                gate.notified().await;
            }
            Ok(self.categories.clone())
        }

        async fn list_products(
            &self,
            category: &Category,
            cursor: &PageCursor,
        ) -> Result<Page<CanonicalProduct>, ScrapeError> {
            let key = (category.source_category_id.clone(), cursor.page);
            self.calls.lock().unwrap().push(key.clone());
            if self.hang_on.as_ref() == Some(&key) {
                std::future::pending::<()>().await;
            }
            let scripted = self.pages.lock().unwrap().get_mut(&key).and_then(VecDeque::pop_front);
            scripted.unwrap_or_else(|| Ok(Page::last(Vec::new())))
        }

        async fn list_offers(&self) -> Result<Vec<Offer>, ScrapeError> {
            Ok(Vec::new())
        }
    }

    fn item(id: &str, price: i64) -> CanonicalProduct {
        CanonicalProduct {
            source: "alpha".into(),
            source_product_id: id.into(),
            name: id.into(),
            barcode: None,
            category_id: None,
            variants: vec![UnitVariant {
                unit: "piece".into(),
                price,
                original_price: None,
                quantity: None,
                available: true,
            }],
            offer_ids: vec![],
        }
    }

    fn page(items: &[&str], next: Option<u32>) -> Scripted {
        Ok(Page {
            items: items.iter().map(|id| item(id, 100)).collect(),
            next: next.map(PageCursor::numbered),
        })
    }

    fn executor() -> (Executor, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = Arc::new(ReconciliationEngine::new(store.clone()));
        let policy = RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::from_millis(100),
            max_retry_after: Duration::from_secs(5),
        };
        (Executor::new(store.clone(), engine, policy, 2), store)
    }

    fn completed(dispatch: Dispatch) -> JobOutcome {
        match dispatch {
            Dispatch::Completed(outcome) => outcome,
            Dispatch::Skipped { source } => panic!("job for {source} was skipped"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_walk_succeeds() {
        let (executor, store) = executor();
        let adapter = ScriptedAdapter::new(&["c1", "c2"])
            .script("c1", 1, page(&["p1", "p2"], Some(2)))
            .script("c1", 2, page(&["p3"], None))
            .script("c2", 1, page(&["p4"], None));

        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.counts.pages_ok, 3);
        assert_eq!(outcome.counts.items_written, 4);
        assert_eq!(outcome.counts.price_changes, 4);
        assert!(store.get_checkpoint("alpha").await.unwrap().is_none());

        let job = store.get_job(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_page_error_is_retried() {
        let (executor, _) = executor();
        let adapter = ScriptedAdapter::new(&["c1"])
            .script("c1", 1, Err(ScrapeError::Transport("reset".into())))
            .script("c1", 1, page(&["p1"], None));

        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.counts.pages_failed, 0);
        assert_eq!(adapter.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_page_is_skipped_and_job_partial() {
        let (executor, _) = executor();
        let limited = || Err(ScrapeError::RateLimited { retry_after: None });
        let adapter = ScriptedAdapter::new(&["c1"])
            .script("c1", 1, limited())
            .script("c1", 1, limited())
            .script("c1", 1, limited())
            .script("c1", 2, page(&["p1"], None));

        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::PartiallySucceeded);
        assert_eq!(outcome.counts.pages_failed, 1);
        assert_eq!(outcome.counts.pages_ok, 1);
        assert_eq!(outcome.counts.errors, 1);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RateLimited));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_successful_pages_fails() {
        let (executor, _) = executor();
        let mut adapter = ScriptedAdapter::new(&["c1"]);
        for page in 1..=2 {
            for _ in 0..3 {
                adapter = adapter.script("c1", page, Err(ScrapeError::Timeout("30s".into())));
            }
        }
        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.counts.pages_failed, 2);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(adapter.calls().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_fails_without_walking() {
        let (executor, _) = executor();
        let mut adapter = ScriptedAdapter::new(&["c1"]);
        adapter.auth_error = Some(ScrapeError::AuthFailed("bad password".into()));

        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::AuthFailed));
        assert!(outcome.needs_operator);
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_change_aborts_but_keeps_ingested_pages() {
        let (executor, store) = executor();
        let adapter = ScriptedAdapter::new(&["c1"])
            .script("c1", 1, page(&["p1"], Some(2)))
            .script("c1", 2, Err(ScrapeError::missing_field("price", "product")));

        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::UpstreamSchemaChanged));
        assert_eq!(adapter.calls().len(), 2);
        assert!(store.find_product("alpha", "p1").await.unwrap().is_some());
        assert!(store.get_checkpoint("alpha").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_for_running_source_is_skipped() {
        let (executor, store) = executor();
        let executor = Arc::new(executor);
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut adapter = ScriptedAdapter::new(&["c1"]).script("c1", 1, page(&["p1"], None));
        adapter.hold_categories = Some(gate.clone());
        let adapter = Arc::new(adapter);

        let first = {
            let executor = executor.clone();
            let adapter = adapter.clone();
            tokio::spawn(async move { executor.execute(adapter.as_ref(), CancelSignal::never()).await })
        };
        while !executor.is_running("alpha") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = executor.execute(adapter.as_ref(), CancelSignal::never()).await.unwrap();
        assert_eq!(second, Dispatch::Skipped { source: "alpha".into() });
        assert_eq!(store.running_jobs().await.unwrap().len(), 1);

        gate.notify_one();
        let first = completed(first.await.unwrap().unwrap());
        assert_eq!(first.state, JobState::Succeeded);
        assert!(!executor.is_running("alpha"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_job_as_partial_and_keeps_data() {
        let (executor, store) = executor();
        let executor = Arc::new(executor);
        let mut adapter = ScriptedAdapter::new(&["c1"]).script("c1", 1, page(&["p1"], Some(2)));
        adapter.hang_on = Some(("c1".into(), 2));
        let adapter = Arc::new(adapter);
        let handle = crate::cancel::CancelHandle::new();

        let task = {
            let executor = executor.clone();
            let adapter = adapter.clone();
            let signal = handle.signal();
            tokio::spawn(async move { executor.execute(adapter.as_ref(), signal).await })
        };
        while adapter.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel();

        let outcome = completed(task.await.unwrap().unwrap());
        assert_eq!(outcome.state, JobState::PartiallySucceeded);
        assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
        assert_eq!(outcome.counts.pages_ok, 1);
        assert!(store.find_product("alpha", "p1").await.unwrap().is_some());
        let checkpoint = store.get_checkpoint("alpha").await.unwrap().unwrap();
        assert_eq!(checkpoint.cursor, PageCursor::numbered(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_checkpoint() {
        let (executor, store) = executor();
        store
            .set_checkpoint(
                "alpha",
                &Checkpoint {
                    job_id: "earlier".into(),
                    category_index: 1,
                    category_id: "c2".into(),
                    cursor: PageCursor::numbered(3),
                },
            )
            .await
            .unwrap();
        let adapter = ScriptedAdapter::new(&["c1", "c2", "c3"]).script("c2", 3, page(&["p9"], None));

        let outcome = completed(executor.execute(&adapter, CancelSignal::never()).await.unwrap());
        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(
            adapter.calls(),
            vec![("c2".to_string(), 3), ("c3".to_string(), 1)]
        );
        assert!(store.get_checkpoint("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted_closes_running_jobs() {
        let store = InMemoryStore::new();
        let job = ScrapeJob::start("alpha", Utc::now());
        store.create_job(&job).await.unwrap();

        assert_eq!(recover_interrupted(&store).await.unwrap(), 1);
        let closed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(closed.state, JobState::PartiallySucceeded);
        assert_eq!(closed.reason.as_deref(), Some("interrupted"));
        assert!(store.running_jobs().await.unwrap().is_empty());
    }
}
