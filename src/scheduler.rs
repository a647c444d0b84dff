//! Fetch Scheduler: bounded-concurrency page fetching with dynamic
//! pagination discovery.
//!
//! # Architecture
//!
//! - `concurrency` workers pull page indices from a shared task channel
//! - each worker fetches its page, persists it, then reports on a result channel
//! - the coordinator keeps at most `concurrency` pages in flight, refilling the
//!   window as results arrive and sleeping `pause` between polling cycles
//!
//! The total page count is unknown up front. New indices are issued in
//! increasing order until a terminal page is seen; from then on nothing past
//! the lowest terminal index is issued. Pages already in flight beyond it are
//! allowed to finish: successes are kept, failures are ignored.
//!
//! The first fetch or checkpoint failure stops all further dispatch. Pages in
//! flight settle normally, so every page that succeeded stays persisted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore, QuerySignature, ResumeState};
use crate::config::Server;
use crate::fetch::{FetchError, PageFetcher, PageQuery};

/// Advisory progress snapshot, emitted after every completed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    /// Server being fetched.
    pub server: Server,
    /// Pages persisted so far, resumed ones included.
    pub pages_done: u64,
    /// `pages_done × page_size`.
    pub estimated_records: u64,
    /// Total declared by the API, once seen.
    pub declared_total: Option<u64>,
}

/// Receiver of progress events. Must not influence the run.
pub trait ProgressSink: Send + Sync {
    /// A server's fetch phase begins with `pages_done` pages already persisted.
    fn server_started(&self, _server: Server, _pages_done: u64) {}

    /// A page was fetched and persisted.
    fn page_completed(&self, progress: &FetchProgress);

    /// A server's records were aggregated.
    fn server_finished(&self, _server: Server, _records: usize) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&FetchProgress) + Send + Sync,
{
    fn page_completed(&self, progress: &FetchProgress) {
        self(progress);
    }
}

/// Progress sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn page_completed(&self, _progress: &FetchProgress) {}
}

/// Errors that end a scheduler run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A page could not be fetched.
    #[error(transparent)]
    Fetch(FetchError),

    /// A fetched page could not be persisted.
    #[error("failed to persist page {page_index}: {source}")]
    Checkpoint {
        /// Page being persisted.
        page_index: u64,
        /// Store failure.
        #[source]
        source: CheckpointError,
    },

    /// Every worker exited while pages were still outstanding.
    #[error("fetch workers stopped before all pages settled")]
    WorkersStopped,
}

impl SchedulerError {
    /// Page that caused the failure, if any.
    #[must_use]
    pub fn page_index(&self) -> Option<u64> {
        match self {
            Self::Fetch(error) => Some(error.page_index()),
            Self::Checkpoint { page_index, .. } => Some(*page_index),
            Self::WorkersStopped => None,
        }
    }
}

/// What one scheduler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Pages fetched and newly persisted by this run.
    pub pages_fetched: u64,
    /// Pages fetched but already persisted by someone else.
    pub pages_already_present: u64,
    /// Records in newly persisted pages.
    pub records_fetched: u64,
    /// Retry attempts made.
    pub retried: u64,
    /// Lowest terminal page index known at the end of the run.
    pub terminal_page: Option<u64>,
}

/// Drives page fetching for one query.
#[derive(Debug, Clone)]
pub struct FetchScheduler {
    fetcher: Arc<PageFetcher>,
    store: CheckpointStore,
    concurrency: usize,
    pause: Duration,
}

impl FetchScheduler {
    /// Creates a scheduler. A `concurrency` of zero is treated as one.
    #[must_use]
    pub fn new(
        fetcher: Arc<PageFetcher>,
        store: CheckpointStore,
        concurrency: usize,
        pause: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            concurrency: concurrency.max(1),
            pause,
        }
    }

    /// Fetches every page not covered by `resume`, persisting each as it
    /// completes.
    ///
    /// Gaps are dispatched first, then new indices from
    /// [`ResumeState::next_new_page`] onward.
    ///
    /// # Errors
    ///
    /// Returns the first [`SchedulerError`] raised by a page within the
    /// known pagination range, after in-flight pages have settled.
    #[instrument(skip(self, query, resume, progress), fields(server = %query.server, signature = %signature))]
    pub async fn run(
        &self,
        query: &PageQuery,
        signature: &QuerySignature,
        resume: &ResumeState,
        progress: &dyn ProgressSink,
    ) -> Result<FetchSummary, SchedulerError> {
        let retried_before = self.fetcher.retried();
        let mut plan = DispatchPlan::new(resume);
        let mut summary = FetchSummary::default();
        let mut pages_done = resume.completed_pages.len() as u64;
        let mut declared_total = None;

        let (task_tx, task_rx) = async_channel::bounded::<u64>(self.concurrency);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<PageOutcome>();
        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            workers.spawn(worker_loop(
                worker_id,
                task_rx.clone(),
                result_tx.clone(),
                Arc::clone(&self.fetcher),
                self.store.clone(),
                query.clone(),
                signature.clone(),
            ));
        }
        drop(task_rx);
        drop(result_tx);

        info!(
            concurrency = self.concurrency,
            gaps = resume.gaps.len(),
            first_new_page = plan.next_new,
            "starting page fetch"
        );

        let mut in_flight = 0usize;
        let mut failures: Vec<SchedulerError> = Vec::new();
        in_flight += dispatch(&task_tx, &mut plan, self.concurrency - in_flight).await?;

        while in_flight > 0 {
            let Some(first) = result_rx.recv().await else {
                return Err(SchedulerError::WorkersStopped);
            };
            let mut outcomes = vec![first];
            while let Ok(outcome) = result_rx.try_recv() {
                outcomes.push(outcome);
            }

            for outcome in outcomes {
                in_flight -= 1;
                match outcome.result {
                    Ok(page) => {
                        if page.is_terminal {
                            plan.observe_terminal(outcome.page_index);
                        }
                        if page.newly_persisted {
                            summary.pages_fetched += 1;
                            summary.records_fetched += page.records as u64;
                        } else {
                            summary.pages_already_present += 1;
                        }
                        declared_total = declared_total.or(page.declared_total);
                        pages_done += 1;
                        progress.page_completed(&FetchProgress {
                            server: query.server,
                            pages_done,
                            estimated_records: pages_done * u64::from(query.page_size),
                            declared_total,
                        });
                    }
                    Err(error) if plan.is_beyond_end(outcome.page_index) => {
                        debug!(page = outcome.page_index, %error, "ignoring failure past the last page");
                    }
                    Err(error) => {
                        if failures.is_empty() {
                            warn!(page = outcome.page_index, %error, "stopping dispatch after page failure");
                        } else {
                            warn!(page = outcome.page_index, %error, "additional page failure");
                        }
                        failures.push(error);
                    }
                }
            }

            if failures.is_empty() {
                in_flight += dispatch(&task_tx, &mut plan, self.concurrency - in_flight).await?;
            }
            if in_flight > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        drop(task_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "fetch worker panicked");
            }
        }

        summary.retried = self.fetcher.retried().saturating_sub(retried_before);
        summary.terminal_page = plan.terminal_bound;

        // The terminal bound may have dropped after a failure was recorded,
        // so only failures inside the final range count.
        let (ignored, failures): (Vec<_>, Vec<_>) = failures
            .into_iter()
            .partition(|error| error.page_index().is_some_and(|page| plan.is_beyond_end(page)));
        for error in &ignored {
            debug!(page = ?error.page_index(), "failure lies past the last page, ignoring");
        }
        if let Some(error) = failures.into_iter().min_by_key(SchedulerError::page_index) {
            return Err(error);
        }

        info!(
            pages_fetched = summary.pages_fetched,
            records = summary.records_fetched,
            retried = summary.retried,
            terminal_page = ?summary.terminal_page,
            "page fetch complete"
        );
        Ok(summary)
    }
}

/// Order in which page indices are issued.
#[derive(Debug)]
struct DispatchPlan {
    backlog: VecDeque<u64>,
    next_new: u64,
    terminal_bound: Option<u64>,
}

impl DispatchPlan {
    fn new(resume: &ResumeState) -> Self {
        Self {
            backlog: resume.gaps.iter().copied().collect(),
            next_new: resume.next_new_page(),
            terminal_bound: resume.terminal_page,
        }
    }

    fn next(&mut self) -> Option<u64> {
        while let Some(index) = self.backlog.pop_front() {
            if !self.is_beyond_end(index) {
                return Some(index);
            }
        }
        if self.is_beyond_end(self.next_new) {
            return None;
        }
        let index = self.next_new;
        self.next_new += 1;
        Some(index)
    }

    fn observe_terminal(&mut self, page_index: u64) {
        let bound = self
            .terminal_bound
            .map_or(page_index, |current| current.min(page_index));
        if self.terminal_bound != Some(bound) {
            debug!(page = bound, "terminal page found");
        }
        self.terminal_bound = Some(bound);
    }

    fn is_beyond_end(&self, page_index: u64) -> bool {
        self.terminal_bound.is_some_and(|bound| page_index > bound)
    }
}

/// Result of one page, reported by a worker.
#[derive(Debug)]
struct PageOutcome {
    page_index: u64,
    result: Result<PersistedPage, SchedulerError>,
}

#[derive(Debug)]
struct PersistedPage {
    records: usize,
    is_terminal: bool,
    declared_total: Option<u64>,
    newly_persisted: bool,
}

async fn dispatch(
    tasks: &async_channel::Sender<u64>,
    plan: &mut DispatchPlan,
    slots: usize,
) -> Result<usize, SchedulerError> {
    let mut sent = 0;
    while sent < slots {
        let Some(page_index) = plan.next() else {
            break;
        };
        tasks
            .send(page_index)
            .await
            .map_err(|_| SchedulerError::WorkersStopped)?;
        debug!(page = page_index, "page dispatched");
        sent += 1;
    }
    Ok(sent)
}

async fn worker_loop(
    worker_id: usize,
    tasks: async_channel::Receiver<u64>,
    results: mpsc::UnboundedSender<PageOutcome>,
    fetcher: Arc<PageFetcher>,
    store: CheckpointStore,
    query: PageQuery,
    signature: QuerySignature,
) {
    while let Ok(page_index) = tasks.recv().await {
        let request = query.request(page_index);
        let result = match fetcher.fetch(&request).await {
            Ok(page) => {
                let records = page.records.len();
                let is_terminal = page.is_terminal;
                let declared_total = page.declared_total;
                store
                    .persist(&signature, page)
                    .await
                    .map(|newly_persisted| PersistedPage {
                        records,
                        is_terminal,
                        declared_total,
                        newly_persisted,
                    })
                    .map_err(|source| SchedulerError::Checkpoint { page_index, source })
            }
            Err(error) => Err(SchedulerError::Fetch(error)),
        };
        if results.send(PageOutcome { page_index, result }).is_err() {
            break;
        }
    }
    debug!(worker_id, "fetch worker exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::checkpoint::scan;
    use crate::fetch::FetchErrorKind;
    use crate::fetch::test_support::{ScriptedSource, Step, fast_policy, test_query};

    const PAGE_SIZE: u32 = 10;

    struct Harness {
        _dir: TempDir,
        source: Arc<ScriptedSource>,
        store: CheckpointStore,
        signature: QuerySignature,
        query: PageQuery,
    }

    impl Harness {
        fn new(source: ScriptedSource) -> Self {
            let dir = TempDir::new().unwrap();
            let store = CheckpointStore::open(dir.path()).unwrap();
            let query = test_query(PAGE_SIZE);
            let signature =
                QuerySignature::new(query.server, query.start_date, query.end_date, None);
            Self {
                _dir: dir,
                source: Arc::new(source),
                store,
                signature,
                query,
            }
        }

        fn scheduler(&self, concurrency: usize, max_attempts: u32) -> FetchScheduler {
            let fetcher = Arc::new(PageFetcher::new(
                self.source.clone(),
                fast_policy(max_attempts),
            ));
            FetchScheduler::new(fetcher, self.store.clone(), concurrency, Duration::ZERO)
        }

        async fn run(
            &self,
            concurrency: usize,
            max_attempts: u32,
        ) -> Result<FetchSummary, SchedulerError> {
            let resume = scan(&self.store, &self.signature).unwrap();
            self.scheduler(concurrency, max_attempts)
                .run(&self.query, &self.signature, &resume, &NoProgress)
                .await
        }

        fn persisted(&self) -> BTreeSet<u64> {
            self.store.list(&self.signature).unwrap()
        }
    }

    // ==================== Pagination Discovery ====================

    #[tokio::test]
    async fn test_stops_at_short_page() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Records(7)]),
        );

        let summary = harness.run(1, 3).await.unwrap();

        assert_eq!(summary.terminal_page, Some(1));
        assert_eq!(summary.records_fetched, 17);
        assert_eq!(harness.persisted(), BTreeSet::from([0, 1]));
        assert_eq!(harness.source.calls(2), 0);
    }

    #[tokio::test]
    async fn test_concurrent_discovery_never_stops_early() {
        let mut source = ScriptedSource::new(PAGE_SIZE);
        for page in 0..6 {
            source = source.script(page, &[Step::Records(10)]);
        }
        let harness = Harness::new(source.script(6, &[Step::Records(2)]));

        let summary = harness.run(4, 3).await.unwrap();

        assert_eq!(summary.terminal_page, Some(6));
        let persisted = harness.persisted();
        assert!((0..=6).all(|page| persisted.contains(&page)));
        assert!(persisted.iter().all(|&page| page < 6 + 4));
    }

    #[tokio::test]
    async fn test_empty_first_page_is_terminal() {
        let harness = Harness::new(ScriptedSource::new(PAGE_SIZE));

        let summary = harness.run(2, 3).await.unwrap();

        assert_eq!(summary.terminal_page, Some(0));
        assert!(harness.persisted().contains(&0));
    }

    // ==================== Resume ====================

    #[tokio::test]
    async fn test_resume_fetches_only_missing_page() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Records(10)])
                .script(2, &[Step::Records(10)])
                .script(3, &[Step::Records(5)]),
        );
        harness.run(1, 3).await.unwrap();
        let removed = harness
            .store
            .root()
            .join(format!("{}.p000002.json", harness.signature));
        std::fs::remove_file(removed).unwrap();

        let summary = harness.run(3, 3).await.unwrap();

        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(harness.source.calls(2), 2);
        assert_eq!(harness.source.calls(0), 1);
        assert_eq!(harness.source.calls(3), 1);
        assert_eq!(harness.persisted(), BTreeSet::from([0, 1, 2, 3]));
    }

    #[tokio::test]
    async fn test_resume_continues_past_highest_page() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Records(10)])
                .script(2, &[Step::Records(4)]),
        );
        let page0 = crate::fetch::PageResult {
            page_index: 0,
            records: Vec::new(),
            is_terminal: false,
            declared_total: None,
        };
        harness.store.put(&harness.signature, &page0).unwrap();

        harness.run(1, 3).await.unwrap();

        assert_eq!(harness.source.calls(0), 0);
        assert_eq!(harness.source.calls(1), 1);
        assert_eq!(harness.persisted(), BTreeSet::from([0, 1, 2]));
    }

    // ==================== Failures ====================

    #[tokio::test]
    async fn test_exhaustion_keeps_completed_pages() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Status(500)]),
        );

        let err = harness.run(1, 3).await.unwrap_err();

        let SchedulerError::Fetch(fetch) = &err else {
            panic!("expected fetch error, got {err:?}");
        };
        assert_eq!(fetch.kind(), FetchErrorKind::Exhausted);
        assert_eq!(err.page_index(), Some(1));
        assert_eq!(harness.source.calls(1), 3);
        assert_eq!(harness.persisted(), BTreeSet::from([0]));
        assert!(harness.store.get(&harness.signature, 0).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_stops_dispatch() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Status(404)])
                .script(1, &[Step::Records(10)])
                .script(2, &[Step::Records(10)]),
        );

        let err = harness.run(1, 3).await.unwrap_err();

        assert_eq!(err.page_index(), Some(0));
        assert_eq!(harness.source.calls(0), 1);
        assert_eq!(harness.source.calls(1), 0);
    }

    #[tokio::test]
    async fn test_failure_below_late_terminal_page_is_reported() {
        // Page 3 fails first and page 2 turns out to be the last page, so
        // page 3 is ignored while page 1 must still surface.
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Status(500)])
                .script(2, &[Step::Timeout, Step::Records(3)])
                .script(3, &[Step::Status(404)]),
        );

        let err = harness.run(4, 3).await.unwrap_err();

        let SchedulerError::Fetch(fetch) = &err else {
            panic!("expected fetch error, got {err:?}");
        };
        assert_eq!(fetch.kind(), FetchErrorKind::Exhausted);
        assert_eq!(err.page_index(), Some(1));
        assert_eq!(harness.source.calls(1), 3);
        let persisted = harness.persisted();
        assert!(persisted.contains(&0) && persisted.contains(&2));
        assert!(!persisted.contains(&1));
    }

    #[tokio::test]
    async fn test_lowest_failing_page_is_reported() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Status(500)])
                .script(2, &[Step::Status(404)]),
        );

        let err = harness.run(3, 2).await.unwrap_err();

        assert_eq!(err.page_index(), Some(1));
        assert!(!harness.persisted().contains(&1));
    }

    #[tokio::test]
    async fn test_failure_past_terminal_page_is_ignored() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(3)])
                .script(2, &[Step::Status(404)]),
        );

        let summary = harness.run(4, 3).await.unwrap();

        assert_eq!(summary.terminal_page, Some(0));
        assert!(!harness.persisted().contains(&2));
    }

    #[tokio::test]
    async fn test_retries_counted_in_summary() {
        let harness = Harness::new(ScriptedSource::new(PAGE_SIZE).script(
            0,
            &[Step::Status(500), Step::Status(500), Step::Status(500), Step::Records(1)],
        ));

        let summary = harness.run(1, 5).await.unwrap();

        assert_eq!(summary.retried, 3);
        assert_eq!(harness.persisted(), BTreeSet::from([0]));
    }

    // ==================== Progress ====================

    #[tokio::test]
    async fn test_progress_reported_per_page() {
        let harness = Harness::new(
            ScriptedSource::new(PAGE_SIZE)
                .script(0, &[Step::Records(10)])
                .script(1, &[Step::Records(10)])
                .script(2, &[Step::Records(1)]),
        );
        let seen = Mutex::new(Vec::new());
        let sink = |progress: &FetchProgress| seen.lock().unwrap().push(*progress);
        let resume = scan(&harness.store, &harness.signature).unwrap();

        harness
            .scheduler(1, 3)
            .run(&harness.query, &harness.signature, &resume, &sink)
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().pages_done, 3);
        assert_eq!(seen.last().unwrap().estimated_records, 30);
    }

    #[test]
    fn test_dispatch_plan_gaps_first_then_new() {
        let resume = ResumeState::from_pages(BTreeSet::from([0, 3]), &BTreeSet::new());
        let mut plan = DispatchPlan::new(&resume);
        let issued: Vec<u64> = std::iter::from_fn(|| plan.next()).take(4).collect();
        assert_eq!(issued, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_dispatch_plan_respects_terminal_bound() {
        let resume = ResumeState::from_pages(BTreeSet::new(), &BTreeSet::new());
        let mut plan = DispatchPlan::new(&resume);
        assert_eq!(plan.next(), Some(0));
        assert_eq!(plan.next(), Some(1));
        plan.observe_terminal(1);
        assert_eq!(plan.next(), None);
        plan.observe_terminal(3);
        assert_eq!(plan.terminal_bound, Some(1));
    }
}
