//! Prefetching manager around `RiskStacks`.
//!
//! Keeps enough classified entries on hand that "show next" is answered from
//! memory, topping buckets up in the background. At most one fill batch is in
//! flight per manager; a fill requested while one is running is a no-op.
//! Results of a superseded `initialize` generation, or arriving after
//! `dispose`, are discarded rather than applied. A phrase is served at most
//! once per `initialize` generation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RiskFilter, RiskStacks, StackConfig, StockCounts};
use crate::cancellation::{BatchGuard, SessionLifetime};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::slang::{FetchError, SlangEntry, SlangSource, SourceMode, TermQuery};

type FetchFuture = BoxFuture<'static, Result<SlangEntry, FetchError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("none of the {attempted} fetch attempts produced an entry")]
    EmptyBatch { attempted: usize },
    #[error("discovery session already disposed")]
    Disposed,
    #[error("superseded by a newer initialize")]
    Superseded,
}

/// Tally of one fetch batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FillReport {
    pub attempted: usize,
    /// Routed into a bucket.
    pub added: usize,
    /// Produced, but its bucket was already full or the phrase was
    /// already seen this generation.
    pub dropped: usize,
    /// Produced after the batch went stale (re-initialized or disposed).
    pub discarded: usize,
    pub failed: usize,
}

impl FillReport {
    pub fn produced(&self) -> usize {
        self.added + self.dropped + self.discarded
    }

    fn record(&mut self, routed: Routed) {
        match routed {
            Routed::Added => self.added += 1,
            Routed::Dropped => self.dropped += 1,
            Routed::Stale => self.discarded += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    AlreadyFilling,
    Full,
    Disposed,
    Completed(FillReport),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackEvent {
    BucketUpdated { counts: StockCounts },
    InitialEntryReady { phrase: String, generation: u64 },
    InitialBatchFailed { attempted: usize },
    FillStarted { attempted: usize },
    FillCompleted { report: FillReport },
}

impl StackEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StackEvent::BucketUpdated { .. } => "bucket_updated",
            StackEvent::InitialEntryReady { .. } => "initial_entry_ready",
            StackEvent::InitialBatchFailed { .. } => "initial_batch_failed",
            StackEvent::FillStarted { .. } => "fill_started",
            StackEvent::FillCompleted { .. } => "fill_completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routed {
    Added,
    Dropped,
    Stale,
}

fn phrase_key(phrase: &str) -> String {
    phrase.trim().to_lowercase()
}

struct ManagerState {
    stacks: RiskStacks,
    /// Source used by background refills; set by `initialize`.
    mode: SourceMode,
    /// Phrases shown or bucketed since the last `initialize`.
    seen: HashSet<String>,
}

/// Clears the in-flight flag when the fill future completes or is dropped.
struct FillFlag<'a>(&'a AtomicBool);

impl Drop for FillFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RiskStackManager {
    source: Arc<dyn SlangSource>,
    config: StackConfig,
    state: Mutex<ManagerState>,
    filling: AtomicBool,
    lifetime: SessionLifetime,
    metrics: Arc<MetricsRegistry>,
    stock_tx: watch::Sender<StockCounts>,
    events: broadcast::Sender<StackEvent>,
}

impl RiskStackManager {
    pub fn new(
        source: Arc<dyn SlangSource>,
        config: StackConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let (stock_tx, _) = watch::channel(StockCounts::default());
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            source,
            config,
            state: Mutex::new(ManagerState {
                stacks: RiskStacks::new(config.capacity),
                mode: SourceMode::default(),
                seen: HashSet::new(),
            }),
            filling: AtomicBool::new(false),
            lifetime: SessionLifetime::new(),
            metrics,
            stock_tx,
            events,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn stock(&self) -> StockCounts {
        *self.stock_tx.borrow()
    }

    pub fn subscribe_stock(&self) -> watch::Receiver<StockCounts> {
        self.stock_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StackEvent> {
        self.events.subscribe()
    }

    pub fn source_mode(&self) -> SourceMode {
        self.state.lock().mode
    }

    pub fn is_filling(&self) -> bool {
        self.filling.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.lifetime.is_disposed()
    }

    fn emit(&self, event: StackEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, stacks: &RiskStacks) {
        let counts = stacks.counts();
        self.stock_tx.send_replace(counts);
        self.emit(StackEvent::BucketUpdated { counts });
    }

    fn fetch_batch(&self, attempts: usize, mode: SourceMode) -> FuturesUnordered<FetchFuture> {
        (0..attempts)
            .map(|_| {
                let source = Arc::clone(&self.source);
                async move {
                    let term = TermQuery::Random;
                    source.fetch_one(&term, mode).await
                }
                .boxed()
            })
            .collect()
    }

    /// Guard check and push happen under the state lock, so a concurrent
    /// `initialize` or `dispose` cannot interleave between them.
    fn route(&self, entry: SlangEntry, guard: &BatchGuard) -> Routed {
        let mut state = self.state.lock();
        if !guard.should_apply() {
            debug!(phrase = %entry.phrase, "discarding result of stale batch");
            return Routed::Stale;
        }
        let key = phrase_key(&entry.phrase);
        if state.seen.contains(&key) {
            debug!(phrase = %entry.phrase, "phrase already seen, dropping entry");
            return Routed::Dropped;
        }
        let level = entry.risk_level;
        match state.stacks.push(entry) {
            Ok(()) => {
                state.seen.insert(key);
                self.publish(&state.stacks);
                Routed::Added
            }
            Err(rejected) => {
                debug!(phrase = %rejected.phrase, risk = %level, "bucket full, dropping entry");
                Routed::Dropped
            }
        }
    }

    /// Appends to the entry's bucket if it has room. Returns whether it was kept.
    pub fn add_to_bucket(&self, entry: SlangEntry) -> bool {
        let guard = self.lifetime.guard();
        self.route(entry, &guard) == Routed::Added
    }

    /// Clears all buckets and fetches a fresh batch. The first success is
    /// returned for immediate display and never enters a bucket; later
    /// successes keep arriving in the background and are bucketed.
    pub async fn initialize(self: &Arc<Self>, mode: SourceMode) -> Result<SlangEntry, StackError> {
        let guard = {
            let mut state = self.state.lock();
            if self.lifetime.is_disposed() {
                return Err(StackError::Disposed);
            }
            let guard = self.lifetime.advance();
            state.stacks.clear();
            state.seen.clear();
            state.mode = mode;
            self.publish(&state.stacks);
            guard
        };

        let attempted = self.config.initial_batch;
        info!(
            attempted,
            mode = mode.as_str(),
            generation = guard.my_generation(),
            "initializing risk stacks"
        );

        let started = Instant::now();
        let mut pending = self.fetch_batch(attempted, mode);
        let mut failed = 0usize;

        while let Some(result) = pending.next().await {
            match result {
                Ok(entry) => {
                    self.metrics.record(
                        metric_names::INITIALIZE_FIRST_ENTRY,
                        started.elapsed().as_secs_f64() * 1000.0,
                    );

                    {
                        let mut state = self.state.lock();
                        if guard.is_cancelled() {
                            return Err(StackError::Disposed);
                        }
                        if !guard.is_current() {
                            return Err(StackError::Superseded);
                        }
                        state.seen.insert(phrase_key(&entry.phrase));
                    }

                    // Spawned only once the first phrase is seeded.
                    let this = Arc::clone(self);
                    let drain_guard = guard.clone();
                    tokio::spawn(async move {
                        this.drain_initial(pending, drain_guard, attempted, failed).await;
                    });
                    self.emit(StackEvent::InitialEntryReady {
                        phrase: entry.phrase.clone(),
                        generation: guard.my_generation(),
                    });
                    debug!(phrase = %entry.phrase, failed_before = failed, "first entry ready");
                    return Ok(entry);
                }
                Err(e) => {
                    failed += 1;
                    debug!(error = %e, failed, "initial fetch attempt failed");
                }
            }
        }

        warn!(attempted, "initial batch produced no entries");
        self.emit(StackEvent::InitialBatchFailed { attempted });
        Err(StackError::EmptyBatch { attempted })
    }

    /// Routes the remainder of an initial batch once the first entry is out.
    async fn drain_initial(
        self: Arc<Self>,
        mut pending: FuturesUnordered<FetchFuture>,
        guard: BatchGuard,
        attempted: usize,
        failed_before: usize,
    ) {
        let mut report = FillReport {
            attempted,
            failed: failed_before,
            ..FillReport::default()
        };
        while let Some(result) = pending.next().await {
            match result {
                Ok(entry) => report.record(self.route(entry, &guard)),
                Err(e) => {
                    report.failed += 1;
                    debug!(error = %e, "initial fetch attempt failed");
                }
            }
        }
        debug!(
            added = report.added,
            dropped = report.dropped,
            discarded = report.discarded,
            failed = report.failed,
            "initial batch drained"
        );
    }

    /// Tops buckets up. No-op while another fill is in flight, when every
    /// bucket is full, or after disposal.
    pub async fn fill_stacks(&self, mode: SourceMode) -> FillOutcome {
        if self.lifetime.is_disposed() {
            return FillOutcome::Disposed;
        }
        if self
            .filling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("fill already in flight, skipping");
            return FillOutcome::AlreadyFilling;
        }
        let _flag = FillFlag(&self.filling);

        let (needed, guard) = {
            let state = self.state.lock();
            (state.stacks.needed(), self.lifetime.guard())
        };
        if needed == 0 {
            return FillOutcome::Full;
        }

        let attempted = self.config.fill_attempts(needed);
        self.emit(StackEvent::FillStarted { attempted });
        debug!(needed, attempted, mode = mode.as_str(), "filling risk stacks");

        let span = self.metrics.span(metric_names::FILL_BATCH);
        let mut report = FillReport {
            attempted,
            ..FillReport::default()
        };
        let mut pending = self.fetch_batch(attempted, mode);
        while let Some(result) = pending.next().await {
            match result {
                Ok(entry) => report.record(self.route(entry, &guard)),
                Err(e) => {
                    report.failed += 1;
                    debug!(error = %e, "fill fetch attempt failed");
                }
            }
        }
        let elapsed_ms = span.finish();

        if report.produced() == 0 {
            warn!(attempted, "fill batch produced no entries");
        } else {
            debug!(
                added = report.added,
                dropped = report.dropped,
                discarded = report.discarded,
                failed = report.failed,
                elapsed_ms,
                "fill batch done"
            );
        }
        self.emit(StackEvent::FillCompleted { report });
        FillOutcome::Completed(report)
    }

    /// Starts a background fill with the session's source mode.
    pub fn spawn_fill(self: &Arc<Self>) -> Option<JoinHandle<FillOutcome>> {
        if self.lifetime.is_disposed() {
            return None;
        }
        let mode = self.source_mode();
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.fill_stacks(mode).await }))
    }

    fn dequeue(&self, filter: RiskFilter) -> Option<SlangEntry> {
        let mut state = self.state.lock();
        if self.lifetime.is_disposed() {
            return None;
        }
        let entry = state.stacks.pop(filter)?;
        self.publish(&state.stacks);
        Some(entry)
    }

    /// Removes and returns the next entry for the filter, or None when the
    /// relevant bucket(s) are empty. Every take schedules a refill, so an
    /// empty stock recovers on the next request.
    pub fn take_next(self: &Arc<Self>, filter: RiskFilter) -> Option<SlangEntry> {
        let entry = self.dequeue(filter);
        self.spawn_fill();
        entry
    }

    /// Immediate take for the new filter, then a background refill.
    /// Bucket contents are left as they are.
    pub fn switch_filter(self: &Arc<Self>, filter: RiskFilter) -> Option<SlangEntry> {
        let entry = self.dequeue(filter);
        self.spawn_fill();
        entry
    }

    /// Tears the manager down; nothing mutates its buckets afterwards.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if self.lifetime.is_disposed() {
            return;
        }
        self.lifetime.dispose();
        state.stacks.clear();
        self.stock_tx.send_replace(StockCounts::default());
        info!("risk stack manager disposed");
    }
}
