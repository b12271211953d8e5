//! Discovery session: Idle → Loading → Ready | Failed, any → Disposed.
//! Thin controller wiring user actions (start, next, filter change, source
//! toggle, save) to one `RiskStackManager`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsRegistry;
use crate::slang::{SlangEntry, SlangSource, SourceMode};
use crate::stack::{RiskFilter, RiskStackManager, StackConfig, StackError, StockCounts};
use crate::store::{PersistenceError, SavedPhrase, SlangStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Loading,
    Ready,
    Failed,
    Disposed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Loading => "Loading",
            SessionPhase::Ready => "Ready",
            SessionPhase::Failed => "Failed",
            SessionPhase::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Idle, Loading) => true,
            (Loading, Ready) | (Loading, Failed) => true,
            (Loading, Loading) => true, // restart supersedes the pending batch
            (Ready, Loading) => true,  // source switch
            (Failed, Loading) => true, // retry
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },
    #[error("nothing is being shown")]
    NothingShown,
    #[error("no phrasebook configured")]
    NoPhrasebook,
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

struct SessionView {
    phase: SessionPhase,
    current: Option<SlangEntry>,
    filter: RiskFilter,
    source: SourceMode,
    /// Set by the last `next`/filter change: false means the relevant
    /// bucket was empty (stock exhausted), which is not an error.
    available: bool,
    error: Option<String>,
    /// Bumped by every `start`; only the latest one may settle the phase.
    start_seq: u64,
}

/// Fails the session if a `start` future is dropped while its batch is
/// still loading, so a later `start` is not refused.
struct PendingStart<'a> {
    session: &'a DiscoverySession,
    seq: u64,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.abandon_start(self.seq);
        }
    }
}

/// Serializable view for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub current: Option<SlangEntry>,
    pub filter: RiskFilter,
    pub source: SourceMode,
    pub available: bool,
    pub error: Option<String>,
    pub stock: StockCounts,
}

pub struct DiscoverySession {
    manager: Arc<RiskStackManager>,
    phrasebook: Option<Arc<SlangStore>>,
    view: RwLock<SessionView>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl DiscoverySession {
    pub fn new(manager: Arc<RiskStackManager>, phrasebook: Option<Arc<SlangStore>>) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        Self {
            manager,
            phrasebook,
            view: RwLock::new(SessionView {
                phase: SessionPhase::Idle,
                current: None,
                filter: RiskFilter::All,
                source: SourceMode::default(),
                available: true,
                error: None,
                start_seq: 0,
            }),
            phase_tx,
        }
    }

    pub fn manager(&self) -> &Arc<RiskStackManager> {
        &self.manager
    }

    pub fn phase(&self) -> SessionPhase {
        self.view.read().phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    fn transition(&self, next: SessionPhase) -> Result<SessionPhase, SessionError> {
        let mut view = self.view.write();
        self.set_phase(&mut view, next)
    }

    fn set_phase(&self, view: &mut SessionView, next: SessionPhase) -> Result<SessionPhase, SessionError> {
        let current = view.phase;
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "invalid session transition");
            return Err(SessionError::InvalidTransition { from: current, to: next });
        }
        view.phase = next;
        self.phase_tx.send_replace(next);
        info!(from = %current, to = %next, "session_transition");
        Ok(next)
    }

    /// Loads a fresh batch for `source` and shows its first entry.
    /// A batch where every fetch failed leaves the session `Failed`.
    /// Starting again while loading supersedes the earlier start, which then
    /// returns the current snapshot without touching the phase.
    pub async fn start(&self, source: SourceMode) -> Result<SessionSnapshot, SessionError> {
        let seq = {
            let mut view = self.view.write();
            self.set_phase(&mut view, SessionPhase::Loading)?;
            view.start_seq += 1;
            view.source = source;
            view.current = None;
            view.error = None;
            view.available = true;
            view.start_seq
        };
        let mut pending = PendingStart {
            session: self,
            seq,
            armed: true,
        };
        let result = self.manager.initialize(source).await;
        pending.armed = false;

        {
            let mut view = self.view.write();
            if view.start_seq != seq || matches!(result, Err(StackError::Superseded)) {
                debug!(seq, latest = view.start_seq, "start superseded");
            } else {
                match result {
                    Ok(first) => {
                        view.current = Some(first);
                        self.set_phase(&mut view, SessionPhase::Ready)?;
                    }
                    Err(e @ StackError::Disposed) => return Err(e.into()),
                    Err(e) => {
                        view.error = Some(e.to_string());
                        self.set_phase(&mut view, SessionPhase::Failed)?;
                    }
                }
            }
        }
        Ok(self.snapshot())
    }

    fn abandon_start(&self, seq: u64) {
        let mut view = self.view.write();
        if view.start_seq != seq || view.phase != SessionPhase::Loading {
            return;
        }
        view.error = Some("start cancelled before an entry arrived".into());
        let _ = self.set_phase(&mut view, SessionPhase::Failed);
    }

    /// Shows the next entry for the active filter when one is in stock.
    pub fn next(&self) -> SessionSnapshot {
        let filter = self.view.read().filter;
        let taken = self.manager.take_next(filter);
        self.apply_taken(taken);
        self.snapshot()
    }

    pub fn set_filter(&self, filter: RiskFilter) -> SessionSnapshot {
        self.view.write().filter = filter;
        let taken = self.manager.switch_filter(filter);
        self.apply_taken(taken);
        self.snapshot()
    }

    fn apply_taken(&self, taken: Option<SlangEntry>) {
        let mut view = self.view.write();
        view.available = taken.is_some();
        if let Some(entry) = taken {
            view.current = Some(entry);
        }
    }

    /// Toggling the source restarts the session with a fresh batch.
    pub async fn set_source(&self, source: SourceMode) -> Result<SessionSnapshot, SessionError> {
        let unchanged = {
            let view = self.view.read();
            view.source == source && view.phase == SessionPhase::Ready
        };
        if unchanged {
            return Ok(self.snapshot());
        }
        self.start(source).await
    }

    pub fn save_current(&self) -> Result<SavedPhrase, SessionError> {
        let phrasebook = self.phrasebook.as_ref().ok_or(SessionError::NoPhrasebook)?;
        let current = self.view.read().current.clone().ok_or(SessionError::NothingShown)?;
        Ok(phrasebook.save_phrase(&current)?)
    }

    pub fn dispose(&self) {
        self.manager.dispose();
        if self.phase() != SessionPhase::Disposed {
            let _ = self.transition(SessionPhase::Disposed);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let view = self.view.read();
        SessionSnapshot {
            phase: view.phase,
            current: view.current.clone(),
            filter: view.filter,
            source: view.source,
            available: view.available,
            error: view.error.clone(),
            stock: self.manager.stock(),
        }
    }
}

struct TrackedSession {
    session: Arc<DiscoverySession>,
    last_touched: Mutex<Instant>,
}

/// Live sessions keyed by id. Each session owns its own manager; the slang
/// source, metrics and phrasebook are shared. Sessions nobody has looked up
/// for a while are evicted by `sweep_idle`.
pub struct SessionRegistry {
    source: Arc<dyn SlangSource>,
    config: StackConfig,
    metrics: Arc<MetricsRegistry>,
    phrasebook: Option<Arc<SlangStore>>,
    sessions: RwLock<HashMap<Uuid, TrackedSession>>,
}

impl SessionRegistry {
    pub fn new(
        source: Arc<dyn SlangSource>,
        config: StackConfig,
        metrics: Arc<MetricsRegistry>,
        phrasebook: Option<Arc<SlangStore>>,
    ) -> Self {
        Self {
            source,
            config,
            metrics,
            phrasebook,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self) -> (Uuid, Arc<DiscoverySession>) {
        let manager = RiskStackManager::new(
            Arc::clone(&self.source),
            self.config,
            Arc::clone(&self.metrics),
        );
        let session = Arc::new(DiscoverySession::new(manager, self.phrasebook.clone()));
        let id = Uuid::new_v4();
        self.sessions.write().insert(
            id,
            TrackedSession {
                session: Arc::clone(&session),
                last_touched: Mutex::new(Instant::now()),
            },
        );
        debug!(session = %id, "discovery session created");
        (id, session)
    }

    /// Looks the session up and marks it as recently used.
    pub fn get(&self, id: &Uuid) -> Option<Arc<DiscoverySession>> {
        let sessions = self.sessions.read();
        let tracked = sessions.get(id)?;
        *tracked.last_touched.lock() = Instant::now();
        Some(Arc::clone(&tracked.session))
    }

    /// Disposes and forgets the session. Returns false for unknown ids.
    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(tracked) => {
                tracked.session.dispose();
                debug!(session = %id, "discovery session removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispose_all(&self) {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (_, tracked) in drained {
            tracked.session.dispose();
        }
    }

    /// Disposes and forgets every session untouched for at least `ttl`.
    /// Returns how many were evicted.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<(Uuid, Arc<DiscoverySession>)> = {
            let mut sessions = self.sessions.write();
            let idle: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, t)| now.saturating_duration_since(*t.last_touched.lock()) >= ttl)
                .map(|(id, _)| *id)
                .collect();
            idle.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|t| (id, t.session)))
                .collect()
        };
        for (id, session) in &evicted {
            session.dispose();
            info!(session = %id, "idle discovery session evicted");
        }
        evicted.len()
    }

    /// Runs `sweep_idle` every `period` until `shutdown` fires.
    pub fn spawn_idle_sweep(
        self: &Arc<Self>,
        ttl: Duration,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_idle(ttl);
                        if evicted > 0 {
                            debug!(evicted, remaining = registry.len(), "idle sweep done");
                        }
                    }
                }
            }
            debug!("idle sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slang::testing::entry;
    use crate::slang::{FetchError, RiskLevel, TermQuery};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedSource(Option<RiskLevel>);

    #[async_trait]
    impl SlangSource for FixedSource {
        async fn fetch_one(&self, _term: &TermQuery, mode: SourceMode) -> Result<SlangEntry, FetchError> {
            match self.0 {
                Some(level) => Ok(entry(&format!("{}-{level}", mode.as_str()), level)),
                None => Err(FetchError::Timeout),
            }
        }
    }

    /// Holds every fetch until `open` is called.
    struct GatedSource {
        gate: watch::Sender<bool>,
    }

    impl GatedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: watch::channel(false).0,
            })
        }

        fn open(&self) {
            self.gate.send_replace(true);
        }
    }

    #[async_trait]
    impl SlangSource for GatedSource {
        async fn fetch_one(&self, _term: &TermQuery, mode: SourceMode) -> Result<SlangEntry, FetchError> {
            let mut rx = self.gate.subscribe();
            let _ = rx.wait_for(|open| *open).await;
            Ok(entry(&format!("{}-gated", mode.as_str()), RiskLevel::Careful))
        }
    }

    fn session_with(source: Arc<dyn SlangSource>) -> DiscoverySession {
        let manager = RiskStackManager::new(source, StackConfig::default(), Arc::new(MetricsRegistry::new()));
        DiscoverySession::new(manager, None)
    }

    fn session(level: Option<RiskLevel>) -> DiscoverySession {
        session_with(Arc::new(FixedSource(level)))
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<SessionPhase>, phase: SessionPhase) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase never reached")
            .expect("phase channel closed");
    }

    #[test]
    fn transitions() {
        assert!(SessionPhase::Idle.can_transition_to(SessionPhase::Loading));
        assert!(SessionPhase::Ready.can_transition_to(SessionPhase::Loading));
        assert!(SessionPhase::Failed.can_transition_to(SessionPhase::Loading));
        assert!(!SessionPhase::Idle.can_transition_to(SessionPhase::Ready));
        assert!(!SessionPhase::Disposed.can_transition_to(SessionPhase::Loading));
        assert!(SessionPhase::Loading.can_transition_to(SessionPhase::Disposed));
        assert!(SessionPhase::Loading.can_transition_to(SessionPhase::Loading));
        assert!(!SessionPhase::Ready.can_transition_to(SessionPhase::Ready));
    }

    #[tokio::test]
    async fn cancelled_start_can_be_retried() {
        let source = GatedSource::new();
        let s = Arc::new(session_with(source.clone()));
        let mut phase = s.subscribe_phase();

        let task = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.start(SourceMode::Curated).await })
        };
        wait_for_phase(&mut phase, SessionPhase::Loading).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(s.phase(), SessionPhase::Failed);
        assert!(s.snapshot().error.unwrap().contains("cancelled"));

        source.open();
        let snap = s.start(SourceMode::Curated).await.unwrap();
        assert_eq!(snap.phase, SessionPhase::Ready);
        assert_eq!(snap.current.unwrap().phrase, "curated-gated");
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn second_start_supersedes_first() {
        let source = GatedSource::new();
        let s = Arc::new(session_with(source.clone()));
        let mut phase = s.subscribe_phase();

        let first = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.start(SourceMode::Curated).await })
        };
        wait_for_phase(&mut phase, SessionPhase::Loading).await;
        let second = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.start(SourceMode::Random).await })
        };
        for _ in 0..1000 {
            if s.snapshot().source == SourceMode::Random {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(s.phase(), SessionPhase::Loading);

        source.open();
        let earlier = first.await.unwrap().unwrap();
        assert_ne!(earlier.phase, SessionPhase::Failed);
        assert!(earlier.error.is_none());
        let latest = second.await.unwrap().unwrap();
        assert_eq!(latest.phase, SessionPhase::Ready);
        assert_eq!(latest.current.unwrap().phrase, "random-gated");
        assert_eq!(s.phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn start_shows_first_entry() {
        let s = session(Some(RiskLevel::Safe));
        let snap = s.start(SourceMode::Curated).await.unwrap();
        assert_eq!(snap.phase, SessionPhase::Ready);
        assert_eq!(snap.current.unwrap().phrase, "curated-safe");
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn failed_batch_is_reported() {
        let s = session(None);
        let snap = s.start(SourceMode::Random).await.unwrap();
        assert_eq!(snap.phase, SessionPhase::Failed);
        assert!(snap.current.is_none());
        assert!(snap.error.unwrap().contains("15"));
    }

    #[tokio::test]
    async fn empty_filter_keeps_current_and_flags_unavailable() {
        let s = session(None);
        s.manager().add_to_bucket(entry("c0", RiskLevel::Careful));
        let snap = s.next();
        assert!(snap.available);
        assert_eq!(snap.current.as_ref().unwrap().phrase, "c0");

        let snap = s.set_filter(RiskFilter::Safe);
        assert!(!snap.available);
        assert_eq!(snap.filter, RiskFilter::Safe);
        assert_eq!(snap.current.unwrap().phrase, "c0");
    }

    #[tokio::test]
    async fn source_toggle_restarts() {
        let s = session(Some(RiskLevel::Careful));
        s.start(SourceMode::Curated).await.unwrap();
        let snap = s.set_source(SourceMode::Random).await.unwrap();
        assert_eq!(snap.source, SourceMode::Random);
        assert_eq!(snap.current.unwrap().phrase, "random-careful");
    }

    #[tokio::test]
    async fn save_without_phrasebook_or_entry() {
        let s = session(None);
        assert!(matches!(s.save_current(), Err(SessionError::NoPhrasebook)));
    }

    #[tokio::test]
    async fn dispose_is_terminal() {
        let s = session(Some(RiskLevel::Safe));
        s.dispose();
        assert_eq!(s.phase(), SessionPhase::Disposed);
        assert!(s.manager().is_disposed());
        assert!(matches!(
            s.start(SourceMode::Curated).await,
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn save_current_writes_phrasebook() {
        let dir = TempDir::new().unwrap();
        let store = SlangStore::open(&dir.path().join("slang.db")).unwrap();
        let manager = RiskStackManager::new(
            Arc::new(FixedSource(Some(RiskLevel::Safe))),
            StackConfig::default(),
            Arc::new(MetricsRegistry::new()),
        );
        let s = DiscoverySession::new(manager, Some(Arc::clone(&store)));
        assert!(matches!(s.save_current(), Err(SessionError::NothingShown)));

        s.start(SourceMode::Curated).await.unwrap();
        let saved = s.save_current().unwrap();
        assert_eq!(saved.text_en, "curated-safe");
        assert_eq!(store.list_phrases(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_create_get_remove() {
        let registry = SessionRegistry::new(
            Arc::new(FixedSource(Some(RiskLevel::Avoid))),
            StackConfig::default(),
            Arc::new(MetricsRegistry::new()),
            None,
        );
        let (id, session) = registry.create();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(registry.get(&id).is_none());
        assert_eq!(session.phase(), SessionPhase::Disposed);
        assert!(registry.is_empty());
    }

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            Arc::new(FixedSource(Some(RiskLevel::Safe))),
            StackConfig::default(),
            Arc::new(MetricsRegistry::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_touched_ones_kept() {
        let registry = registry();
        let (idle_id, idle) = registry.create();
        let (busy_id, busy) = registry.create();
        assert_eq!(registry.sweep_idle(Duration::from_secs(3600)), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.get(&busy_id).is_some());
        assert_eq!(registry.sweep_idle(Duration::from_millis(40)), 1);

        assert!(registry.get(&idle_id).is_none());
        assert_eq!(idle.phase(), SessionPhase::Disposed);
        assert!(registry.get(&busy_id).is_some());
        assert_eq!(busy.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn background_sweep_evicts_until_shutdown() {
        let registry = registry();
        let (_, session) = registry.create();
        let mut phase = session.subscribe_phase();
        let shutdown = CancellationToken::new();

        let sweeper = registry.spawn_idle_sweep(
            Duration::from_millis(20),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        wait_for_phase(&mut phase, SessionPhase::Disposed).await;
        assert!(registry.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), sweeper)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
