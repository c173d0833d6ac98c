//! Owns the session and log caches and keeps them current.
//!
//! Full scans are single-flight: concurrent callers share one in-flight scan
//! future. Incremental updates from the watchers are merged under the cache
//! lock, which is separate from the scan slot, and then published to
//! subscribers as owned copies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::NaiveDateTime;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info};

use crate::discovery::DiscoveredRoots;
use crate::log_parser::LogEntry;
use crate::notifier::ChangeNotifier;
use crate::scanner::{ScanStats, SessionEvent, SessionEventHandler, SessionSource};
use crate::session::SessionScanResult;
use crate::tailer::{LogEntriesHandler, LogTailer};

pub type SessionResultsHandler = Arc<dyn Fn(Vec<SessionScanResult>) + Send + Sync>;
pub type SessionRemovedHandler = Arc<dyn Fn(PathBuf) + Send + Sync>;

type ScanFlight = Shared<BoxFuture<'static, Arc<CacheSnapshot>>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    /// Ascending by session creation time.
    pub sessions: Vec<SessionScanResult>,
    /// Ascending by timestamp, unique by (request id, timestamp).
    pub log_entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Scanning,
    Ready,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Start session and log watchers after the first scan.
    pub watch: bool,
    /// Backfill and follow the extension logs.
    pub logs: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            watch: true,
            logs: true,
        }
    }
}

#[derive(Default)]
struct Cache {
    sessions: Vec<SessionScanResult>,
    log_entries: Vec<LogEntry>,
    log_keys: HashSet<(String, NaiveDateTime)>,
    stats: Option<ScanStats>,
}

impl Cache {
    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            sessions: self.sessions.clone(),
            log_entries: self.log_entries.clone(),
        }
    }

    fn upsert_session(&mut self, result: SessionScanResult) {
        match self
            .sessions
            .iter_mut()
            .find(|existing| existing.session.id == result.session.id)
        {
            Some(existing) => *existing = result,
            None => self.sessions.push(result),
        }
        self.sessions.sort_by_key(|r| r.session.creation_date);
    }

    /// Appends entries not seen before and returns the ones accepted.
    fn merge_log_entries(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let accepted: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| self.log_keys.insert(entry.dedup_key()))
            .collect();
        if !accepted.is_empty() {
            self.log_entries.extend(accepted.iter().cloned());
            self.log_entries.sort_by_key(|entry| entry.timestamp);
        }
        accepted
    }
}

#[derive(Default)]
struct Subscribers {
    sessions: Vec<SessionResultsHandler>,
    removed: Vec<SessionRemovedHandler>,
    logs: Vec<LogEntriesHandler>,
}

struct Inner {
    roots: DiscoveredRoots,
    sessions: Arc<dyn SessionSource>,
    tailer: LogTailer,
    options: CoordinatorOptions,
    cache: tokio::sync::Mutex<Cache>,
    scan_flight: Mutex<Option<ScanFlight>>,
    initialized: AtomicBool,
    scanning: AtomicBool,
    watching: AtomicBool,
    subscribers: Mutex<Subscribers>,
    notifiers: Mutex<Vec<ChangeNotifier>>,
}

pub struct UnifiedDataCoordinator {
    inner: Arc<Inner>,
}

impl UnifiedDataCoordinator {
    pub fn new(
        roots: DiscoveredRoots,
        sessions: Arc<dyn SessionSource>,
        tailer: LogTailer,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                roots,
                sessions,
                tailer,
                options,
                cache: tokio::sync::Mutex::new(Cache::default()),
                scan_flight: Mutex::new(None),
                initialized: AtomicBool::new(false),
                scanning: AtomicBool::new(false),
                watching: AtomicBool::new(false),
                subscribers: Mutex::new(Subscribers::default()),
                notifiers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn roots(&self) -> &DiscoveredRoots {
        &self.inner.roots
    }

    /// Runs the first full scan and starts the watchers. Later calls return
    /// the current cache without scanning again.
    pub async fn initialize(&self) -> CacheSnapshot {
        let snapshot = if self.inner.initialized.load(Ordering::Acquire) {
            self.snapshot().await
        } else {
            CacheSnapshot::clone(&*Inner::full_scan(&self.inner).await)
        };
        if self.inner.options.watch && !self.inner.watching.swap(true, Ordering::AcqRel) {
            Inner::start_watching(&self.inner);
        }
        snapshot
    }

    /// Scans everything again and replaces the session cache with the result.
    pub async fn refresh(&self) -> CacheSnapshot {
        let outcome = Inner::full_scan(&self.inner).await;
        CacheSnapshot::clone(&outcome)
    }

    pub async fn merge_session(&self, result: SessionScanResult) {
        self.inner.merge_session(result).await;
    }

    pub async fn remove_session_path(&self, path: &Path) -> bool {
        self.inner.remove_session_path(path).await
    }

    /// Returns how many of `entries` were new.
    pub async fn merge_log_entries(&self, entries: Vec<LogEntry>) -> usize {
        self.inner.merge_log_entries(entries).await
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        self.inner.cache.lock().await.snapshot()
    }

    pub async fn stats(&self) -> Option<ScanStats> {
        self.inner.cache.lock().await.stats.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CoordinatorState {
        if self.is_scanning() {
            CoordinatorState::Scanning
        } else if self.inner.initialized.load(Ordering::Acquire) {
            CoordinatorState::Ready
        } else {
            CoordinatorState::Uninitialized
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.notifiers().len()
    }

    pub fn on_session_results_changed(
        &self,
        handler: impl Fn(Vec<SessionScanResult>) + Send + Sync + 'static,
    ) {
        self.inner.subscribers().sessions.push(Arc::new(handler));
    }

    pub fn on_session_removed(&self, handler: impl Fn(PathBuf) + Send + Sync + 'static) {
        self.inner.subscribers().removed.push(Arc::new(handler));
    }

    pub fn on_log_entries_changed(&self, handler: impl Fn(Vec<LogEntry>) + Send + Sync + 'static) {
        self.inner.subscribers().logs.push(Arc::new(handler));
    }

    /// Stops every watcher and drops all subscribers.
    pub fn dispose(&self) {
        for notifier in self.inner.notifiers().drain(..) {
            notifier.dispose();
        }
        *self.inner.subscribers() = Subscribers::default();
    }
}

impl Drop for UnifiedDataCoordinator {
    fn drop(&mut self) {
        for notifier in self.inner.notifiers().drain(..) {
            notifier.stop();
        }
    }
}

impl Inner {
    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notifiers(&self) -> MutexGuard<'_, Vec<ChangeNotifier>> {
        self.notifiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scan_slot(&self) -> MutexGuard<'_, Option<ScanFlight>> {
        self.scan_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the in-flight scan, or starts one if none is running.
    async fn full_scan(this: &Arc<Self>) -> Arc<CacheSnapshot> {
        let flight = {
            let mut slot = this.scan_slot();
            match slot.as_ref() {
                Some(flight) => {
                    debug!("joining in-flight scan");
                    flight.clone()
                }
                None => {
                    let inner = Arc::clone(this);
                    let flight = async move { inner.run_scan().await }.boxed().shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    async fn run_scan(self: Arc<Self>) -> Arc<CacheSnapshot> {
        self.scanning.store(true, Ordering::Release);
        let report = self.sessions.scan_all(&self.roots.sessions).await;
        let log_entries = if self.options.logs {
            self.tailer.backfill_all(&self.roots.logs).await
        } else {
            Vec::new()
        };

        let (snapshot, sessions, accepted) = {
            let mut cache = self.cache.lock().await;
            cache.sessions = report.results;
            cache.sessions.sort_by_key(|r| r.session.creation_date);
            cache.stats = Some(report.stats);
            let accepted = cache.merge_log_entries(log_entries);
            (cache.snapshot(), cache.sessions.clone(), accepted)
        };

        // Late callers must see `initialized` before the slot empties, or
        // they would start a second scan.
        self.initialized.store(true, Ordering::Release);
        self.scanning.store(false, Ordering::Release);
        *self.scan_slot() = None;

        self.publish_sessions(sessions);
        self.publish_log_entries(accepted);
        Arc::new(snapshot)
    }

    async fn merge_session(&self, result: SessionScanResult) {
        debug!(session = %result.session.id, path = %result.path.display(), "merging session");
        self.cache.lock().await.upsert_session(result.clone());
        self.publish_sessions(vec![result]);
    }

    async fn remove_session_path(&self, path: &Path) -> bool {
        let removed = {
            let mut cache = self.cache.lock().await;
            let before = cache.sessions.len();
            cache.sessions.retain(|result| result.path != path);
            cache.sessions.len() != before
        };
        if removed {
            info!(path = %path.display(), "session file removed");
            let handlers = self.subscribers().removed.clone();
            for handler in handlers {
                handler(path.to_path_buf());
            }
        }
        removed
    }

    async fn merge_log_entries(&self, entries: Vec<LogEntry>) -> usize {
        let accepted = self.cache.lock().await.merge_log_entries(entries);
        let count = accepted.len();
        self.publish_log_entries(accepted);
        count
    }

    fn publish_sessions(&self, results: Vec<SessionScanResult>) {
        if results.is_empty() {
            return;
        }
        let handlers = self.subscribers().sessions.clone();
        for handler in handlers {
            handler(results.clone());
        }
    }

    fn publish_log_entries(&self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        let handlers = self.subscribers().logs.clone();
        for handler in handlers {
            handler(entries.clone());
        }
    }

    fn start_watching(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let session_handler: SessionEventHandler = Arc::new(move |event| {
            if let Some(inner) = Weak::upgrade(&weak) {
                tokio::spawn(async move {
                    match event {
                        SessionEvent::Updated(result) => inner.merge_session(result).await,
                        SessionEvent::Removed(path) => {
                            inner.remove_session_path(&path).await;
                        }
                    }
                });
            }
        });
        let mut notifiers = this.sessions.watch(&this.roots.sessions, session_handler);

        if this.options.logs {
            let weak = Arc::downgrade(this);
            let log_handler: LogEntriesHandler = Arc::new(move |entries| {
                if let Some(inner) = Weak::upgrade(&weak) {
                    tokio::spawn(async move {
                        inner.merge_log_entries(entries).await;
                    });
                }
            });
            notifiers.extend(this.tailer.watch(&this.roots.logs, log_handler));
        }

        info!(watchers = notifiers.len(), "watching for changes");
        this.notifiers().extend(notifiers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{EditorVariant, StorageRoot};
    use crate::log_parser::parse_multi_line_requests;
    use crate::scanner::ScanReport;
    use crate::session::fixtures::{session, turn};
    use crate::session::parse_session_bytes;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, SystemTime};

    fn result(id: &str, created: i64) -> SessionScanResult {
        let path = PathBuf::from(format!("/ws/abc/chatSessions/{id}.json"));
        let doc = session(id, created, vec![turn(&format!("{id}-r1"), created + 10)]);
        let bytes = serde_json::to_vec(&doc).expect("encode");
        SessionScanResult {
            session: parse_session_bytes(&path, &bytes).expect("parse"),
            path,
            modified: SystemTime::UNIX_EPOCH,
            size: bytes.len() as u64,
            workspace_hash: Some("abc".to_string()),
            variant: EditorVariant::Stable,
            under_home: true,
        }
    }

    fn log_entries(ids_and_seconds: &[(&str, u32)]) -> Vec<LogEntry> {
        let text: String = ids_and_seconds
            .iter()
            .map(|(id, second)| {
                format!(
                    "2025-03-02 14:05:{second:02}.000 [info] ccreq:{id}.copilotmd | success | gpt-4o | 10ms | [panel]\n"
                )
            })
            .collect();
        parse_multi_line_requests(&text)
    }

    struct CountingSource {
        scans: AtomicUsize,
        results: Vec<SessionScanResult>,
        handler: Mutex<Option<SessionEventHandler>>,
    }

    impl CountingSource {
        fn handler(&self) -> Option<SessionEventHandler> {
            self.handler.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl SessionSource for CountingSource {
        async fn scan_all(&self, _roots: &[StorageRoot]) -> ScanReport {
            self.scans.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            ScanReport {
                results: self.results.clone(),
                ..ScanReport::default()
            }
        }

        fn watch(&self, _roots: &[StorageRoot], handler: SessionEventHandler) -> Vec<ChangeNotifier> {
            *self.handler.lock().expect("lock") = Some(handler);
            Vec::new()
        }
    }

    fn build(
        results: Vec<SessionScanResult>,
        roots: DiscoveredRoots,
        watch: bool,
    ) -> (UnifiedDataCoordinator, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            scans: AtomicUsize::new(0),
            results,
            handler: Mutex::new(None),
        });
        let coordinator = UnifiedDataCoordinator::new(
            roots,
            Arc::clone(&source) as Arc<dyn SessionSource>,
            LogTailer::default(),
            CoordinatorOptions { watch, logs: true },
        );
        (coordinator, source)
    }

    fn coordinator(results: Vec<SessionScanResult>) -> (UnifiedDataCoordinator, Arc<CountingSource>) {
        build(results, DiscoveredRoots::default(), false)
    }

    /// Polls the cache until `check` holds, failing after five seconds.
    async fn eventually(
        coordinator: &UnifiedDataCoordinator,
        check: impl Fn(&CacheSnapshot) -> bool,
    ) -> CacheSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = coordinator.snapshot().await;
            if check(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cache never reached the expected state: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_initialize_calls_share_one_scan() {
        let (coordinator, source) = coordinator(vec![result("b2", 200), result("a1", 100)]);
        assert_eq!(coordinator.state(), CoordinatorState::Uninitialized);

        let (a, b, c) = tokio::join!(
            coordinator.initialize(),
            coordinator.initialize(),
            coordinator.initialize()
        );
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
        let ids: Vec<&str> = a.sessions.iter().map(|r| r.session.id.as_str()).collect();
        assert_eq!(ids, ["a1", "b2"]);
        assert_eq!(coordinator.state(), CoordinatorState::Ready);

        coordinator.initialize().await;
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
        coordinator.refresh().await;
        assert_eq!(source.scans.load(Ordering::SeqCst), 2);
        assert!(coordinator.stats().await.is_some());
    }

    #[tokio::test]
    async fn merged_sessions_stay_sorted_and_unique() {
        let (coordinator, _) = coordinator(Vec::new());
        coordinator.initialize().await;

        coordinator.merge_session(result("c3", 300)).await;
        coordinator.merge_session(result("a1", 100)).await;
        coordinator.merge_session(result("b2", 200)).await;
        let mut replacement = result("a1", 100);
        replacement.size = 1;
        coordinator.merge_session(replacement).await;

        let snapshot = coordinator.snapshot().await;
        let created: Vec<i64> = snapshot
            .sessions
            .iter()
            .map(|r| r.session.creation_date)
            .collect();
        assert_eq!(created, [100, 200, 300]);
        assert_eq!(snapshot.sessions[0].size, 1);
    }

    #[tokio::test]
    async fn subscribers_receive_only_the_merged_session() {
        let (coordinator, _) = coordinator(vec![result("a1", 100)]);
        coordinator.initialize().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        coordinator.on_session_results_changed({
            let seen = Arc::clone(&seen);
            move |results| seen.lock().expect("lock").push(results)
        });
        coordinator.merge_session(result("b2", 200)).await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].session.id, "b2");
    }

    #[tokio::test]
    async fn log_entries_are_deduplicated_and_sorted() {
        let (coordinator, _) = coordinator(Vec::new());
        let published = Arc::new(Mutex::new(Vec::new()));
        coordinator.on_log_entries_changed({
            let published = Arc::clone(&published);
            move |entries| published.lock().expect("lock").push(entries.len())
        });

        let accepted = coordinator
            .merge_log_entries(log_entries(&[("b", 20), ("a", 10), ("b", 20)]))
            .await;
        assert_eq!(accepted, 2);
        let accepted = coordinator
            .merge_log_entries(log_entries(&[("a", 10), ("c", 5)]))
            .await;
        assert_eq!(accepted, 1);
        let accepted = coordinator.merge_log_entries(log_entries(&[("c", 5)])).await;
        assert_eq!(accepted, 0);

        let ids: Vec<String> = coordinator
            .snapshot()
            .await
            .log_entries
            .into_iter()
            .map(|entry| entry.request_id)
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert_eq!(*published.lock().expect("lock"), [2, 1]);
    }

    #[tokio::test]
    async fn removed_session_files_leave_the_cache() {
        let (coordinator, _) = coordinator(vec![result("a1", 100), result("b2", 200)]);
        coordinator.initialize().await;

        let removed = Arc::new(Mutex::new(Vec::new()));
        coordinator.on_session_removed({
            let removed = Arc::clone(&removed);
            move |path| removed.lock().expect("lock").push(path)
        });

        let path = PathBuf::from("/ws/abc/chatSessions/a1.json");
        assert!(coordinator.remove_session_path(&path).await);
        assert!(!coordinator.remove_session_path(&path).await);

        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].session.id, "b2");
        assert_eq!(*removed.lock().expect("lock"), [path]);
    }

    #[tokio::test]
    async fn refresh_before_initialize_leaves_nothing_to_scan() {
        let (coordinator, source) = build(vec![result("a1", 100)], DiscoveredRoots::default(), true);

        coordinator.refresh().await;
        assert_eq!(coordinator.state(), CoordinatorState::Ready);
        assert!(source.handler().is_none());

        let snapshot = coordinator.initialize().await;
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.sessions.len(), 1);
        assert!(source.handler().is_some());
    }

    #[tokio::test]
    async fn watched_session_events_update_the_cache() {
        let (coordinator, source) = build(vec![result("a1", 100)], DiscoveredRoots::default(), true);
        let removed = Arc::new(Mutex::new(Vec::new()));
        coordinator.on_session_removed({
            let removed = Arc::clone(&removed);
            move |path| removed.lock().expect("lock").push(path)
        });
        coordinator.initialize().await;
        let handler = source.handler().expect("session watch registered");

        handler(SessionEvent::Updated(result("b2", 200)));
        eventually(&coordinator, |snapshot| snapshot.sessions.len() == 2).await;

        let mut replacement = result("a1", 100);
        replacement.size = 7;
        handler(SessionEvent::Updated(replacement));
        let snapshot = eventually(&coordinator, |snapshot| snapshot.sessions[0].size == 7).await;
        assert_eq!(snapshot.sessions.len(), 2);

        let path = PathBuf::from("/ws/abc/chatSessions/a1.json");
        handler(SessionEvent::Removed(path.clone()));
        let snapshot = eventually(&coordinator, |snapshot| snapshot.sessions.len() == 1).await;
        assert_eq!(snapshot.sessions[0].session.id, "b2");
        assert_eq!(*removed.lock().expect("lock"), [path]);
    }

    #[tokio::test]
    async fn watched_log_appends_reach_the_cache() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let dir = tmp
            .path()
            .join("Code/logs/20250302T140501/window1/exthost/GitHub.copilot-chat");
        std::fs::create_dir_all(&dir).expect("create log dir");
        let path = dir.join("GitHub Copilot Chat.log");
        let record = |id: &str, second: u32| {
            format!(
                "2025-03-02 14:05:{second:02}.000 [info] ccreq:{id}.copilotmd | success | gpt-4o | 10ms | [panel]\n"
            )
        };
        std::fs::write(&path, record("early", 1)).expect("write");
        let roots = DiscoveredRoots {
            sessions: Vec::new(),
            logs: vec![StorageRoot::new(
                EditorVariant::Stable,
                crate::discovery::RootKind::Logs,
                tmp.path().join("Code/logs"),
            )],
        };
        let (coordinator, _) = build(Vec::new(), roots, true);

        let snapshot = coordinator.initialize().await;
        assert_eq!(snapshot.log_entries.len(), 1);
        assert_eq!(coordinator.watcher_count(), 1);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open log");
        std::io::Write::write_all(&mut file, record("late", 2).as_bytes()).expect("append");
        drop(file);

        let snapshot = eventually(&coordinator, |snapshot| snapshot.log_entries.len() == 2).await;
        let ids: Vec<&str> = snapshot
            .log_entries
            .iter()
            .map(|entry| entry.request_id.as_str())
            .collect();
        assert_eq!(ids, ["early", "late"]);

        coordinator.dispose();
        assert_eq!(coordinator.watcher_count(), 0);
    }
}
