use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::discovery::{RootKind, StorageRoot, is_under_home};
use crate::error::ScanError;
use crate::notifier::{ChangeNotifier, NotifierOptions};
use crate::session::{SessionScanResult, is_session_file_name, parse_session_bytes};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const SESSIONS_DIR: &str = "chatSessions";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanStats {
    pub total_sessions: usize,
    pub total_requests: usize,
    pub error_files: usize,
    pub files_scanned: usize,
    pub duration: Duration,
    pub oldest_session: Option<i64>,
    pub newest_session: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub results: Vec<SessionScanResult>,
    pub stats: ScanStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Updated(SessionScanResult),
    Removed(PathBuf),
}

pub type SessionEventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Anything that can produce session results for the coordinator.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn scan_all(&self, roots: &[StorageRoot]) -> ScanReport;

    /// Registers change notifiers for `roots`. Dropping the returned
    /// notifiers stops the watch.
    fn watch(&self, roots: &[StorageRoot], handler: SessionEventHandler) -> Vec<ChangeNotifier>;
}

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub batch_size: usize,
    pub notifier: NotifierOptions,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            notifier: NotifierOptions::default(),
        }
    }
}

pub struct SessionFileScanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    options: ScannerOptions,
    known_sizes: Mutex<HashMap<PathBuf, u64>>,
    parses: AtomicU64,
}

impl SessionFileScanner {
    pub fn new(options: ScannerOptions) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                options,
                known_sizes: Mutex::new(HashMap::new()),
                parses: AtomicU64::new(0),
            }),
        }
    }

    /// Number of session files read and parsed so far.
    pub fn parse_count(&self) -> u64 {
        self.inner.parses.load(Ordering::Relaxed)
    }

    /// Re-reads one file after a change notification unless its size is
    /// the same as on the previous read.
    pub async fn rescan_file(&self, path: &Path, root: &StorageRoot) -> Option<SessionScanResult> {
        self.inner.rescan_file(path, root).await
    }

    pub fn forget(&self, path: &Path) {
        self.inner.sizes().remove(path);
    }
}

#[async_trait]
impl SessionSource for SessionFileScanner {
    async fn scan_all(&self, roots: &[StorageRoot]) -> ScanReport {
        let started = Instant::now();
        let mut files: Vec<(PathBuf, &StorageRoot)> = Vec::new();
        for root in roots {
            match collect_session_files(root).await {
                Ok(found) => files.extend(found.into_iter().map(|path| (path, root))),
                Err(err) => warn!(error = %err, "skipping session root"),
            }
        }

        let mut report = ScanReport::default();
        let batch_size = self.inner.options.batch_size.max(1);
        for batch in files.chunks(batch_size) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|(path, root)| self.inner.read_session(path, root)),
            )
            .await;
            for outcome in outcomes {
                report.stats.files_scanned += 1;
                match outcome {
                    Ok(result) => report.results.push(result),
                    Err(err) => {
                        warn!(error = %err, "skipping session file");
                        report.stats.error_files += 1;
                    }
                }
            }
        }

        report
            .results
            .sort_by_key(|result| result.session.creation_date);
        report.stats.total_sessions = report.results.len();
        report.stats.total_requests = report
            .results
            .iter()
            .map(|result| result.session.turns.len())
            .sum();
        report.stats.oldest_session = report.results.first().map(|r| r.session.creation_date);
        report.stats.newest_session = report.results.last().map(|r| r.session.creation_date);
        report.stats.duration = started.elapsed();

        info!(
            sessions = report.stats.total_sessions,
            requests = report.stats.total_requests,
            errors = report.stats.error_files,
            elapsed_ms = report.stats.duration.as_millis() as u64,
            "session scan finished"
        );
        report
    }

    fn watch(&self, roots: &[StorageRoot], handler: SessionEventHandler) -> Vec<ChangeNotifier> {
        let mut notifiers = Vec::new();
        for root in roots {
            let pattern = match root.kind {
                RootKind::WorkspaceStorage => format!("*/{SESSIONS_DIR}/*.json"),
                RootKind::EmptyWindow => "*.json".to_string(),
                RootKind::Logs => continue,
            };
            let notifier = match ChangeNotifier::new(
                &root.path,
                &pattern,
                self.inner.options.notifier.clone(),
            ) {
                Ok(notifier) => notifier,
                Err(err) => {
                    warn!(error = %err, root = %root.path.display(), "failed to create session watcher");
                    continue;
                }
            };

            let on_upsert = {
                let inner = Arc::clone(&self.inner);
                let handler = Arc::clone(&handler);
                let root = root.clone();
                move |path: PathBuf| {
                    let inner = Arc::clone(&inner);
                    let handler = Arc::clone(&handler);
                    let root = root.clone();
                    tokio::spawn(async move {
                        if let Some(result) = inner.rescan_file(&path, &root).await {
                            handler(SessionEvent::Updated(result));
                        }
                    });
                }
            };
            notifier.on_create(on_upsert.clone());
            notifier.on_change(on_upsert);
            notifier.on_delete({
                let inner = Arc::clone(&self.inner);
                let handler = Arc::clone(&handler);
                move |path: PathBuf| {
                    inner.sizes().remove(&path);
                    handler(SessionEvent::Removed(path));
                }
            });

            if let Err(err) = notifier.start() {
                warn!(error = %err, root = %root.path.display(), "failed to start session watcher");
                continue;
            }
            notifiers.push(notifier);
        }
        notifiers
    }
}

impl ScannerInner {
    fn sizes(&self) -> MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.known_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn rescan_file(&self, path: &Path, root: &StorageRoot) -> Option<SessionScanResult> {
        let name = path.file_name().and_then(|name| name.to_str())?;
        if !is_session_file_name(name) {
            return None;
        }
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                debug!(error = %err, path = %path.display(), "changed session file vanished");
                return None;
            }
        };
        {
            let mut sizes = self.sizes();
            if sizes.get(path) == Some(&size) {
                debug!(path = %path.display(), size, "session file size unchanged; skipping");
                return None;
            }
            sizes.insert(path.to_path_buf(), size);
        }

        match self.read_session(path, root).await {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(error = %err, "failed to re-read session file");
                None
            }
        }
    }

    async fn read_session(
        &self,
        path: &Path,
        root: &StorageRoot,
    ) -> Result<SessionScanResult, ScanError> {
        let io_error = |source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(io_error)?;
        let bytes = tokio::fs::read(path).await.map_err(io_error)?;
        self.parses.fetch_add(1, Ordering::Relaxed);
        self.sizes().insert(path.to_path_buf(), bytes.len() as u64);

        let session = parse_session_bytes(path, &bytes)?;
        Ok(SessionScanResult {
            session,
            path: path.to_path_buf(),
            modified: metadata.modified().map_err(io_error)?,
            size: bytes.len() as u64,
            workspace_hash: workspace_hash(path, root),
            variant: root.variant,
            under_home: is_under_home(path),
        })
    }
}

fn workspace_hash(path: &Path, root: &StorageRoot) -> Option<String> {
    if root.kind != RootKind::WorkspaceStorage {
        return None;
    }
    path.strip_prefix(&root.path)
        .ok()?
        .components()
        .next()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
}

/// Session files below one root. Failing to list the root itself fails the
/// root; failing to list one workspace directory only skips that workspace.
async fn collect_session_files(root: &StorageRoot) -> Result<Vec<PathBuf>, ScanError> {
    match root.kind {
        RootKind::WorkspaceStorage => {
            let mut files = Vec::new();
            for workspace in list_dir(&root.path, EntryKind::Dir).await? {
                let sessions_dir = workspace.join(SESSIONS_DIR);
                match list_dir(&sessions_dir, EntryKind::File).await {
                    Ok(found) => files.extend(found),
                    Err(ScanError::Directory { source, .. })
                        if source.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(error = %err, "skipping workspace directory"),
                }
            }
            Ok(files)
        }
        RootKind::EmptyWindow => list_dir(&root.path, EntryKind::File).await,
        RootKind::Logs => Ok(Vec::new()),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

async fn list_dir(dir: &Path, kind: EntryKind) -> Result<Vec<PathBuf>, ScanError> {
    let dir_error = |source| ScanError::Directory {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(dir_error)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(dir_error)? {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        let path = entry.path();
        match kind {
            EntryKind::Dir if file_type.is_dir() => paths.push(path),
            EntryKind::File
                if file_type.is_file()
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(is_session_file_name) =>
            {
                paths.push(path)
            }
            _ => {}
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::EditorVariant;
    use crate::session::fixtures::{session, turn};
    use serde_json::Value;
    use tempfile::TempDir;

    fn workspace_root(tmp: &TempDir) -> StorageRoot {
        StorageRoot::new(
            EditorVariant::Stable,
            RootKind::WorkspaceStorage,
            tmp.path().join("workspaceStorage"),
        )
    }

    fn write_session(root: &StorageRoot, workspace: &str, id: &str, doc: &Value) -> PathBuf {
        let dir = root.path.join(workspace).join(SESSIONS_DIR);
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join(format!("{id}.json"));
        std::fs::write(&path, serde_json::to_vec(doc).expect("encode")).expect("write");
        path
    }

    fn turns(prefix: &str, count: usize, start: i64) -> Vec<Value> {
        (0..count)
            .map(|i| turn(&format!("{prefix}{i}"), start + i as i64 * 1_000))
            .collect()
    }

    #[tokio::test]
    async fn scan_counts_valid_sessions_requests_and_errors() {
        let tmp = TempDir::new().expect("temp dir");
        let root = workspace_root(&tmp);
        write_session(&root, "ws1", "aaaa", &session("aaaa", 2_000, turns("a", 2, 2_100)));
        write_session(&root, "ws1", "bbbb", &session("bbbb", 1_000, turns("b", 3, 1_100)));
        let mut broken = turns("c", 2, 3_100);
        if let Some(object) = broken[1].as_object_mut() {
            object.remove("timestamp");
        }
        write_session(&root, "ws1", "cccc", &session("cccc", 3_000, broken));

        let scanner = SessionFileScanner::new(ScannerOptions::default());
        let report = scanner.scan_all(std::slice::from_ref(&root)).await;

        assert_eq!(report.stats.total_sessions, 2);
        assert_eq!(report.stats.total_requests, 5);
        assert_eq!(report.stats.error_files, 1);
        assert_eq!(report.stats.files_scanned, 3);
        assert_eq!(report.stats.oldest_session, Some(1_000));
        assert_eq!(report.stats.newest_session, Some(2_000));
        let ids: Vec<&str> = report
            .results
            .iter()
            .map(|result| result.session.id.as_str())
            .collect();
        assert_eq!(ids, vec!["bbbb", "aaaa"]);
        assert_eq!(report.results[0].workspace_hash.as_deref(), Some("ws1"));
        assert_eq!(report.results[0].variant, EditorVariant::Stable);
    }

    #[tokio::test]
    async fn small_batches_still_cover_every_file() {
        let tmp = TempDir::new().expect("temp dir");
        let root = workspace_root(&tmp);
        for (index, workspace) in ["ws1", "ws2", "ws3"].iter().enumerate() {
            let id = format!("{index}{index}{index}");
            write_session(&root, workspace, &id, &session(&id, index as i64, turns("t", 1, 10)));
        }

        let scanner = SessionFileScanner::new(ScannerOptions {
            batch_size: 1,
            ..ScannerOptions::default()
        });
        let report = scanner.scan_all(std::slice::from_ref(&root)).await;

        assert_eq!(report.stats.total_sessions, 3);
        assert_eq!(scanner.parse_count(), 3);
    }

    #[tokio::test]
    async fn unrelated_files_and_missing_roots_are_skipped() {
        let tmp = TempDir::new().expect("temp dir");
        let root = workspace_root(&tmp);
        let path = write_session(&root, "ws1", "abcd", &session("abcd", 5, turns("t", 1, 10)));
        std::fs::write(path.with_file_name("notes.json"), "{}").expect("write");
        std::fs::create_dir_all(root.path.join("ws-without-sessions")).expect("mkdir");
        let missing = StorageRoot::new(
            EditorVariant::Insiders,
            RootKind::WorkspaceStorage,
            tmp.path().join("does-not-exist"),
        );

        let scanner = SessionFileScanner::new(ScannerOptions::default());
        let report = scanner.scan_all(&[missing, root]).await;

        assert_eq!(report.stats.total_sessions, 1);
        assert_eq!(report.stats.error_files, 0);
    }

    #[tokio::test]
    async fn empty_window_sessions_have_no_workspace() {
        let tmp = TempDir::new().expect("temp dir");
        let dir = tmp.path().join("emptyWindowChatSessions");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let mut doc = session("eeee", 7, turns("t", 1, 10));
        let legacy = doc
            .as_object_mut()
            .and_then(|object| object.remove("turns"))
            .expect("turns");
        doc["requests"] = legacy;
        std::fs::write(dir.join("eeee.json"), serde_json::to_vec(&doc).expect("encode"))
            .expect("write");
        let root = StorageRoot::new(EditorVariant::Cursor, RootKind::EmptyWindow, dir);

        let scanner = SessionFileScanner::new(ScannerOptions::default());
        let report = scanner.scan_all(&[root]).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].workspace_hash, None);
        assert_eq!(report.results[0].session.turns.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_size_skips_reparse() {
        let tmp = TempDir::new().expect("temp dir");
        let root = workspace_root(&tmp);
        let path = write_session(&root, "ws1", "abcd", &session("abcd", 5, turns("t", 1, 10)));
        let scanner = SessionFileScanner::new(ScannerOptions::default());

        let first = scanner.rescan_file(&path, &root).await;
        let second = scanner.rescan_file(&path, &root).await;

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(scanner.parse_count(), 1);

        write_session(&root, "ws1", "abcd", &session("abcd", 5, turns("t", 2, 10)));
        let third = scanner.rescan_file(&path, &root).await.expect("grown file");
        assert_eq!(third.session.turns.len(), 2);
        assert_eq!(scanner.parse_count(), 2);
    }

    #[tokio::test]
    async fn full_scan_seeds_remembered_sizes() {
        let tmp = TempDir::new().expect("temp dir");
        let root = workspace_root(&tmp);
        let path = write_session(&root, "ws1", "abcd", &session("abcd", 5, turns("t", 1, 10)));
        let scanner = SessionFileScanner::new(ScannerOptions::default());

        scanner.scan_all(std::slice::from_ref(&root)).await;
        assert!(scanner.rescan_file(&path, &root).await.is_none());

        scanner.forget(&path);
        assert!(scanner.rescan_file(&path, &root).await.is_some());
        assert_eq!(scanner.parse_count(), 2);
    }

    #[tokio::test]
    async fn watch_delivers_updates_and_removals() {
        let tmp = TempDir::new().expect("temp dir");
        let root = workspace_root(&tmp);
        let path = write_session(&root, "ws1", "abcd", &session("abcd", 5, turns("t", 1, 10)));
        let logs = StorageRoot::new(EditorVariant::Stable, RootKind::Logs, tmp.path().join("logs"));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: SessionEventHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let scanner = SessionFileScanner::new(ScannerOptions::default());
        let notifiers = scanner.watch(&[root.clone(), logs], handler);
        assert_eq!(notifiers.len(), 1);

        notifiers[0]
            .handle_raw_event(crate::notifier::ChangeKind::Changed, path.clone())
            .await;
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            SessionEvent::Updated(result) => assert_eq!(result.session.id, "abcd"),
            other => panic!("unexpected event {other:?}"),
        }

        std::fs::remove_file(&path).expect("remove");
        notifiers[0]
            .handle_raw_event(crate::notifier::ChangeKind::Deleted, path.clone())
            .await;
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert_eq!(event, SessionEvent::Removed(path));
    }
}
