//! Debouncing change notifier on top of `notify`.
//!
//! One notifier watches one root recursively and reports files whose path,
//! relative to the root, matches a glob pattern. Raw events flow from the
//! `notify` thread into a tokio task; that task filters them, verifies
//! deletes against the filesystem and arms one debounce timer per path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::WatchError;

pub type PathCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
}

/// Where a reported path lives. Anything that is not a real file on a
/// local disk or a WSL share is dropped before it reaches callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathOrigin {
    Local,
    WslShare,
}

pub fn classify_origin(path: &Path) -> Option<PathOrigin> {
    let text = path.to_string_lossy();
    if text.contains("://") {
        return None;
    }
    let lower = text.to_ascii_lowercase();
    if lower.starts_with(r"\\wsl.localhost\") || lower.starts_with(r"\\wsl$\") {
        return Some(PathOrigin::WslShare);
    }
    path.is_absolute().then_some(PathOrigin::Local)
}

#[derive(Debug, Clone)]
pub struct NotifierOptions {
    /// Zero disables the periodic stat sweep.
    pub force_flush: Duration,
    /// Zero fires callbacks for every event as it arrives.
    pub debounce: Duration,
    pub allowed_origins: Vec<PathOrigin>,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            force_flush: Duration::ZERO,
            debounce: Duration::ZERO,
            allowed_origins: vec![PathOrigin::Local, PathOrigin::WslShare],
        }
    }
}

#[derive(Default)]
struct Callbacks {
    create: Vec<PathCallback>,
    change: Vec<PathCallback>,
    delete: Vec<PathCallback>,
}

impl Callbacks {
    fn for_kind(&self, kind: ChangeKind) -> Vec<PathCallback> {
        match kind {
            ChangeKind::Created => self.create.clone(),
            ChangeKind::Changed => self.change.clone(),
            ChangeKind::Deleted => self.delete.clone(),
        }
    }
}

#[derive(Default)]
struct NotifierState {
    callbacks: Callbacks,
    pending: HashMap<PathBuf, JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    root: PathBuf,
    pattern: Pattern,
    options: NotifierOptions,
    state: Mutex<NotifierState>,
}

pub struct ChangeNotifier {
    shared: Arc<Shared>,
}

impl ChangeNotifier {
    pub fn new(
        root: impl Into<PathBuf>,
        pattern: &str,
        options: NotifierOptions,
    ) -> Result<Self, WatchError> {
        Ok(Self {
            shared: Arc::new(Shared {
                root: root.into(),
                pattern: Pattern::new(pattern)?,
                options,
                state: Mutex::new(NotifierState::default()),
            }),
        })
    }

    pub fn on_create(&self, callback: impl Fn(PathBuf) + Send + Sync + 'static) {
        self.shared.lock().callbacks.create.push(Arc::new(callback));
    }

    pub fn on_change(&self, callback: impl Fn(PathBuf) + Send + Sync + 'static) {
        self.shared.lock().callbacks.change.push(Arc::new(callback));
    }

    pub fn on_delete(&self, callback: impl Fn(PathBuf) + Send + Sync + 'static) {
        self.shared.lock().callbacks.delete.push(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().watcher.is_some()
    }

    /// Starts the native watcher and the event task. Must be called from
    /// inside a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) -> Result<(), WatchError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::Runtime)?;
        let mut state = self.shared.lock();
        if state.watcher.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(ChangeKind, PathBuf)>();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for item in classify_event(event) {
                        let _ = tx.send(item);
                    }
                }
                Err(err) => warn!(error = %err, "file watcher error"),
            })?;
        watcher.watch(&self.shared.root, RecursiveMode::Recursive)?;

        let shared = Arc::clone(&self.shared);
        state.tasks.push(runtime.spawn(async move {
            while let Some((kind, path)) = rx.recv().await {
                shared.handle_event(kind, path).await;
            }
        }));

        let interval = self.shared.options.force_flush;
        if !interval.is_zero() {
            let shared = Arc::clone(&self.shared);
            state.tasks.push(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    shared.touch_matching().await;
                }
            }));
        }

        state.watcher = Some(watcher);
        debug!(root = %self.shared.root.display(), pattern = self.shared.pattern.as_str(), "change notifier started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.watcher = None;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        for (_, timer) in state.pending.drain() {
            timer.abort();
        }
    }

    pub fn dispose(&self) {
        self.stop();
        self.shared.lock().callbacks = Callbacks::default();
    }

    /// Feeds one raw event through filtering, delete verification and
    /// debouncing, exactly as the native watcher's events are handled.
    pub async fn handle_raw_event(&self, kind: ChangeKind, path: PathBuf) {
        self.shared.handle_event(kind, path).await;
    }

    /// Files below the root that currently match the pattern.
    pub fn matching_files(&self) -> Vec<PathBuf> {
        self.shared.matching_files()
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(origin) = classify_origin(path) else {
            return false;
        };
        if !self.options.allowed_origins.contains(&origin) {
            return false;
        }
        path.strip_prefix(&self.root)
            .is_ok_and(|relative| self.pattern.matches_path_with(relative, MATCH_OPTIONS))
    }

    async fn handle_event(self: &Arc<Self>, kind: ChangeKind, path: PathBuf) {
        if !self.accepts(&path) {
            return;
        }

        match kind {
            ChangeKind::Deleted => {
                // Editors that save via delete + recreate emit a delete for a
                // file that is back by the time we look.
                if tokio::fs::metadata(&path).await.is_ok() {
                    debug!(path = %path.display(), "ignoring delete for file that still exists");
                    return;
                }
                let callbacks = {
                    let mut state = self.lock();
                    if let Some(timer) = state.pending.remove(&path) {
                        timer.abort();
                    }
                    state.callbacks.for_kind(ChangeKind::Deleted)
                };
                fire(&callbacks, &path);
            }
            ChangeKind::Created | ChangeKind::Changed => {
                if self.options.debounce.is_zero() {
                    let callbacks = self.lock().callbacks.for_kind(kind);
                    fire(&callbacks, &path);
                    return;
                }

                let mut state = self.lock();
                if state.pending.contains_key(&path) {
                    return;
                }
                let shared = Arc::clone(self);
                let key = path.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(shared.options.debounce).await;
                    let callbacks = {
                        let mut state = shared.lock();
                        state.pending.remove(&key);
                        state.callbacks.for_kind(kind)
                    };
                    fire(&callbacks, &key);
                });
                state.pending.insert(path, timer);
            }
        }
    }

    fn matching_files(&self) -> Vec<PathBuf> {
        files_matching(&self.root, &self.pattern)
    }

    /// Stats every matching file so that backends which drop events under
    /// write bursts get a chance to report them. Never fires callbacks.
    async fn touch_matching(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let files = match tokio::task::spawn_blocking(move || shared.matching_files()).await {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "forced flush sweep failed");
                return;
            }
        };
        for file in files {
            let _ = tokio::fs::metadata(&file).await;
        }
    }
}

/// Files below `root` whose root-relative path matches `pattern`.
pub(crate) fn files_matching(root: &Path, pattern: &Pattern) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.strip_prefix(root)
                .is_ok_and(|relative| pattern.matches_path_with(relative, MATCH_OPTIONS))
        })
        .collect()
}

fn fire(callbacks: &[PathCallback], path: &Path) {
    for callback in callbacks {
        callback(path.to_path_buf());
    }
}

fn classify_event(event: notify::Event) -> Vec<(ChangeKind, PathBuf)> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut items = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                items.push((ChangeKind::Deleted, from));
            }
            if let Some(to) = paths.next() {
                items.push((ChangeKind::Created, to));
            }
            return items;
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Changed,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event.paths.into_iter().map(|path| (kind, path)).collect()
}
