//! Incremental reader for the Copilot Chat extension logs.
//!
//! Every log file has a remembered byte offset. A read returns whatever lies
//! between that offset and the current end of file; a file that shrank is
//! read again from the start.

use std::collections::{HashMap, HashSet};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::discovery::{RootKind, StorageRoot};
use crate::error::WatchError;
use crate::log_parser::{LogEntry, LogProvenance, parse_multi_line_requests};
use crate::notifier::{ChangeNotifier, NotifierOptions, files_matching};

pub const LOG_FILE_PATTERN: &str = "*/window*/exthost/GitHub.copilot-chat/*.log";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub type LogEntriesHandler = Arc<dyn Fn(Vec<LogEntry>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTailState {
    pub offset: u64,
}

/// Bytes `[start, end)` of one log file, decoded lossily.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailChunk {
    pub text: String,
    pub start: u64,
    pub end: u64,
    pub truncated: bool,
}

impl TailChunk {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TailerOptions {
    /// How long a tail waits before retrying a path that is already being read.
    pub retry_delay: Duration,
    pub notifier: NotifierOptions,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            notifier: NotifierOptions::default(),
        }
    }
}

#[derive(Clone)]
pub struct LogTailer {
    inner: Arc<TailerInner>,
}

struct TailerInner {
    options: TailerOptions,
    states: Mutex<HashMap<PathBuf, FileTailState>>,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl LogTailer {
    pub fn new(options: TailerOptions) -> Self {
        Self {
            inner: Arc::new(TailerInner {
                options,
                states: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn offset(&self, path: &Path) -> Option<u64> {
        self.inner.states().get(path).map(|state| state.offset)
    }

    pub fn forget(&self, path: &Path) {
        self.inner.states().remove(path);
    }

    pub async fn read_increment(&self, path: &Path) -> io::Result<TailChunk> {
        self.inner.read_increment(path).await
    }

    /// Reads and parses whatever was appended since the last call. The first
    /// call for a path reads the whole file.
    pub async fn tail(&self, path: &Path) -> Vec<LogEntry> {
        TailerInner::tail(&self.inner, path).await
    }

    /// Every Copilot Chat log below the given log roots, across all editor
    /// processes and windows.
    pub async fn discover_log_files(&self, roots: &[StorageRoot]) -> Vec<PathBuf> {
        let roots: Vec<PathBuf> = roots
            .iter()
            .filter(|root| root.kind == RootKind::Logs)
            .map(|root| root.path.clone())
            .collect();
        let found = tokio::task::spawn_blocking(move || {
            let Ok(pattern) = Pattern::new(LOG_FILE_PATTERN) else {
                return Vec::new();
            };
            let mut files: Vec<PathBuf> = roots
                .iter()
                .flat_map(|root| files_matching(root, &pattern))
                .collect();
            files.sort();
            files
        })
        .await;
        match found {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "log discovery task failed");
                Vec::new()
            }
        }
    }

    pub async fn backfill_all(&self, roots: &[StorageRoot]) -> Vec<LogEntry> {
        let files = self.discover_log_files(roots).await;
        let mut entries = Vec::new();
        for file in &files {
            entries.extend(self.tail(file).await);
        }
        entries.sort_by_key(|entry| entry.timestamp);
        info!(
            files = files.len(),
            entries = entries.len(),
            "log backfill finished"
        );
        entries
    }

    /// The most recently written Copilot Chat log, which belongs to the
    /// window the user is working in.
    pub async fn current_window_log(&self, roots: &[StorageRoot]) -> Option<PathBuf> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for file in self.discover_log_files(roots).await {
            let Ok(modified) = tokio::fs::metadata(&file).await.and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(time, _)| modified >= *time) {
                newest = Some((modified, file));
            }
        }
        newest.map(|(_, path)| path)
    }

    /// One notifier per log root. Appends are tailed and handed to `handler`;
    /// deleted files lose their remembered offset.
    pub fn watch(&self, roots: &[StorageRoot], handler: LogEntriesHandler) -> Vec<ChangeNotifier> {
        let mut notifiers = Vec::new();
        for root in roots.iter().filter(|root| root.kind == RootKind::Logs) {
            match self.start_notifier(&root.path, LOG_FILE_PATTERN, Arc::clone(&handler)) {
                Ok(notifier) => notifiers.push(notifier),
                Err(err) => {
                    warn!(error = %err, root = %root.path.display(), "failed to watch log root")
                }
            }
        }
        notifiers
    }

    /// Follows a single log file, typically the current window's.
    pub fn watch_file(
        &self,
        path: &Path,
        handler: LogEntriesHandler,
    ) -> Result<ChangeNotifier, WatchError> {
        let parent = path.parent().unwrap_or(path);
        let name = path
            .file_name()
            .map(|name| Pattern::escape(&name.to_string_lossy()))
            .unwrap_or_default();
        self.start_notifier(parent, &name, handler)
    }

    fn start_notifier(
        &self,
        root: &Path,
        pattern: &str,
        handler: LogEntriesHandler,
    ) -> Result<ChangeNotifier, WatchError> {
        let notifier = ChangeNotifier::new(root, pattern, self.inner.options.notifier.clone())?;

        let on_append = {
            let inner = Arc::clone(&self.inner);
            move |path: PathBuf| {
                let inner = Arc::clone(&inner);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let entries = TailerInner::tail(&inner, &path).await;
                    if !entries.is_empty() {
                        handler(entries);
                    }
                });
            }
        };
        notifier.on_create(on_append.clone());
        notifier.on_change(on_append);
        notifier.on_delete({
            let inner = Arc::clone(&self.inner);
            move |path: PathBuf| {
                debug!(path = %path.display(), "log file removed");
                inner.states().remove(&path);
            }
        });

        notifier.start()?;
        Ok(notifier)
    }
}

impl Default for LogTailer {
    fn default() -> Self {
        Self::new(TailerOptions::default())
    }
}

impl TailerInner {
    fn states(&self) -> MutexGuard<'_, HashMap<PathBuf, FileTailState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn tail(this: &Arc<Self>, path: &Path) -> Vec<LogEntry> {
        let _guard = Self::claim(this, path).await;
        let chunk = match this.read_increment(path).await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read log file");
                return Vec::new();
            }
        };
        if chunk.is_empty() {
            return Vec::new();
        }

        let provenance = LogProvenance::from_path(path);
        let mut entries = parse_multi_line_requests(&chunk.text);
        for entry in &mut entries {
            entry.tag(&provenance);
        }
        debug!(
            path = %path.display(),
            start = chunk.start,
            end = chunk.end,
            entries = entries.len(),
            "tailed log file"
        );
        entries
    }

    /// Waits until no other tail holds `path`, then holds it until the guard
    /// drops.
    async fn claim(this: &Arc<Self>, path: &Path) -> InFlightGuard {
        loop {
            if this.in_flight().insert(path.to_path_buf()) {
                return InFlightGuard {
                    inner: Arc::clone(this),
                    path: path.to_path_buf(),
                };
            }
            debug!(path = %path.display(), "log file busy; deferring tail");
            tokio::time::sleep(this.options.retry_delay).await;
        }
    }

    async fn read_increment(&self, path: &Path) -> io::Result<TailChunk> {
        let size = tokio::fs::metadata(path).await?.len();
        let (start, truncated) = match self.states().get(path) {
            None => (0, false),
            Some(state) if size < state.offset => (0, true),
            Some(state) => (state.offset, false),
        };
        if truncated {
            info!(path = %path.display(), size, "log file truncated; reading from the start");
        }
        if size == start {
            self.states()
                .insert(path.to_path_buf(), FileTailState { offset: size });
            return Ok(TailChunk {
                start,
                end: size,
                truncated,
                ..TailChunk::default()
            });
        }

        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (size - start) as usize];
        file.read_exact(&mut buf).await?;

        // A write can stop mid-character. Those bytes are read again next time.
        let kept = buf.len() - incomplete_utf8_suffix(&buf);
        buf.truncate(kept);
        let end = start + kept as u64;

        self.states()
            .insert(path.to_path_buf(), FileTailState { offset: end });
        Ok(TailChunk {
            text: String::from_utf8_lossy(&buf).into_owned(),
            start,
            end,
            truncated,
        })
    }
}

/// Number of trailing bytes that start a UTF-8 sequence the buffer does not
/// finish. Zero when `bytes` ends on a character boundary.
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    let tail_start = bytes.len().saturating_sub(3);
    for (index, &byte) in bytes.iter().enumerate().skip(tail_start).rev() {
        let width = match byte {
            0x00..=0x7F => return 0,
            0x80..=0xBF => continue,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            _ => 4,
        };
        let available = bytes.len() - index;
        return if available < width { available } else { 0 };
    }
    0
}

struct InFlightGuard {
    inner: Arc<TailerInner>,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.path);
    }
}
