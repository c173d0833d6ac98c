use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::{self, MonitorConfig, RuntimeSettings};
use crate::coordinator::{CoordinatorOptions, UnifiedDataCoordinator};
use crate::discovery::{DiscoveredRoots, Discovery, StorageRoot, USER_DATA_OVERRIDE_ENV};
use crate::log_parser::LogEntry;
use crate::scanner::{ScanStats, SessionFileScanner};
use crate::session::SessionScanResult;
use crate::tailer::LogTailer;
use crate::util::{format_epoch_millis, format_tokens, human_duration, truncate};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Scans once, then prints every published change until Ctrl+C.
pub fn run_watch(settings: RuntimeSettings) -> Result<()> {
    let stop = install_stop_signal()?;
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let coordinator = build_coordinator(&settings, settings.coordinator_options());
        coordinator.on_session_results_changed(|results| {
            for result in &results {
                print_session_line("session", result);
            }
        });
        coordinator.on_session_removed(|path| {
            println!("removed  {}", path.display());
        });
        coordinator.on_log_entries_changed(|entries| {
            for entry in &entries {
                print_log_line(entry);
            }
        });

        let snapshot = coordinator.initialize().await;
        if let Some(stats) = coordinator.stats().await {
            print_stats(&stats);
        }
        println!("log_entries: {}", snapshot.log_entries.len());
        if coordinator.watcher_count() == 0 {
            println!("No watchers running; nothing further will be reported.");
        }
        println!("Watching for changes. Press Ctrl+C to stop.");

        while !stop.load(Ordering::Relaxed) {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        debug!("stop requested");
        coordinator.dispose();
    });
    Ok(())
}

/// Prints the requests already in one log file, then every request appended
/// to it until Ctrl+C. Without a path the most recently written log is used.
/// Returns 1 when there is no log to follow.
pub fn follow(settings: RuntimeSettings, path: Option<PathBuf>) -> Result<u8> {
    let stop = install_stop_signal()?;
    let runtime = build_runtime()?;
    runtime.block_on(follow_log(settings, path, stop))
}

async fn follow_log(
    settings: RuntimeSettings,
    path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
) -> Result<u8> {
    let tailer = LogTailer::new(settings.tailer_options());
    let path = match path {
        Some(path) => std::path::absolute(&path).unwrap_or(path),
        None => {
            let roots = Discovery::from_environment().discover(&settings.variants);
            match tailer.current_window_log(&roots.logs).await {
                Some(path) => path,
                None => {
                    println!("No Copilot Chat log found to follow.");
                    return Ok(1);
                }
            }
        }
    };

    println!("following {}", path.display());
    for entry in &tailer.tail(&path).await {
        print_log_line(entry);
    }
    let notifier = tailer
        .watch_file(
            &path,
            Arc::new(|entries: Vec<LogEntry>| {
                for entry in &entries {
                    print_log_line(entry);
                }
            }),
        )
        .with_context(|| format!("failed to watch {}", path.display()))?;
    info!(path = %path.display(), "following log file");
    println!("Watching for new requests. Press Ctrl+C to stop.");

    while !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    debug!("stop requested");
    notifier.dispose();
    Ok(0)
}

pub fn print_status(config: &MonitorConfig) -> Result<()> {
    let settings = config.runtime_settings();
    let runtime = build_runtime()?;
    runtime.block_on(async {
        let options = CoordinatorOptions {
            watch: false,
            ..settings.coordinator_options()
        };
        let coordinator = build_coordinator(&settings, options);
        let snapshot = coordinator.initialize().await;

        println!("copilot-chat-monitor status");
        println!("config: {}", config::config_path().display());
        print_roots("session_roots", &coordinator.roots().sessions);
        print_roots("log_roots", &coordinator.roots().logs);
        if let Some(stats) = coordinator.stats().await {
            print_stats(&stats);
        }

        let mut per_variant: BTreeMap<&str, usize> = BTreeMap::new();
        for result in &snapshot.sessions {
            *per_variant.entry(result.variant.label()).or_default() += 1;
        }
        for (variant, count) in &per_variant {
            println!("  {variant}: {count}");
        }
        if let Some(latest) = snapshot.sessions.iter().max_by_key(|r| r.session.last_message_date) {
            print_session_line("latest", latest);
        }

        println!("log_entries: {}", snapshot.log_entries.len());
        let failed = snapshot
            .log_entries
            .iter()
            .filter(|entry| !entry.is_success())
            .count();
        println!("failed_requests: {failed}");
        if let Some(last) = snapshot.log_entries.last() {
            print_log_line(last);
        }
    });
    Ok(())
}

pub fn doctor(config: &MonitorConfig) -> Result<u8> {
    let mut issues = 0u8;
    let settings = config.runtime_settings();
    let discovery = Discovery::from_environment();
    let candidates = discovery.user_data_candidates(&settings.variants);
    let roots = discovery.discover(&settings.variants);

    println!("copilot-chat-monitor doctor");
    println!("config_path: {}", config::config_path().display());
    println!("user_data_candidates:");
    for (variant, path) in &candidates {
        let marker = if path.is_dir() { "found" } else { "absent" };
        println!("  - [{marker}] {} {}", variant.label(), path.display());
    }

    if discovery.user_data_override.is_some() {
        println!("[INFO] {USER_DATA_OVERRIDE_ENV} is set; only that directory is searched.");
    }

    if roots.sessions.is_empty() {
        issues += 1;
        println!("[WARN] No chat session storage found for the enabled editors.");
    } else {
        println!(
            "[OK] Discovered {} accessible session root(s).",
            roots.sessions.len()
        );
    }

    if !settings.logs {
        println!("[INFO] Log following disabled in config.");
    } else if roots.logs.is_empty() {
        issues += 1;
        println!("[WARN] No editor log directory found.");
    } else {
        println!("[OK] Discovered {} log root(s).", roots.logs.len());
    }

    if settings.watch {
        println!(
            "[OK] Watching enabled (debounce {}, forced flush {}).",
            human_duration(settings.debounce),
            if settings.force_flush.is_zero() {
                "off".to_string()
            } else {
                human_duration(settings.force_flush)
            }
        );
    } else {
        println!("[INFO] Watching disabled in config; only one-shot scans run.");
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn build_coordinator(
    settings: &RuntimeSettings,
    options: CoordinatorOptions,
) -> UnifiedDataCoordinator {
    let roots: DiscoveredRoots = Discovery::from_environment().discover(&settings.variants);
    UnifiedDataCoordinator::new(
        roots,
        Arc::new(SessionFileScanner::new(settings.scanner_options())),
        LogTailer::new(settings.tailer_options()),
        options,
    )
}

fn print_stats(stats: &ScanStats) {
    println!("sessions: {}", stats.total_sessions);
    println!("requests: {}", stats.total_requests);
    println!("error_files: {}", stats.error_files);
    println!("scan_time: {}", human_duration(stats.duration));
    if let (Some(oldest), Some(newest)) = (stats.oldest_session, stats.newest_session) {
        println!(
            "session_range: {} .. {}",
            format_epoch_millis(oldest),
            format_epoch_millis(newest)
        );
    }
}

fn print_session_line(label: &str, result: &SessionScanResult) {
    let session = &result.session;
    let title = session
        .custom_title
        .as_deref()
        .or_else(|| session.turns.last().map(|turn| turn.message.as_str()))
        .unwrap_or("(empty)");
    let model = session
        .turns
        .iter()
        .rev()
        .find_map(|turn| turn.model_id.as_deref())
        .unwrap_or("unknown");
    println!(
        "{label:<8} {} [{}] turns={} model={} last={} {}",
        session.id,
        result.variant.label(),
        session.turns.len(),
        model,
        format_epoch_millis(session.last_message_date),
        truncate(title, 60)
    );
}

fn print_log_line(entry: &LogEntry) {
    let tokens = entry
        .completion
        .as_ref()
        .and_then(|c| Some(c.prompt_tokens? + c.completion_tokens?))
        .map(|total| format!(" tokens={}", format_tokens(total)))
        .unwrap_or_default();
    println!(
        "request  {} {} {} {} {}ms{}",
        entry.provenance.tag(),
        entry.timestamp.format("%H:%M:%S"),
        entry.resolved_model.as_deref().unwrap_or(&entry.model),
        entry.status,
        entry.response_time_ms,
        tokens
    );
}

fn print_roots(label: &str, roots: &[StorageRoot]) {
    println!("{label}:");
    for root in roots {
        println!("  - {} ({})", root.path.display(), root.variant.label());
    }
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
