use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorOptions;
use crate::discovery::EditorVariant;
use crate::notifier::NotifierOptions;
use crate::scanner::{DEFAULT_BATCH_SIZE, ScannerOptions};
use crate::tailer::TailerOptions;

const CONFIG_SCHEMA_VERSION: u32 = 2;
const DEFAULT_DEBOUNCE_MS: u64 = 300;
const DEFAULT_FORCE_FLUSH_MS: u64 = 0;
const DEFAULT_RETRY_DELAY_MS: u64 = 50;
const MAX_BATCH_SIZE: usize = 1_000;
const CONFIG_DIR_NAME: &str = "copilot-chat-monitor";
pub const CONFIG_HOME_ENV: &str = "COPILOT_MONITOR_HOME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub schema_version: u32,
    pub variants: Vec<EditorVariant>,
    pub scan: ScanConfig,
    pub watch: WatchConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    /// 0 turns the periodic stat sweep off.
    pub force_flush_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogsConfig {
    pub enabled: bool,
    pub retry_delay_ms: u64,
}

/// Effective settings after environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub variants: Vec<EditorVariant>,
    pub batch_size: usize,
    pub watch: bool,
    pub debounce: Duration,
    pub force_flush: Duration,
    pub logs: bool,
    pub retry_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            variants: EditorVariant::ALL.to_vec(),
            scan: ScanConfig::default(),
            watch: WatchConfig::default(),
            logs: LogsConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            force_flush_ms: DEFAULT_FORCE_FLUSH_MS,
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl MonitorConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: MonitorConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = MonitorConfig::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let mut variants: Vec<EditorVariant> = Vec::with_capacity(self.variants.len());
        for variant in &self.variants {
            if *variant != EditorVariant::Custom && !variants.contains(variant) {
                variants.push(*variant);
            }
        }
        if variants.is_empty() {
            variants = EditorVariant::ALL.to_vec();
        }
        if variants != self.variants {
            self.variants = variants;
            changed = true;
        }

        let batch_size = match self.scan.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            size => size.min(MAX_BATCH_SIZE),
        };
        if batch_size != self.scan.batch_size {
            self.scan.batch_size = batch_size;
            changed = true;
        }

        if self.logs.retry_delay_ms == 0 {
            self.logs.retry_delay_ms = DEFAULT_RETRY_DELAY_MS;
            changed = true;
        }

        changed
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        resolve_settings(self, |name| env::var(name).ok())
    }
}

impl RuntimeSettings {
    pub fn notifier_options(&self) -> NotifierOptions {
        NotifierOptions {
            debounce: self.debounce,
            force_flush: self.force_flush,
            ..NotifierOptions::default()
        }
    }

    pub fn scanner_options(&self) -> ScannerOptions {
        ScannerOptions {
            batch_size: self.batch_size,
            notifier: self.notifier_options(),
        }
    }

    pub fn tailer_options(&self) -> TailerOptions {
        TailerOptions {
            retry_delay: self.retry_delay,
            notifier: self.notifier_options(),
        }
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            watch: self.watch,
            logs: self.logs,
        }
    }
}

fn resolve_settings(
    config: &MonitorConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    let env_u64 = |name: &str, default: u64| -> u64 {
        lookup(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default)
    };
    let batch_size = env_u64("COPILOT_MONITOR_BATCH_SIZE", config.scan.batch_size as u64)
        .clamp(1, MAX_BATCH_SIZE as u64) as usize;

    RuntimeSettings {
        variants: config.variants.clone(),
        batch_size,
        watch: config.watch.enabled,
        debounce: Duration::from_millis(env_u64(
            "COPILOT_MONITOR_DEBOUNCE_MS",
            config.watch.debounce_ms,
        )),
        force_flush: Duration::from_millis(env_u64(
            "COPILOT_MONITOR_FORCE_FLUSH_MS",
            config.watch.force_flush_ms,
        )),
        logs: config.logs.enabled,
        retry_delay: Duration::from_millis(config.logs.retry_delay_ms.max(1)),
    }
}

pub fn monitor_home() -> PathBuf {
    if let Ok(custom) = env::var(CONFIG_HOME_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    monitor_home().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("nested").join("config.json");

        let cfg = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg, MonitorConfig::default());
        assert!(path.exists());
        assert_eq!(cfg.scan.batch_size, 50);
        assert_eq!(cfg.watch.debounce_ms, 300);
        assert_eq!(cfg.watch.force_flush_ms, 0);
    }

    #[test]
    fn migration_fills_invalid_values_and_rewrites_file() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "schema_version": 1,
                "variants": ["cursor", "custom", "cursor"],
                "scan": { "batch_size": 0 },
                "logs": { "retry_delay_ms": 0 }
            }"#,
        )
        .expect("write");

        let cfg = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.variants, vec![EditorVariant::Cursor]);
        assert_eq!(cfg.scan.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.logs.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert!(cfg.watch.enabled);

        let rewritten = fs::read_to_string(&path).expect("read");
        assert!(rewritten.contains("\"schema_version\": 2"));
    }

    #[test]
    fn empty_variant_list_means_every_variant() {
        let mut cfg = MonitorConfig {
            variants: Vec::new(),
            ..MonitorConfig::default()
        };
        assert!(cfg.normalize_and_migrate());
        assert_eq!(cfg.variants, EditorVariant::ALL.to_vec());
        assert!(!cfg.normalize_and_migrate());
    }

    #[test]
    fn invalid_json_is_reported_with_path() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ nope").expect("write");

        let err = MonitorConfig::load_or_init_at(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("invalid JSON"));
    }

    #[test]
    fn environment_overrides_take_precedence() {
        let cfg = MonitorConfig::default();
        let settings = resolve_settings(&cfg, |name| match name {
            "COPILOT_MONITOR_DEBOUNCE_MS" => Some("0".to_string()),
            "COPILOT_MONITOR_FORCE_FLUSH_MS" => Some(" 2000 ".to_string()),
            "COPILOT_MONITOR_BATCH_SIZE" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(settings.debounce, Duration::ZERO);
        assert_eq!(settings.force_flush, Duration::from_secs(2));
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.scanner_options().notifier.force_flush, Duration::from_secs(2));
        assert_eq!(settings.tailer_options().retry_delay, Duration::from_millis(50));
    }

    #[test]
    fn batch_size_override_is_clamped() {
        let settings = resolve_settings(&MonitorConfig::default(), |name| {
            (name == "COPILOT_MONITOR_BATCH_SIZE").then(|| "0".to_string())
        });
        assert_eq!(settings.batch_size, 1);
    }
}
