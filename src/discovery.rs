//! Storage location discovery for the VS Code family of editors.
//!
//! Every editor variant keeps a user-data directory with the same layout:
//!
//! ```text
//! <user-data>/
//! ├── User/workspaceStorage/<workspace-hash>/chatSessions/<id>.json
//! ├── User/globalStorage/emptyWindowChatSessions/<id>.json
//! └── logs/<YYYYMMDDTHHMMSS>/window<N>/exthost/GitHub.copilot-chat/*.log
//! ```
//!
//! Discovery only inspects the filesystem; roots that are missing or
//! unreadable are left out of the result.

use std::collections::HashSet;
use std::env;
#[cfg(all(unix, not(windows)))]
use std::fs;
use std::path::{Path, PathBuf};
#[cfg(windows)]
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const USER_DATA_OVERRIDE_ENV: &str = "COPILOT_MONITOR_USER_DATA_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorVariant {
    Stable,
    Insiders,
    Exploration,
    VsCodium,
    Cursor,
    RemoteServer,
    RemoteServerInsiders,
    Custom,
}

impl EditorVariant {
    /// Variants searched by default. `Custom` only comes from the override.
    pub const ALL: [EditorVariant; 7] = [
        Self::Stable,
        Self::Insiders,
        Self::Exploration,
        Self::VsCodium,
        Self::Cursor,
        Self::RemoteServer,
        Self::RemoteServerInsiders,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Stable => "Code",
            Self::Insiders => "Code - Insiders",
            Self::Exploration => "Code - Exploration",
            Self::VsCodium => "VSCodium",
            Self::Cursor => "Cursor",
            Self::RemoteServer => "vscode-server",
            Self::RemoteServerInsiders => "vscode-server-insiders",
            Self::Custom => "custom",
        }
    }

    /// Directory name under the platform configuration directory.
    fn app_dir_name(self) -> Option<&'static str> {
        match self {
            Self::Stable | Self::Insiders | Self::Exploration | Self::VsCodium | Self::Cursor => {
                Some(self.label())
            }
            Self::RemoteServer | Self::RemoteServerInsiders | Self::Custom => None,
        }
    }

    /// Directory under the home directory holding the remote server's data.
    fn server_dir_name(self) -> Option<&'static str> {
        match self {
            Self::RemoteServer => Some(".vscode-server"),
            Self::RemoteServerInsiders => Some(".vscode-server-insiders"),
            _ => None,
        }
    }

    /// Best-effort variant detection from any path below a user-data directory.
    pub fn from_path(path: &Path) -> Option<Self> {
        let mut found = None;
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            let candidate = match name.as_ref() {
                "Code" => Some(Self::Stable),
                "Code - Insiders" => Some(Self::Insiders),
                "Code - Exploration" => Some(Self::Exploration),
                "VSCodium" => Some(Self::VsCodium),
                "Cursor" => Some(Self::Cursor),
                ".vscode-server" => Some(Self::RemoteServer),
                ".vscode-server-insiders" => Some(Self::RemoteServerInsiders),
                _ => None,
            };
            if candidate.is_some() {
                found = candidate;
            }
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// `User/workspaceStorage`: one subdirectory per workspace hash.
    WorkspaceStorage,
    /// `User/globalStorage/emptyWindowChatSessions`: sessions with no workspace.
    EmptyWindow,
    /// `logs`: one subdirectory per editor process start.
    Logs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    pub variant: EditorVariant,
    pub kind: RootKind,
    pub path: PathBuf,
}

impl StorageRoot {
    pub fn new(variant: EditorVariant, kind: RootKind, path: impl Into<PathBuf>) -> Self {
        Self {
            variant,
            kind,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredRoots {
    pub sessions: Vec<StorageRoot>,
    pub logs: Vec<StorageRoot>,
}

impl DiscoveredRoots {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.logs.is_empty()
    }
}

/// Inputs discovery reads from the user profile. Kept explicit so that
/// tests can point discovery at a temporary directory.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub config_dir: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub user_data_override: Option<PathBuf>,
    pub extra_config_dirs: Vec<PathBuf>,
}

/// Watched paths are absolute, so a relative override is resolved against
/// the working directory.
fn user_data_override_from(value: Option<String>) -> Option<PathBuf> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    let path = PathBuf::from(trimmed);
    Some(std::path::absolute(&path).unwrap_or(path))
}

impl Discovery {
    pub fn from_environment() -> Self {
        let user_data_override = user_data_override_from(env::var(USER_DATA_OVERRIDE_ENV).ok());

        let mut extra_config_dirs = Vec::new();
        #[cfg(all(unix, not(windows)))]
        {
            extra_config_dirs.extend(wsl_windows_roaming_candidates());
        }

        Self {
            config_dir: dirs::config_dir(),
            home_dir: dirs::home_dir(),
            user_data_override,
            extra_config_dirs,
        }
    }

    /// Every candidate user-data directory, existing or not, in search order.
    pub fn user_data_candidates(&self, variants: &[EditorVariant]) -> Vec<(EditorVariant, PathBuf)> {
        if let Some(custom) = &self.user_data_override {
            return vec![(EditorVariant::Custom, custom.clone())];
        }

        let mut ordered: Vec<(EditorVariant, PathBuf)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let config_dirs = self
            .config_dir
            .iter()
            .chain(self.extra_config_dirs.iter());
        for base in config_dirs {
            for variant in variants {
                if let Some(dir) = variant.app_dir_name() {
                    push_unique_path(&mut ordered, &mut seen, *variant, base.join(dir));
                }
            }
        }

        if let Some(home) = &self.home_dir {
            for variant in variants {
                if let Some(dir) = variant.server_dir_name() {
                    push_unique_path(&mut ordered, &mut seen, *variant, home.join(dir).join("data"));
                }
            }
        }

        #[cfg(windows)]
        {
            for variant in variants {
                if let Some(dir) = variant.server_dir_name() {
                    for candidate in windows_wsl_server_candidates(dir) {
                        push_unique_path(&mut ordered, &mut seen, *variant, candidate);
                    }
                }
            }
        }

        ordered
    }

    /// Existing session and log roots for the enabled variants.
    pub fn discover(&self, variants: &[EditorVariant]) -> DiscoveredRoots {
        let mut roots = DiscoveredRoots::default();
        for (variant, user_data) in self.user_data_candidates(variants) {
            for root in roots_for_user_data(variant, &user_data) {
                if !root.path.is_dir() {
                    debug!(path = %root.path.display(), variant = variant.label(), "root absent");
                    continue;
                }
                match root.kind {
                    RootKind::Logs => roots.logs.push(root),
                    RootKind::WorkspaceStorage | RootKind::EmptyWindow => roots.sessions.push(root),
                }
            }
        }
        roots
    }
}

pub fn roots_for_user_data(variant: EditorVariant, user_data: &Path) -> [StorageRoot; 3] {
    let user = user_data.join("User");
    [
        StorageRoot::new(
            variant,
            RootKind::WorkspaceStorage,
            user.join("workspaceStorage"),
        ),
        StorageRoot::new(
            variant,
            RootKind::EmptyWindow,
            user.join("globalStorage").join("emptyWindowChatSessions"),
        ),
        StorageRoot::new(variant, RootKind::Logs, user_data.join("logs")),
    ]
}

pub fn is_under_home(path: &Path) -> bool {
    dirs::home_dir().is_some_and(|home| path.starts_with(home))
}

fn push_unique_path(
    paths: &mut Vec<(EditorVariant, PathBuf)>,
    seen: &mut HashSet<String>,
    variant: EditorVariant,
    candidate: PathBuf,
) {
    if candidate.as_os_str().is_empty() {
        return;
    }
    let key = path_key(&candidate);
    if seen.insert(key) {
        paths.push((variant, candidate));
    }
}

fn path_key(path: &Path) -> String {
    #[cfg(windows)]
    {
        path.to_string_lossy()
            .replace('\\', "/")
            .to_ascii_lowercase()
    }

    #[cfg(not(windows))]
    {
        path.to_string_lossy().to_string()
    }
}

#[cfg(all(unix, not(windows)))]
fn wsl_windows_roaming_candidates() -> Vec<PathBuf> {
    if !running_in_wsl() {
        return Vec::new();
    }

    let mut candidates = Vec::new();

    if let Ok(profile) = env::var("USERPROFILE") {
        let profile = profile.trim();
        if !profile.is_empty() {
            candidates.push(PathBuf::from(profile).join("AppData").join("Roaming"));
        }
    }

    if let Ok(username) = env::var("USERNAME").or_else(|_| env::var("USER")) {
        let username = username.trim();
        if !username.is_empty() {
            candidates.push(
                PathBuf::from("/mnt/c/Users")
                    .join(username)
                    .join("AppData")
                    .join("Roaming"),
            );
        }
    }

    candidates
}

#[cfg(all(unix, not(windows)))]
fn running_in_wsl() -> bool {
    if env::var_os("WSL_DISTRO_NAME").is_some() {
        return true;
    }
    fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|value| value.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

#[cfg(windows)]
fn windows_wsl_server_candidates(server_dir: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for distro in windows_wsl_distro_names() {
        let Some(home) = wsl_home_for_distro(&distro) else {
            continue;
        };
        let mut unc = format!(r"\\wsl.localhost\{}", distro);
        for part in home.trim().trim_start_matches('/').split('/') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            unc.push('\\');
            unc.push_str(part);
        }
        candidates.push(PathBuf::from(unc).join(server_dir).join("data"));
    }
    candidates
}

#[cfg(windows)]
fn windows_wsl_distro_names() -> Vec<String> {
    let output = Command::new("wsl.exe")
        .args(["-l", "-q"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    decode_windows_text_output(&output.stdout)
        .lines()
        .map(|line| line.trim().trim_start_matches('*').trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(windows)]
fn wsl_home_for_distro(distro: &str) -> Option<String> {
    let output = Command::new("wsl.exe")
        .args(["-d", distro, "--", "sh", "-lc", "printf %s \"$HOME\""])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let home = decode_windows_text_output(&output.stdout).trim().to_string();
    if home.is_empty() { None } else { Some(home) }
}

// wsl.exe answers in UTF-16LE, usually without a BOM.
#[cfg(windows)]
fn decode_windows_text_output(bytes: &[u8]) -> String {
    let has_interleaved_nuls = bytes
        .iter()
        .skip(1)
        .step_by(2)
        .take(64)
        .any(|byte| *byte == 0);

    if bytes.starts_with(&[0xFF, 0xFE]) || has_interleaved_nuls {
        let utf16: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        return String::from_utf16_lossy(&utf16);
    }

    String::from_utf8_lossy(bytes).to_string()
}
