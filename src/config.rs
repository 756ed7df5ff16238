// src/config.rs
//! Configuration file parsing for pkgworker
//!
//! Supports a TOML configuration file with the following sections:
//! - [daemon] - Socket, locks, timers and authorization
//! - [backend] - Package-manager helpers and directories
//! - [fetch] - Download engine settings
//!
//! Every key is optional. Command-line flags override the file.

use crate::daemon::DaemonConfig;
use crate::transaction::QueueSettings;
use crate::worker::fetcher::FetchSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pkgworker/pkgworker.toml";

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct WorkerConfig {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Package-manager backend
    #[serde(default)]
    pub backend: BackendSection,

    /// Fetch engine
    #[serde(default)]
    pub fetch: FetchSection,
}

/// Daemon configuration section
#[derive(Debug, Deserialize)]
pub struct DaemonSection {
    /// Unix socket path
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Socket file mode
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Group owning the socket
    #[serde(default)]
    pub socket_group: Option<String>,

    /// Daemon singleton lock
    #[serde(default = "default_daemon_lock")]
    pub lock: PathBuf,

    /// Exit after this long with nothing to do (e.g. "5m"); unset = never
    #[serde(default)]
    pub idle_timeout: Option<String>,

    /// How long finished transactions stay readable
    #[serde(default = "default_grace_period")]
    pub grace_period: String,

    /// How long a created transaction may wait to be run
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout: String,

    /// Ask PolicyKit for callers that are not root or trusted
    #[serde(default = "default_true")]
    pub require_polkit: bool,

    /// Group ids whose members are authorized without PolicyKit
    #[serde(default)]
    pub trusted_gids: Vec<u32>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            socket_mode: default_socket_mode(),
            socket_group: None,
            lock: default_daemon_lock(),
            idle_timeout: None,
            grace_period: default_grace_period(),
            pending_timeout: default_pending_timeout(),
            require_polkit: true,
            trusted_gids: Vec::new(),
        }
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/pkgworker/pkgworker.sock")
}

fn default_socket_mode() -> u32 {
    0o666
}

fn default_daemon_lock() -> PathBuf {
    PathBuf::from("/run/pkgworker/pkgworker.lock")
}

fn default_grace_period() -> String {
    "5s".to_string()
}

fn default_pending_timeout() -> String {
    "5m".to_string()
}

fn default_true() -> bool {
    true
}

/// Backend configuration section
///
/// Helpers are argument vectors; the first element is the program.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Package-manager lock file
    #[serde(default = "default_pm_lock")]
    pub lock_path: PathBuf,

    /// Where downloaded archives go
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Where downloaded index files go
    #[serde(default = "default_lists_dir")]
    pub lists_dir: PathBuf,

    /// Index files fetched by an update
    #[serde(default)]
    pub index_sources: Vec<String>,

    /// Verifies the package database can be loaded
    #[serde(default)]
    pub check: Option<Vec<String>>,

    /// Integrates fetched index files
    #[serde(default)]
    pub update: Option<Vec<String>>,

    /// Prints the archive plan for a set of instructions
    #[serde(default)]
    pub resolve: Option<Vec<String>>,

    /// Unpacks and configures packages; speaks the status protocol
    #[serde(default = "default_commit")]
    pub commit: Vec<String>,

    /// Rebuilds the package search index
    #[serde(default)]
    pub search_index: Option<Vec<String>>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            lock_path: default_pm_lock(),
            archive_dir: default_archive_dir(),
            lists_dir: default_lists_dir(),
            index_sources: Vec::new(),
            check: None,
            update: None,
            resolve: None,
            commit: default_commit(),
            search_index: None,
        }
    }
}

fn default_pm_lock() -> PathBuf {
    PathBuf::from("/var/lib/pkgworker/lock")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/cache/pkgworker/archives")
}

fn default_lists_dir() -> PathBuf {
    PathBuf::from("/var/lib/pkgworker/lists")
}

fn default_commit() -> Vec<String> {
    vec![
        "/usr/lib/pkgworker/pm-commit".to_string(),
        "--status-fd".to_string(),
        "{status_fd}".to_string(),
    ]
}

/// Fetch configuration section
#[derive(Debug, Deserialize)]
pub struct FetchSection {
    /// Interval between progress updates (e.g. "500ms")
    #[serde(default = "default_pulse_interval")]
    pub pulse_interval: String,

    /// Connection setup timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Mount point for removable media
    #[serde(default = "default_cdrom_mount")]
    pub cdrom_mount: PathBuf,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            pulse_interval: default_pulse_interval(),
            connect_timeout: default_connect_timeout(),
            cdrom_mount: default_cdrom_mount(),
        }
    }
}

fn default_pulse_interval() -> String {
    "500ms".to_string()
}

fn default_connect_timeout() -> String {
    "30s".to_string()
}

fn default_cdrom_mount() -> PathBuf {
    PathBuf::from("/media/cdrom")
}

impl WorkerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: WorkerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(Path::new(DEFAULT_CONFIG_PATH)),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref idle) = self.daemon.idle_timeout {
            parse_duration(idle).context("Invalid daemon.idle_timeout")?;
        }
        parse_duration(&self.daemon.grace_period).context("Invalid daemon.grace_period")?;
        parse_duration(&self.daemon.pending_timeout).context("Invalid daemon.pending_timeout")?;
        parse_duration(&self.fetch.pulse_interval).context("Invalid fetch.pulse_interval")?;
        parse_duration(&self.fetch.connect_timeout).context("Invalid fetch.connect_timeout")?;

        if self.daemon.socket_mode > 0o777 {
            anyhow::bail!("daemon.socket_mode must be a permission mode, got {:o}", self.daemon.socket_mode);
        }

        let helpers = [
            ("backend.check", self.backend.check.as_ref()),
            ("backend.update", self.backend.update.as_ref()),
            ("backend.resolve", self.backend.resolve.as_ref()),
            ("backend.commit", Some(&self.backend.commit)),
            ("backend.search_index", self.backend.search_index.as_ref()),
        ];
        for (name, argv) in helpers {
            if argv.is_some_and(|argv| argv.is_empty()) {
                anyhow::bail!("{} must name a program", name);
            }
        }

        Ok(())
    }

    /// Convert to the daemon's runtime configuration
    pub fn to_daemon_config(&self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::default()
            .with_socket_path(&self.daemon.socket)
            .with_lock_path(&self.daemon.lock);
        config.socket_mode = self.daemon.socket_mode;
        config.socket_group = self.daemon.socket_group.clone();
        config.require_polkit = self.daemon.require_polkit;
        config.trusted_gids = self.daemon.trusted_gids.clone();
        config.queue = self.queue_settings()?;
        if let Some(ref idle) = self.daemon.idle_timeout {
            config = config.with_idle_timeout(parse_duration(idle)?.as_secs());
        }
        Ok(config)
    }

    /// Queue timers
    pub fn queue_settings(&self) -> Result<QueueSettings> {
        Ok(QueueSettings {
            grace_period: parse_duration(&self.daemon.grace_period)?,
            pending_timeout: parse_duration(&self.daemon.pending_timeout)?,
        })
    }

    /// Fetch engine settings
    pub fn fetch_settings(&self) -> Result<FetchSettings> {
        Ok(FetchSettings {
            pulse_interval: parse_duration(&self.fetch.pulse_interval)?,
            connect_timeout: parse_duration(&self.fetch.connect_timeout)?,
            cdrom_mount: self.fetch.cdrom_mount.clone(),
            ..FetchSettings::default()
        })
    }
}

/// Parse a human-readable duration string (e.g., "500ms", "15m", "1h", "30s")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(num_str) = s.strip_suffix("ms") {
        let num: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid duration number: {}", num_str))?;
        return Ok(Duration::from_millis(num));
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}
