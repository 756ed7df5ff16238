// src/daemon/socket.rs

//! Unix socket listener for pkgworker
//!
//! The socket is the only way into the daemon. Access control is per
//! request (peer credentials, ownership, privilege), so the socket is
//! world-writable by default.
//!
//! Under socket activation the listener comes from systemd and the socket
//! file belongs to systemd: it is neither created nor removed here.

use crate::daemon::systemd;
use crate::{Error, Result};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;

/// Socket configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Path to Unix socket
    pub path: PathBuf,
    /// Socket file permissions
    pub mode: u32,
    /// Optional group for socket ownership
    pub group: Option<String>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/run/pkgworker/pkgworker.sock"),
            mode: 0o666,
            group: None,
        }
    }
}

/// Owns the listening socket file
pub struct SocketManager {
    config: SocketConfig,
    /// Whether we created the socket file (and must remove it)
    owns_path: bool,
}

impl SocketManager {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            owns_path: false,
        }
    }

    /// Take the listener from systemd, or bind the configured path
    pub fn bind(&mut self) -> Result<UnixListener> {
        if let Some(listener) = self.activated_listener()? {
            return Ok(listener);
        }

        // Clean up a stale socket file
        if self.config.path.exists() {
            std::fs::remove_file(&self.config.path)?;
        }

        if let Some(parent) = self.config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.path).map_err(|e| {
            Error::IoError(format!(
                "Failed to bind Unix socket at {:?}: {}",
                self.config.path, e
            ))
        })?;
        self.owns_path = true;

        let perms = std::fs::Permissions::from_mode(self.config.mode);
        std::fs::set_permissions(&self.config.path, perms)?;

        if let Some(ref group) = self.config.group {
            set_socket_group(&self.config.path, group)?;
        }

        log::info!(
            "Listening on Unix socket: {:?} (mode: {:o})",
            self.config.path,
            self.config.mode
        );
        Ok(listener)
    }

    fn activated_listener(&self) -> Result<Option<UnixListener>> {
        let Some(fd) = systemd::listen_fds().into_iter().next() else {
            return Ok(None);
        };

        // SAFETY: systemd passes ownership of the descriptor to this process
        let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;
        log::info!("Using socket passed by systemd (fd {})", fd);
        Ok(Some(listener))
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.path
    }

    /// Remove the socket file if we created it
    pub fn cleanup(&mut self) {
        if !self.owns_path {
            return;
        }
        self.owns_path = false;
        if self.config.path.exists()
            && let Err(e) = std::fs::remove_file(&self.config.path)
        {
            log::warn!("Failed to remove socket file: {}", e);
        }
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Set group ownership on a socket file
fn set_socket_group(path: &Path, group_name: &str) -> Result<()> {
    use nix::unistd::{Group, chown};

    let group = Group::from_name(group_name)
        .map_err(|e| Error::ConfigError(format!("Failed to look up group {}: {}", group_name, e)))?;

    let Some(group) = group else {
        log::warn!(
            "Group '{}' not found, socket keeps its default group",
            group_name
        );
        return Ok(());
    };

    chown(path, None, Some(group.gid))
        .map_err(|e| Error::IoError(format!("Failed to set socket group: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> SocketConfig {
        SocketConfig {
            path: dir.path().join("run/pkgworker.sock"),
            mode: 0o600,
            group: None,
        }
    }

    #[tokio::test]
    async fn test_bind_creates_socket_with_mode() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let path = config.path.clone();

        let mut manager = SocketManager::new(config);
        let _listener = manager.bind().unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(manager.socket_path(), path.as_path());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let path = config.path.clone();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let mut manager = SocketManager::new(config);
        let listener = manager.bind().unwrap();
        drop(listener);
        assert!(path.exists());

        drop(manager);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_group_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.group = Some("pkgworker-no-such-group".to_string());

        let mut manager = SocketManager::new(config);
        assert!(manager.bind().is_ok());
    }
}
