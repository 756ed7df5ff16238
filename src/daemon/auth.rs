// src/daemon/auth.rs

//! Caller identity and authorization
//!
//! Every connection is identified by its `SO_PEERCRED` credentials. Those
//! decide two separate things:
//!
//! - **Ownership**: only the uid that created a transaction may mutate it.
//!   Enforced by the transaction itself.
//! - **Privilege**: running a transaction requires the privilege its role
//!   names (`org.pkgworker.install-or-remove-packages`, ...). Checked here.
//!
//! # Decision order
//!
//! 1. Empty privilege: granted (search-index rebuilds, empty transactions)
//! 2. Root, or a primary gid in the trusted list: granted
//! 3. PolicyKit (feature `polkit`), allowing interactive authentication
//! 4. Without PolicyKit: granted only if `require_polkit` is off
//!
//! The PolicyKit query blocks; callers run it off the async runtime.

use crate::Result;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

/// Credentials of the process at the other end of a Unix socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredentials {
    /// Read `SO_PEERCRED` from a connected socket
    pub fn from_socket<S: AsRawFd>(socket: &S) -> io::Result<Self> {
        Self::from_fd(socket.as_raw_fd())
    }

    fn from_fd(fd: RawFd) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: ucred is plain data and `len` matches its size
            let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
            let result = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_PEERCRED,
                    &mut cred as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if result == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(PeerCredentials {
                pid: cred.pid as u32,
                uid: cred.uid,
                gid: cred.gid,
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = fd;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Peer credentials not supported on this platform",
            ))
        }
    }

    /// Credentials of this process (for tests and in-process clients)
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Outcome of the local (non-interactive) part of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    /// Ask PolicyKit
    NeedsPolkit,
}

/// Decides whether a caller holds a privilege
#[derive(Debug, Clone)]
pub struct AuthChecker {
    require_polkit: bool,
    trusted_gids: Vec<u32>,
}

impl Default for AuthChecker {
    fn default() -> Self {
        Self {
            require_polkit: true,
            trusted_gids: Vec::new(),
        }
    }
}

impl AuthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant every caller without asking PolicyKit
    pub fn disable_polkit(mut self) -> Self {
        self.require_polkit = false;
        self
    }

    pub fn with_trusted_gids(mut self, gids: impl IntoIterator<Item = u32>) -> Self {
        self.trusted_gids.extend(gids);
        self
    }

    /// Local decision, without contacting PolicyKit
    pub fn check(&self, creds: &PeerCredentials, privilege: &str) -> Permission {
        if privilege.is_empty() || creds.is_root() || self.trusted_gids.contains(&creds.gid) {
            return Permission::Granted;
        }
        if self.require_polkit {
            Permission::NeedsPolkit
        } else {
            Permission::Granted
        }
    }

    /// Full decision; may block on interactive authentication
    pub fn authorize(&self, creds: &PeerCredentials, privilege: &str) -> Result<bool> {
        match self.check(creds, privilege) {
            Permission::Granted => Ok(true),
            Permission::NeedsPolkit => polkit::check_authorization(creds, privilege),
        }
    }
}

#[cfg(feature = "polkit")]
mod polkit {
    use super::PeerCredentials;
    use crate::{Error, Result};
    use std::collections::HashMap;
    use zbus::zvariant::Value;

    const ALLOW_USER_INTERACTION: u32 = 1;

    /// Ask polkitd whether the peer process holds `action_id`
    pub fn check_authorization(creds: &PeerCredentials, action_id: &str) -> Result<bool> {
        let connection = zbus::blocking::Connection::system()
            .map_err(|e| Error::AuthError(format!("Cannot reach the system bus: {}", e)))?;

        let mut subject: HashMap<&str, Value<'_>> = HashMap::new();
        subject.insert("pid", Value::U32(creds.pid));
        // polkitd looks the start time up itself when given 0
        subject.insert("start-time", Value::U64(0));
        subject.insert("uid", Value::I32(creds.uid as i32));
        let details: HashMap<&str, &str> = HashMap::new();

        let reply = connection
            .call_method(
                Some("org.freedesktop.PolicyKit1"),
                "/org/freedesktop/PolicyKit1/Authority",
                Some("org.freedesktop.PolicyKit1.Authority"),
                "CheckAuthorization",
                &(("unix-process", subject), action_id, details, ALLOW_USER_INTERACTION, ""),
            )
            .map_err(|e| Error::AuthError(format!("PolicyKit check failed: {}", e)))?;

        let (authorized, _challenge, _details): (bool, bool, HashMap<String, String>) = reply
            .body()
            .deserialize()
            .map_err(|e| Error::AuthError(format!("Unexpected PolicyKit reply: {}", e)))?;
        Ok(authorized)
    }
}

#[cfg(not(feature = "polkit"))]
mod polkit {
    use super::PeerCredentials;
    use crate::Result;

    pub fn check_authorization(creds: &PeerCredentials, action_id: &str) -> Result<bool> {
        log::warn!(
            "PolicyKit support not built in; denying {} to uid {}",
            action_id,
            creds.uid
        );
        Ok(false)
    }
}

/// One authorization decision
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub credentials: PeerCredentials,
    /// Operation attempted (`run`, `cancel`, ...)
    pub action: String,
    pub allowed: bool,
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(credentials: PeerCredentials, action: impl Into<String>, allowed: bool) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            credentials,
            action: action.into(),
            allowed,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn to_log_message(&self) -> String {
        format!(
            "[{}] {} {} uid={} gid={} pid={} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            if self.allowed { "ALLOWED" } else { "DENIED" },
            self.action,
            self.credentials.uid,
            self.credentials.gid,
            self.credentials.pid,
            self.details.as_deref().unwrap_or("")
        )
    }
}

/// Audit trail of authorization decisions
///
/// Entries go to the log and a bounded in-memory history.
pub struct AuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
    max_entries: usize,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries: 1000,
        }
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn log(&self, entry: AuditEntry) {
        let msg = entry.to_log_message();
        if entry.allowed {
            log::info!("AUDIT: {}", msg);
        } else {
            log::warn!("AUDIT: {}", msg);
        }

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
    }

    pub fn log_action(&self, credentials: PeerCredentials, action: &str, allowed: bool, details: &str) {
        let mut entry = AuditEntry::new(credentials, action, allowed);
        if !details.is_empty() {
            entry = entry.with_details(details);
        }
        self.log(entry);
    }

    /// The most recent `count` entries, oldest first
    pub fn recent_entries(&self, count: usize) -> Vec<AuditEntry> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }
}
