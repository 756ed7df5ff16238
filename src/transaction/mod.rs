// src/transaction/mod.rs

//! Transactions: one privileged package operation each
//!
//! A [`Transaction`] is a state machine plus a property store. It is shared
//! between the async IPC context (route handlers) and the worker thread, so
//! all state sits behind one mutex. Every setter publishes a
//! [`PropertyChange`] while still holding the lock, which keeps the
//! notification order identical to the mutation order.
//!
//! # Lifecycle
//!
//! ```text
//! Setup -> Authentication -> Waiting -> WaitingLock -> LoadingCache
//!       -> Downloading <-> WaitingMedium
//!       -> Committing  <-> WaitingConfigFilePrompt
//!       -> Finished(Success | Failed | Cancelled)
//! ```
//!
//! Blocking waits (medium change, untrusted prompt, config file prompt) park
//! the worker thread on a condition variable and always observe the
//! cancelled flag.

pub mod enums;
pub mod property;
pub mod queue;

pub use enums::{
    Capabilities, ErrorCode, ExitStatus, PackageAction, PackageSpec, Role, Status,
};
pub use property::{
    ConfigFileConflict, MediumRequest, PackageMap, Property, PropertyChange, PropertyId,
    TransactionError,
};
pub use queue::{QueueChange, QueueHandle, QueueSettings, TransactionQueue};

use crate::error::{Error, Result};
use crate::progress::DownloadProgress;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Progress value reported when the real value would run backwards
pub const PROGRESS_UNKNOWN: u32 = 101;

/// Lines of child terminal output kept per transaction
const TERMINAL_TAIL_LINES: usize = 200;

/// How often blocked waits re-check the cancelled flag
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Parameters a client supplies when creating a transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionRequest {
    pub role: Option<Role>,
    pub packages: PackageMap,
    pub package_file: Option<String>,
    pub capabilities: Capabilities,
    pub locale: Option<String>,
    pub proxy: Option<String>,
    pub debconf_socket: Option<String>,
    pub allow_unauthenticated: bool,
}

impl TransactionRequest {
    pub fn new(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Default::default()
        }
    }

    pub fn with_packages(mut self, packages: PackageMap) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_package_file(mut self, path: impl Into<String>) -> Self {
        self.package_file = Some(path.into());
        self
    }
}

/// Mutable state, guarded by the transaction mutex
#[derive(Debug)]
struct State {
    role: Role,
    status: Status,
    exit: ExitStatus,
    error: Option<TransactionError>,
    error_log: Vec<String>,
    locale: String,
    proxy: String,
    debconf_socket: String,
    packages: PackageMap,
    package_file: String,
    allow_unauthenticated: bool,
    capabilities: Capabilities,
    cancellable: bool,
    cancelled: bool,
    paused: bool,
    status_details: String,
    progress: u32,
    /// Highest real (non-sentinel) progress seen
    progress_floor: u32,
    download_progress: DownloadProgress,
    unauthenticated: Vec<String>,
    download_speed: u64,
    remaining_time: u64,
    required_medium: Option<MediumRequest>,
    config_file_conflict: Option<ConfigFileConflict>,
    /// An untrusted package prompt is waiting for the client
    untrusted_pending: bool,
    /// Answer to the outstanding untrusted prompt
    untrusted_reply: Option<bool>,
    /// Answer to the outstanding config file prompt (true = replace)
    config_file_reply: Option<bool>,
    terminal_tail: VecDeque<String>,
}

/// A single privileged package operation
pub struct Transaction {
    id: String,
    owner: u32,
    created_at: String,
    state: Mutex<State>,
    wakeup: Condvar,
    events: broadcast::Sender<PropertyChange>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Create a transaction in `Setup` owned by `owner`
    pub fn new(role: Role, owner: u32) -> Arc<Self> {
        Self::from_request(TransactionRequest::new(role), owner)
    }

    /// Create a transaction from a client request
    pub fn from_request(request: TransactionRequest, owner: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let state = State {
            role: request.role.unwrap_or(Role::Empty),
            status: Status::Setup,
            exit: ExitStatus::Unfinished,
            error: None,
            error_log: Vec::new(),
            locale: request.locale.unwrap_or_default(),
            proxy: request.proxy.unwrap_or_default(),
            debconf_socket: request.debconf_socket.unwrap_or_default(),
            packages: request.packages,
            package_file: request.package_file.unwrap_or_default(),
            allow_unauthenticated: request.allow_unauthenticated,
            capabilities: request.capabilities,
            cancellable: true,
            cancelled: false,
            paused: false,
            status_details: String::new(),
            progress: 0,
            progress_floor: 0,
            download_progress: DownloadProgress::default(),
            unauthenticated: Vec::new(),
            download_speed: 0,
            remaining_time: 0,
            required_medium: None,
            config_file_conflict: None,
            untrusted_pending: false,
            untrusted_reply: None,
            config_file_reply: None,
            terminal_tail: VecDeque::new(),
        };

        let transaction = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            created_at: chrono::Utc::now().to_rfc3339(),
            state: Mutex::new(state),
            wakeup: Condvar::new(),
            events,
        });
        debug!(
            "Created transaction {} ({}) for uid {}",
            transaction.id,
            transaction.role(),
            owner
        );
        transaction
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a change; callers hold the state lock
    fn publish(&self, _state: &State, property: Property) {
        // No subscribers is fine
        let _ = self.events.send(PropertyChange::from(&property));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Subscribe to property change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChange> {
        self.events.subscribe()
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.lock().exit
    }

    pub fn error(&self) -> Option<TransactionError> {
        self.lock().error.clone()
    }

    pub fn error_log(&self) -> Vec<String> {
        self.lock().error_log.clone()
    }

    pub fn progress(&self) -> u32 {
        self.lock().progress
    }

    pub fn locale(&self) -> String {
        self.lock().locale.clone()
    }

    pub fn proxy(&self) -> String {
        self.lock().proxy.clone()
    }

    pub fn debconf_socket(&self) -> String {
        self.lock().debconf_socket.clone()
    }

    pub fn packages(&self) -> PackageMap {
        self.lock().packages.clone()
    }

    pub fn package_file(&self) -> String {
        self.lock().package_file.clone()
    }

    pub fn allows_unauthenticated(&self) -> bool {
        self.lock().allow_unauthenticated
    }

    pub fn capabilities(&self) -> Capabilities {
        self.lock().capabilities
    }

    pub fn is_cancellable(&self) -> bool {
        self.lock().cancellable
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_finished(&self) -> bool {
        self.lock().status == Status::Finished
    }

    /// Recent lines of the install child's terminal output
    pub fn terminal_output(&self) -> Vec<String> {
        self.lock().terminal_tail.iter().cloned().collect()
    }

    /// Snapshot of every property in wire order
    pub fn properties(&self) -> Vec<Property> {
        let s = self.lock();
        vec![
            Property::Id(self.id.clone()),
            Property::Owner(self.owner),
            Property::CreatedAt(self.created_at.clone()),
            Property::Role(s.role),
            Property::Status(s.status),
            Property::ExitStatus(s.exit),
            Property::Error(s.error.clone()),
            Property::ErrorLog(s.error_log.clone()),
            Property::Locale(s.locale.clone()),
            Property::Proxy(s.proxy.clone()),
            Property::DebconfSocket(s.debconf_socket.clone()),
            Property::Packages(s.packages.clone()),
            Property::PackageFile(s.package_file.clone()),
            Property::AllowUnauthenticated(s.allow_unauthenticated),
            Property::Capabilities(s.capabilities),
            Property::Cancellable(s.cancellable),
            Property::Cancelled(s.cancelled),
            Property::Paused(s.paused),
            Property::StatusDetails(s.status_details.clone()),
            Property::Progress(s.progress),
            Property::DownloadProgress(s.download_progress.clone()),
            Property::Unauthenticated(s.unauthenticated.clone()),
            Property::DownloadSpeed(s.download_speed),
            Property::RemainingTime(s.remaining_time),
            Property::RequiredMedium(s.required_medium.clone()),
            Property::ConfigFileConflict(s.config_file_conflict.clone()),
        ]
    }

    /// Reject callers other than the owner
    pub fn check_owner(&self, uid: u32) -> Result<()> {
        if uid == self.owner {
            Ok(())
        } else {
            Err(Error::AccessDenied(format!(
                "transaction {} belongs to uid {}, caller is uid {}",
                self.id, self.owner, uid
            )))
        }
    }

    // ------------------------------------------------------------------
    // Client entry points
    // ------------------------------------------------------------------

    /// Set a client-writable session property
    ///
    /// Only the owner may do this, and only while the transaction is in
    /// `Setup`.
    pub fn set_property(&self, uid: u32, property: Property) -> Result<()> {
        self.check_owner(uid)?;
        let id = property.id();
        if !id.is_client_writable() {
            return Err(Error::AccessDenied(format!("property {:?} is read-only", id)));
        }

        let mut s = self.lock();
        if s.status != Status::Setup {
            return Err(Error::InvalidState(format!(
                "cannot change {:?} while {}",
                id, s.status
            )));
        }

        match &property {
            Property::Locale(v) => s.locale = v.clone(),
            Property::Proxy(v) => s.proxy = v.clone(),
            Property::DebconfSocket(v) => s.debconf_socket = v.clone(),
            Property::Packages(v) => s.packages = v.clone(),
            Property::PackageFile(v) => s.package_file = v.clone(),
            Property::AllowUnauthenticated(v) => s.allow_unauthenticated = *v,
            Property::Capabilities(v) => s.capabilities = *v,
            other => {
                return Err(Error::AccessDenied(format!("property {:?} is read-only", other.id())));
            }
        }
        self.publish(&s, property);
        Ok(())
    }

    /// Authorize the transaction and hand it to the queue
    ///
    /// `authorize` receives the role's privilege and runs on the blocking
    /// pool, so interactive consent never stalls the IPC context. Roles with
    /// an empty privilege are approved without calling it.
    pub async fn run<F>(self: &Arc<Self>, uid: u32, queue: &QueueHandle, authorize: F) -> Result<()>
    where
        F: FnOnce(&'static str) -> Result<bool> + Send + 'static,
    {
        self.check_owner(uid)?;
        {
            let mut s = self.lock();
            if s.status != Status::Setup {
                return Err(Error::InvalidState(format!(
                    "transaction {} is already {}",
                    self.id, s.status
                )));
            }
            self.transition(&mut s, Status::Authentication)?;
        }

        let privilege = self.role().privilege();
        let verdict = if privilege.is_empty() {
            Ok(true)
        } else {
            tokio::task::spawn_blocking(move || authorize(privilege))
                .await
                .unwrap_or_else(|e| Err(Error::AuthError(format!("authorization task failed: {}", e))))
        };

        match verdict {
            Ok(true) => {
                let cancelled = {
                    let mut s = self.lock();
                    if !s.cancelled {
                        self.transition(&mut s, Status::Waiting)?;
                    }
                    s.cancelled
                };
                if cancelled {
                    self.finish(ExitStatus::Cancelled);
                    queue.remove(&self.id).await;
                    return Ok(());
                }
                queue.enqueue(&self.id).await
            }
            Ok(false) => {
                let reason = format!("uid {} is not allowed to perform {}", uid, privilege);
                self.fail(ErrorCode::AuthError, reason.clone());
                queue.remove(&self.id).await;
                Err(Error::AuthError(reason))
            }
            Err(e) => {
                self.fail(ErrorCode::AuthError, e.to_string());
                queue.remove(&self.id).await;
                Err(e)
            }
        }
    }

    /// Request cancellation
    ///
    /// A no-op when already cancelled or not cancellable. A transaction
    /// that was never run finishes immediately; otherwise the running step
    /// observes the flag at its next poll point.
    pub fn cancel(&self, uid: u32) -> Result<()> {
        self.check_owner(uid)?;
        let mut s = self.lock();
        if s.cancelled || !s.cancellable || s.status == Status::Finished {
            debug!("Ignoring cancel for transaction {}", self.id);
            return Ok(());
        }

        info!("Cancelling transaction {}", self.id);
        s.cancelled = true;
        self.publish(&s, Property::Cancelled(true));
        let never_started = s.status == Status::Setup;
        drop(s);
        self.wakeup.notify_all();

        if never_started {
            self.finish(ExitStatus::Cancelled);
        }
        Ok(())
    }

    /// Resume after a medium change
    pub fn provide_medium(&self, uid: u32, mount_point: &str) -> Result<()> {
        self.check_owner(uid)?;
        let mut s = self.lock();
        if s.status != Status::WaitingMedium {
            return Err(Error::InvalidState("no medium has been requested".to_string()));
        }
        match &s.required_medium {
            Some(request) if request.mount_point == mount_point => {}
            Some(request) => {
                return Err(Error::InvalidState(format!(
                    "medium is expected at {}, not {}",
                    request.mount_point, mount_point
                )));
            }
            None => return Err(Error::InvalidState("no medium has been requested".to_string())),
        }
        s.paused = false;
        self.publish(&s, Property::Paused(false));
        drop(s);
        self.wakeup.notify_all();
        Ok(())
    }

    /// Answer the untrusted package prompt
    pub fn reply_untrusted_prompt(&self, uid: u32, approved: bool) -> Result<()> {
        self.check_owner(uid)?;
        let mut s = self.lock();
        if !s.untrusted_pending || s.untrusted_reply.is_some() {
            return Err(Error::InvalidState(
                "no untrusted package prompt is outstanding".to_string(),
            ));
        }
        s.untrusted_reply = Some(approved);
        s.paused = false;
        self.publish(&s, Property::Paused(false));
        drop(s);
        self.wakeup.notify_all();
        Ok(())
    }

    /// Answer a configuration file conflict (`replace` takes the new file)
    pub fn resolve_config_file_conflict(&self, uid: u32, path: &str, replace: bool) -> Result<()> {
        self.check_owner(uid)?;
        let mut s = self.lock();
        if s.status != Status::WaitingConfigFilePrompt {
            return Err(Error::InvalidState(
                "no configuration file conflict is outstanding".to_string(),
            ));
        }
        match &s.config_file_conflict {
            Some(conflict) if conflict.old_path == path => {}
            _ => {
                return Err(Error::InvalidState(format!(
                    "{} is not the conflicting configuration file",
                    path
                )));
            }
        }
        s.config_file_reply = Some(replace);
        s.paused = false;
        self.publish(&s, Property::Paused(false));
        drop(s);
        self.wakeup.notify_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    fn transition(&self, s: &mut State, next: Status) -> Result<()> {
        if s.status == next {
            return Ok(());
        }
        if !s.status.can_transition_to(next) {
            warn!(
                "Transaction {}: rejected status change {:?} -> {:?}",
                self.id, s.status, next
            );
            return Err(Error::InvalidState(format!(
                "cannot move from {:?} to {:?}",
                s.status, next
            )));
        }
        debug!("Transaction {}: {:?} -> {:?}", self.id, s.status, next);
        s.status = next;
        self.publish(s, Property::Status(next));
        Ok(())
    }

    /// Move the state machine forward
    pub fn set_status(&self, status: Status) -> Result<()> {
        let mut s = self.lock();
        self.transition(&mut s, status)
    }

    /// Assign the role if none was given at creation
    pub fn set_role(&self, role: Role) -> Result<()> {
        let mut s = self.lock();
        if s.role != Role::Empty {
            return Err(Error::InvalidState(format!("role is already {}", s.role)));
        }
        s.role = role;
        self.publish(&s, Property::Role(role));
        Ok(())
    }

    pub fn set_status_details(&self, details: impl Into<String>) {
        let details = details.into();
        let mut s = self.lock();
        if s.status_details != details {
            s.status_details = details.clone();
            self.publish(&s, Property::StatusDetails(details));
        }
    }

    /// Report progress
    ///
    /// Values above 100 other than [`PROGRESS_UNKNOWN`] are clamped. Real
    /// values never go below the highest real value already reported.
    pub fn set_progress(&self, percent: u32) {
        let mut s = self.lock();
        let value = if percent == PROGRESS_UNKNOWN {
            PROGRESS_UNKNOWN
        } else {
            let clamped = percent.min(100);
            if clamped < s.progress_floor {
                return;
            }
            s.progress_floor = clamped;
            clamped
        };
        if s.progress != value {
            s.progress = value;
            self.publish(&s, Property::Progress(value));
        }
    }

    pub fn set_download_progress(&self, progress: DownloadProgress) {
        let mut s = self.lock();
        s.download_progress = progress.clone();
        self.publish(&s, Property::DownloadProgress(progress));
    }

    pub fn set_download_speed(&self, bytes_per_sec: u64) {
        let mut s = self.lock();
        if s.download_speed != bytes_per_sec {
            s.download_speed = bytes_per_sec;
            self.publish(&s, Property::DownloadSpeed(bytes_per_sec));
        }
    }

    /// Remaining download time in seconds, 0 when unknown
    pub fn set_remaining_time(&self, seconds: u64) {
        let mut s = self.lock();
        if s.remaining_time != seconds {
            s.remaining_time = seconds;
            self.publish(&s, Property::RemainingTime(seconds));
        }
    }

    pub fn set_cancellable(&self, cancellable: bool) {
        let mut s = self.lock();
        if s.cancellable != cancellable {
            s.cancellable = cancellable;
            self.publish(&s, Property::Cancellable(cancellable));
        }
    }

    pub fn set_unauthenticated(&self, packages: Vec<String>) {
        let mut s = self.lock();
        s.unauthenticated = packages.clone();
        self.publish(&s, Property::Unauthenticated(packages));
    }

    /// Append a line to the error-detail log
    pub fn append_error_detail(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("Transaction {}: {}", self.id, line);
        let mut s = self.lock();
        s.error_log.push(line);
        let log = s.error_log.clone();
        self.publish(&s, Property::ErrorLog(log));
    }

    /// Record terminal output from the install child
    pub fn append_terminal_output(&self, text: &str) {
        let mut s = self.lock();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if s.terminal_tail.len() == TERMINAL_TAIL_LINES {
                s.terminal_tail.pop_front();
            }
            s.terminal_tail.push_back(line.to_string());
        }
    }

    /// Finish with a failure
    ///
    /// The first error wins; later calls keep the original code. Empty
    /// details are filled from the error-detail log.
    pub fn fail(&self, code: ErrorCode, details: impl Into<String>) {
        {
            let mut s = self.lock();
            if s.error.is_none() {
                let mut details = details.into();
                if details.is_empty() {
                    details = s.error_log.join("\n");
                }
                let error = TransactionError::new(code, details);
                warn!("Transaction {} failed: {}", self.id, error);
                s.error = Some(error.clone());
                self.publish(&s, Property::Error(Some(error)));
            }
        }
        self.finish(ExitStatus::Failed);
    }

    /// Reach the terminal state
    ///
    /// Idempotent once finished. Wakes every waiter.
    pub fn finish(&self, exit: ExitStatus) {
        let mut s = self.lock();
        if s.status == Status::Finished {
            return;
        }
        if exit == ExitStatus::Success {
            s.progress_floor = 100;
            s.progress = 100;
            self.publish(&s, Property::Progress(100));
        }
        if s.cancellable {
            s.cancellable = false;
            self.publish(&s, Property::Cancellable(false));
        }
        if s.paused {
            s.paused = false;
            self.publish(&s, Property::Paused(false));
        }
        s.exit = exit;
        self.publish(&s, Property::ExitStatus(exit));
        s.status = Status::Finished;
        self.publish(&s, Property::Status(Status::Finished));
        info!("Transaction {} finished: {:?}", self.id, exit);
        drop(s);
        self.wakeup.notify_all();
    }

    /// Park until `done` returns true; false if cancelled first
    fn block_until<F>(&self, mut done: F) -> bool
    where
        F: FnMut(&mut State) -> bool,
    {
        let mut s = self.lock();
        loop {
            if s.cancelled {
                return false;
            }
            if done(&mut s) {
                return true;
            }
            s = match self.wakeup.wait_timeout(s, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Pause for a removable medium
    ///
    /// Requires the `MEDIUM` capability; returns false without pausing when
    /// the client cannot service the request, and false when cancelled.
    pub fn request_medium(&self, label: &str, mount_point: &str) -> bool {
        let previous = {
            let mut s = self.lock();
            if !s.capabilities.contains(Capabilities::MEDIUM) {
                return false;
            }
            let previous = s.status;
            if self.transition(&mut s, Status::WaitingMedium).is_err() {
                return false;
            }
            let request = MediumRequest {
                label: label.to_string(),
                mount_point: mount_point.to_string(),
            };
            s.required_medium = Some(request.clone());
            self.publish(&s, Property::RequiredMedium(Some(request)));
            s.paused = true;
            self.publish(&s, Property::Paused(true));
            previous
        };
        info!("Transaction {} waiting for medium '{}' at {}", self.id, label, mount_point);

        let resumed = self.block_until(|s| !s.paused);

        let mut s = self.lock();
        s.required_medium = None;
        self.publish(&s, Property::RequiredMedium(None));
        if s.status == Status::WaitingMedium {
            let _ = self.transition(&mut s, previous);
        }
        resumed
    }

    /// Ask the client to accept unauthenticated packages
    ///
    /// Returns `None` when the client lacks the `UNTRUSTED` capability or
    /// the transaction was cancelled, else the client's answer.
    pub fn prompt_untrusted(&self, packages: Vec<String>) -> Option<bool> {
        {
            let mut s = self.lock();
            s.unauthenticated = packages.clone();
            self.publish(&s, Property::Unauthenticated(packages));
            if !s.capabilities.contains(Capabilities::UNTRUSTED) {
                return None;
            }
            s.untrusted_reply = None;
            s.untrusted_pending = true;
            s.paused = true;
            self.publish(&s, Property::Paused(true));
        }

        let mut answer = None;
        let replied = self.block_until(|s| {
            answer = s.untrusted_reply.take();
            answer.is_some()
        });
        self.lock().untrusted_pending = false;
        if replied { answer } else { None }
    }

    /// Ask the client to resolve a configuration file conflict
    ///
    /// Returns `Some(true)` to replace with the new file, `Some(false)` to
    /// keep the old one, `None` if cancelled. Without the `CONFIG_FILE`
    /// capability the old file is kept without asking.
    pub fn prompt_config_file(&self, old_path: &str, new_path: &str) -> Option<bool> {
        let previous = {
            let mut s = self.lock();
            if !s.capabilities.contains(Capabilities::CONFIG_FILE) {
                return Some(false);
            }
            let previous = s.status;
            if self.transition(&mut s, Status::WaitingConfigFilePrompt).is_err() {
                return Some(false);
            }
            let conflict = ConfigFileConflict {
                old_path: old_path.to_string(),
                new_path: new_path.to_string(),
            };
            s.config_file_conflict = Some(conflict.clone());
            self.publish(&s, Property::ConfigFileConflict(Some(conflict)));
            s.config_file_reply = None;
            s.paused = true;
            self.publish(&s, Property::Paused(true));
            previous
        };

        let mut answer = None;
        let resolved = self.block_until(|s| {
            answer = s.config_file_reply.take();
            answer.is_some()
        });

        let mut s = self.lock();
        s.config_file_conflict = None;
        self.publish(&s, Property::ConfigFileConflict(None));
        if s.status == Status::WaitingConfigFilePrompt {
            let _ = self.transition(&mut s, previous);
        }
        if resolved { answer } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const OWNER: u32 = 1000;

    fn drain(rx: &mut broadcast::Receiver<PropertyChange>) -> Vec<Property> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change.decode().unwrap());
        }
        out
    }

    #[test]
    fn test_new_transaction_defaults() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        assert_eq!(tx.status(), Status::Setup);
        assert_eq!(tx.exit_status(), ExitStatus::Unfinished);
        assert!(tx.is_cancellable());
        assert_eq!(tx.owner(), OWNER);
        assert_eq!(tx.properties().len(), PropertyId::ALL.len());
        for (prop, id) in tx.properties().iter().zip(PropertyId::ALL) {
            assert_eq!(prop.id(), id);
        }
    }

    #[test]
    fn test_set_property_rules() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        let mut rx = tx.subscribe();

        tx.set_property(OWNER, Property::Locale("de_DE.UTF-8".into())).unwrap();
        assert_eq!(tx.locale(), "de_DE.UTF-8");
        assert_eq!(drain(&mut rx), vec![Property::Locale("de_DE.UTF-8".into())]);

        // Non-owner is rejected and nothing changes
        assert!(matches!(
            tx.set_property(4242, Property::Locale("C".into())),
            Err(Error::AccessDenied(_))
        ));
        assert_eq!(tx.locale(), "de_DE.UTF-8");

        // Read-only properties are rejected
        assert!(tx.set_property(OWNER, Property::Owner(0)).is_err());
        assert!(tx.set_property(OWNER, Property::Status(Status::Finished)).is_err());
        assert!(drain(&mut rx).is_empty());

        // Only during setup
        tx.set_status(Status::Authentication).unwrap();
        assert!(matches!(
            tx.set_property(OWNER, Property::Proxy("http://proxy:3128".into())),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_status_monotonic() {
        let tx = Transaction::new(Role::UpdateCache, OWNER);
        tx.set_status(Status::Authentication).unwrap();
        tx.set_status(Status::Waiting).unwrap();
        tx.set_status(Status::LoadingCache).unwrap();
        assert!(tx.set_status(Status::WaitingLock).is_err());
        assert_eq!(tx.status(), Status::LoadingCache);
    }

    #[test]
    fn test_role_is_immutable_once_set() {
        let tx = Transaction::new(Role::Empty, OWNER);
        tx.set_role(Role::UpdateCache).unwrap();
        assert!(tx.set_role(Role::CommitChanges).is_err());
        assert_eq!(tx.role(), Role::UpdateCache);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        tx.set_status(Status::Authentication).unwrap();
        tx.set_status(Status::Waiting).unwrap();
        let mut rx = tx.subscribe();

        tx.cancel(OWNER).unwrap();
        tx.cancel(OWNER).unwrap();
        assert!(tx.is_cancelled());
        assert_eq!(drain(&mut rx), vec![Property::Cancelled(true)]);
        assert_eq!(tx.status(), Status::Waiting);
    }

    #[test]
    fn test_cancel_before_run_finishes() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        tx.cancel(OWNER).unwrap();
        assert_eq!(tx.status(), Status::Finished);
        assert_eq!(tx.exit_status(), ExitStatus::Cancelled);
    }

    #[test]
    fn test_cancel_ignored_when_not_cancellable() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        tx.set_cancellable(false);
        tx.cancel(OWNER).unwrap();
        assert!(!tx.is_cancelled());
        assert!(tx.cancel(7).is_err());
    }

    #[test]
    fn test_progress_floor_and_sentinel() {
        let tx = Transaction::new(Role::UpdateCache, OWNER);
        tx.set_progress(40);
        tx.set_progress(30);
        assert_eq!(tx.progress(), 40);
        tx.set_progress(PROGRESS_UNKNOWN);
        assert_eq!(tx.progress(), PROGRESS_UNKNOWN);
        tx.set_progress(20);
        assert_eq!(tx.progress(), PROGRESS_UNKNOWN);
        tx.set_progress(250);
        assert_eq!(tx.progress(), 100);
    }

    #[test]
    fn test_first_error_wins() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        tx.append_error_detail("E: foo: broken");
        tx.fail(ErrorCode::CommitError, "");
        tx.fail(ErrorCode::FetchError, "later");

        let error = tx.error().unwrap();
        assert_eq!(error.code, ErrorCode::CommitError);
        assert_eq!(error.details, "E: foo: broken");
        assert_eq!(tx.exit_status(), ExitStatus::Failed);
        assert!(!tx.is_cancellable());
    }

    #[test]
    fn test_finish_success_reports_full_progress() {
        let tx = Transaction::new(Role::UpdateSearchIndex, OWNER);
        let mut rx = tx.subscribe();
        tx.finish(ExitStatus::Success);

        let changes = drain(&mut rx);
        assert!(changes.contains(&Property::Progress(100)));
        assert_eq!(changes.last(), Some(&Property::Status(Status::Finished)));
    }

    #[test]
    fn test_medium_request_round_trip() {
        let tx = Transaction::from_request(
            TransactionRequest::new(Role::CommitChanges).with_capabilities(Capabilities::MEDIUM),
            OWNER,
        );
        for status in [Status::Authentication, Status::Waiting, Status::Downloading] {
            tx.set_status(status).unwrap();
        }

        let worker = {
            let tx = tx.clone();
            thread::spawn(move || tx.request_medium("Disc 1", "/media/cdrom"))
        };

        while tx.status() != Status::WaitingMedium {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(tx.is_paused());
        assert!(tx.provide_medium(OWNER, "/mnt").is_err());
        assert!(tx.provide_medium(9, "/media/cdrom").is_err());
        tx.provide_medium(OWNER, "/media/cdrom").unwrap();

        assert!(worker.join().unwrap());
        assert_eq!(tx.status(), Status::Downloading);
        assert!(!tx.is_paused());
    }

    #[test]
    fn test_medium_request_without_capability() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        for status in [Status::Authentication, Status::Waiting, Status::Downloading] {
            tx.set_status(status).unwrap();
        }
        assert!(!tx.request_medium("Disc 1", "/media/cdrom"));
        assert_eq!(tx.status(), Status::Downloading);
    }

    #[test]
    fn test_medium_wait_aborts_on_cancel() {
        let tx = Transaction::from_request(
            TransactionRequest::new(Role::CommitChanges).with_capabilities(Capabilities::MEDIUM),
            OWNER,
        );
        for status in [Status::Authentication, Status::Waiting, Status::Downloading] {
            tx.set_status(status).unwrap();
        }
        let worker = {
            let tx = tx.clone();
            thread::spawn(move || tx.request_medium("Disc 2", "/media/cdrom"))
        };
        while tx.status() != Status::WaitingMedium {
            thread::sleep(Duration::from_millis(5));
        }
        tx.cancel(OWNER).unwrap();
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn test_untrusted_prompt() {
        let tx = Transaction::from_request(
            TransactionRequest::new(Role::CommitChanges).with_capabilities(Capabilities::UNTRUSTED),
            OWNER,
        );
        assert!(tx.reply_untrusted_prompt(OWNER, true).is_err());

        let worker = {
            let tx = tx.clone();
            thread::spawn(move || tx.prompt_untrusted(vec!["foo".into()]))
        };
        while !tx.is_paused() {
            thread::sleep(Duration::from_millis(5));
        }
        tx.reply_untrusted_prompt(OWNER, true).unwrap();
        assert_eq!(worker.join().unwrap(), Some(true));
    }

    #[test]
    fn test_untrusted_reply_does_not_resume_medium_wait() {
        let tx = Transaction::from_request(
            TransactionRequest::new(Role::CommitChanges)
                .with_capabilities(Capabilities::UNTRUSTED | Capabilities::MEDIUM),
            OWNER,
        );
        for status in [Status::Authentication, Status::Waiting, Status::LoadingCache] {
            tx.set_status(status).unwrap();
        }

        let prompt = {
            let tx = tx.clone();
            thread::spawn(move || tx.prompt_untrusted(vec!["foo".into()]))
        };
        while !tx.is_paused() {
            thread::sleep(Duration::from_millis(5));
        }
        tx.reply_untrusted_prompt(OWNER, true).unwrap();
        assert_eq!(prompt.join().unwrap(), Some(true));
        // Answered once; a second reply has nothing to answer
        assert!(tx.reply_untrusted_prompt(OWNER, true).is_err());

        tx.set_status(Status::Downloading).unwrap();
        let worker = {
            let tx = tx.clone();
            thread::spawn(move || tx.request_medium("Disc 1", "/media/cdrom"))
        };
        while tx.status() != Status::WaitingMedium {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            tx.reply_untrusted_prompt(OWNER, true),
            Err(Error::InvalidState(_))
        ));
        thread::sleep(Duration::from_millis(50));
        assert!(tx.is_paused());
        assert_eq!(tx.status(), Status::WaitingMedium);
        assert!(!worker.is_finished());

        tx.provide_medium(OWNER, "/media/cdrom").unwrap();
        assert!(worker.join().unwrap());
        assert_eq!(tx.status(), Status::Downloading);
    }

    #[test]
    fn test_untrusted_reply_rejected_during_config_file_prompt() {
        let tx = Transaction::from_request(
            TransactionRequest::new(Role::CommitChanges)
                .with_capabilities(Capabilities::UNTRUSTED | Capabilities::CONFIG_FILE),
            OWNER,
        );
        tx.set_unauthenticated(vec!["foo".into()]);
        for status in [Status::Authentication, Status::Waiting, Status::Committing] {
            tx.set_status(status).unwrap();
        }
        let worker = {
            let tx = tx.clone();
            thread::spawn(move || tx.prompt_config_file("/etc/foo.conf", "/etc/foo.conf.new"))
        };
        while tx.status() != Status::WaitingConfigFilePrompt {
            thread::sleep(Duration::from_millis(5));
        }

        let mut rx = tx.subscribe();
        assert!(tx.reply_untrusted_prompt(OWNER, false).is_err());
        assert!(tx.is_paused());
        assert!(drain(&mut rx).is_empty());

        tx.resolve_config_file_conflict(OWNER, "/etc/foo.conf", true).unwrap();
        assert_eq!(worker.join().unwrap(), Some(true));
    }

    #[test]
    fn test_untrusted_prompt_without_capability() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        assert_eq!(tx.prompt_untrusted(vec!["foo".into()]), None);
        assert!(!tx.is_paused());
    }

    #[test]
    fn test_config_file_prompt() {
        let tx = Transaction::from_request(
            TransactionRequest::new(Role::CommitChanges).with_capabilities(Capabilities::CONFIG_FILE),
            OWNER,
        );
        for status in [Status::Authentication, Status::Waiting, Status::Committing] {
            tx.set_status(status).unwrap();
        }
        let worker = {
            let tx = tx.clone();
            thread::spawn(move || tx.prompt_config_file("/etc/foo.conf", "/etc/foo.conf.dpkg-new"))
        };
        while tx.status() != Status::WaitingConfigFilePrompt {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(tx.resolve_config_file_conflict(OWNER, "/etc/bar.conf", true).is_err());
        tx.resolve_config_file_conflict(OWNER, "/etc/foo.conf", true).unwrap();

        assert_eq!(worker.join().unwrap(), Some(true));
        assert_eq!(tx.status(), Status::Committing);
    }

    #[test]
    fn test_config_file_default_keeps_old() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        for status in [Status::Authentication, Status::Waiting, Status::Committing] {
            tx.set_status(status).unwrap();
        }
        assert_eq!(tx.prompt_config_file("/etc/a", "/etc/a.new"), Some(false));
        assert_eq!(tx.status(), Status::Committing);
    }

    #[test]
    fn test_terminal_tail_is_bounded() {
        let tx = Transaction::new(Role::CommitChanges, OWNER);
        for i in 0..(TERMINAL_TAIL_LINES + 10) {
            tx.append_terminal_output(&format!("line {}\n", i));
        }
        let tail = tx.terminal_output();
        assert_eq!(tail.len(), TERMINAL_TAIL_LINES);
        assert_eq!(tail[0], "line 10");
    }
}
