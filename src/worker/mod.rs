// src/worker/mod.rs

//! Transaction execution
//!
//! The worker runs on its own OS thread and executes the transactions the
//! queue dispatches, strictly one at a time. Every blocking wait of a
//! transaction happens here, never on the IPC runtime: the package-manager
//! lock, downloads, medium and prompt waits, and the install child.
//!
//! # Execution
//!
//! ```text
//! Waiting ─► WaitingLock ─► LoadingCache ─┬─► Downloading ─► Committing ─► Finished
//!                                         └─► (role needs no download) ───────┘
//! ```
//!
//! Progress slices per role:
//!
//! | Role              | Download  | Commit    |
//! |-------------------|-----------|-----------|
//! | UpdateCache       | 0..90     | (apply)   |
//! | DownloadArchives  | 0..100    |           |
//! | CommitChanges etc | 0..50     | 50..100   |
//!
//! Once the install child starts the transaction is no longer cancellable.

pub mod acquire;
pub mod backend;
pub mod fetcher;
pub mod install;

use crate::error::Error;
use crate::lock::FileLock;
use crate::transaction::{ErrorCode, ExitStatus, QueueHandle, Role, Status, Transaction, TransactionError};
use backend::{ArchivePlan, PackageBackend};
use fetcher::{FetchSettings, HttpFetcher};
use install::InstallOutcome;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment handed to the commit child when a helper socket is set
const DEBCONF_FRONTEND: (&str, &str) = ("DEBIAN_FRONTEND", "passthrough");
const DEBCONF_PIPE_ENV: &str = "DEBCONF_PIPE";

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub fetch: FetchSettings,
    /// Delay between package-manager lock attempts
    pub lock_retry: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            fetch: FetchSettings::default(),
            lock_retry: Duration::from_secs(1),
        }
    }
}

/// Why a step stopped the transaction
#[derive(Debug)]
enum Abort {
    Cancelled,
    Failed(TransactionError),
}

impl From<TransactionError> for Abort {
    fn from(e: TransactionError) -> Self {
        Abort::Failed(e)
    }
}

type StepResult<T = ()> = std::result::Result<T, Abort>;

fn failed(code: ErrorCode, details: impl Into<String>) -> Abort {
    Abort::Failed(TransactionError::new(code, details))
}

/// Executes transactions
pub struct Worker {
    backend: Box<dyn PackageBackend>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(backend: Box<dyn PackageBackend>, settings: WorkerSettings) -> Self {
        Self { backend, settings }
    }

    /// Start the worker thread
    ///
    /// The thread runs until the queue drops its dispatch channel.
    pub fn spawn(
        self,
        jobs: Receiver<Arc<Transaction>>,
        queue: QueueHandle,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("pkgworker-worker".to_string())
            .spawn(move || {
                info!("Worker thread started");
                while let Ok(transaction) = jobs.recv() {
                    self.execute(&transaction);
                    queue.completed(transaction.id());
                }
                info!("Worker thread exiting");
            })
    }

    /// Execute one transaction to its terminal state
    pub fn execute(&self, tx: &Transaction) {
        if tx.is_finished() {
            return;
        }
        if tx.is_cancelled() {
            tx.finish(ExitStatus::Cancelled);
            return;
        }

        info!("Executing transaction {} ({})", tx.id(), tx.role());
        match self.run_role(tx) {
            Ok(()) => tx.finish(ExitStatus::Success),
            Err(Abort::Cancelled) => tx.finish(ExitStatus::Cancelled),
            Err(Abort::Failed(e)) => tx.fail(e.code, e.details),
        }
    }

    fn run_role(&self, tx: &Transaction) -> StepResult {
        if tx.role() == Role::Empty {
            return Ok(());
        }

        let _lock = self.lock_package_manager(tx)?;

        advance(tx, Status::LoadingCache)?;
        self.backend.open_cache()?;

        match tx.role() {
            Role::UpdateCache => self.update_cache(tx),
            Role::CommitChanges | Role::UpgradeSystem | Role::InstallFile => self.commit(tx, true),
            Role::DownloadArchives => self.commit(tx, false),
            Role::UpdateSearchIndex => {
                tx.set_status_details("Rebuilding search index");
                self.backend.rebuild_search_index()?;
                Ok(())
            }
            Role::Empty => Ok(()),
        }
    }

    /// Wait for the package-manager lock while the client lets us
    fn lock_package_manager(&self, tx: &Transaction) -> StepResult<FileLock> {
        advance(tx, Status::WaitingLock)?;
        let path = self.backend.lock_path();
        let lock = FileLock::acquire_while(path, self.settings.lock_retry, || {
            debug!("Package manager lock {} is busy", path.display());
            !tx.is_cancelled()
        })
        .map_err(|e| failed(ErrorCode::LockError, e.to_string()))?;
        lock.ok_or(Abort::Cancelled)
    }

    fn update_cache(&self, tx: &Transaction) -> StepResult {
        let mut items = self.backend.index_items();
        self.fetch(tx, &mut items, 0, 90)?;
        if tx.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        tx.set_status_details("Applying index files");
        self.backend.apply_indexes()?;
        Ok(())
    }

    /// Download and, if `install`, commit the transaction's packages
    fn commit(&self, tx: &Transaction, install: bool) -> StepResult {
        let role = tx.role();
        let package_file = tx.package_file();
        if role == Role::InstallFile && !Path::new(&package_file).is_file() {
            return Err(failed(
                ErrorCode::NotFoundError,
                format!("Package file {} does not exist", package_file),
            ));
        }

        let instructions = backend::instructions(role, &tx.packages(), &package_file);
        tx.set_status_details("Resolving packages");
        let mut plan = self.backend.plan_archives(&instructions)?;
        self.check_untrusted(tx, &plan)?;
        self.check_disk_space(&plan)?;

        let fetch_end = if install { 50 } else { 100 };
        let commit_begin = if plan.items.is_empty() {
            0
        } else {
            self.fetch(tx, &mut plan.items, 0, fetch_end)?;
            fetch_end
        };
        if !install {
            return Ok(());
        }
        if tx.is_cancelled() {
            return Err(Abort::Cancelled);
        }

        tx.set_cancellable(false);
        advance(tx, Status::Committing)?;

        let mut command = self.backend.commit_command(&instructions);
        let debconf = tx.debconf_socket();
        if !debconf.is_empty() {
            command = command
                .env(DEBCONF_FRONTEND.0, DEBCONF_FRONTEND.1)
                .env(DEBCONF_PIPE_ENV, debconf);
        }

        let outcome = install::supervise(tx, &command, commit_begin, 100)
            .map_err(|e| failed(ErrorCode::CommitError, e.to_string()))?;
        let message = match outcome {
            InstallOutcome::Completed => return Ok(()),
            InstallOutcome::Failed(code) => format!("The package manager failed with exit code {}", code),
            InstallOutcome::Incomplete => "Some packages could not be configured".to_string(),
            InstallOutcome::Killed(signal) => format!("The package manager was killed by {}", signal.as_str()),
        };
        warn!("Commit of transaction {} failed: {}", tx.id(), message);
        // Per-package errors say more than the exit code
        let details = if tx.error_log().is_empty() { message } else { String::new() };
        Err(failed(ErrorCode::CommitError, details))
    }

    fn check_untrusted(&self, tx: &Transaction, plan: &ArchivePlan) -> StepResult {
        if plan.unauthenticated.is_empty() {
            return Ok(());
        }
        let packages = plan.unauthenticated.clone();
        if tx.allows_unauthenticated() {
            info!("Installing unauthenticated packages: {}", packages.join(", "));
            tx.set_unauthenticated(packages);
            return Ok(());
        }

        let listed = packages.join(", ");
        match tx.prompt_untrusted(packages) {
            Some(true) => Ok(()),
            Some(false) => Err(failed(
                ErrorCode::UntrustedError,
                format!("Installation of unauthenticated packages was declined: {}", listed),
            )),
            None if tx.is_cancelled() => Err(Abort::Cancelled),
            None => Err(failed(
                ErrorCode::UntrustedError,
                format!("The following packages cannot be authenticated: {}", listed),
            )),
        }
    }

    fn check_disk_space(&self, plan: &ArchivePlan) -> StepResult {
        if plan.download_size == 0 {
            return Ok(());
        }
        let dir = self.backend.archive_dir();
        std::fs::create_dir_all(dir).map_err(|e| {
            failed(ErrorCode::UnknownError, format!("Failed to create {}: {}", dir.display(), e))
        })?;
        let available = fs2::available_space(dir).map_err(|e| {
            failed(ErrorCode::DiskSpaceError, format!("Cannot stat {}: {}", dir.display(), e))
        })?;
        if available < plan.download_size {
            return Err(failed(
                ErrorCode::DiskSpaceError,
                format!(
                    "{} bytes are needed in {} but only {} are free",
                    plan.download_size,
                    dir.display(),
                    available
                ),
            ));
        }
        Ok(())
    }

    fn fetch(&self, tx: &Transaction, items: &mut [acquire::AcquireItem], begin: u32, end: u32) -> StepResult {
        if items.is_empty() {
            return Ok(());
        }
        let fetcher = HttpFetcher::new(self.settings.fetch.clone(), &tx.proxy())
            .map_err(|e| failed(ErrorCode::FetchError, e.to_string()))?;
        let mut progress = acquire::TransactionAcquireProgress::new(tx, begin, end);

        match fetcher.fetch(items, &mut progress) {
            Ok(summary) if summary.failed > 0 => {
                info!("{} of {} item(s) failed to download", summary.failed, items.len());
                Err(failed(ErrorCode::FetchError, String::new()))
            }
            Ok(_) => Ok(()),
            Err(_) if tx.is_cancelled() => Err(Abort::Cancelled),
            Err(Error::Cancelled) => Err(Abort::Cancelled),
            Err(e) => Err(failed(ErrorCode::FetchError, e.to_string())),
        }
    }
}

/// Move the state machine, treating a rejected move as an internal error
fn advance(tx: &Transaction, status: Status) -> StepResult {
    tx.set_status(status)
        .map_err(|e| failed(ErrorCode::UnknownError, e.to_string()))
}
