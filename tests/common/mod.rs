// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use pkgworker::DaemonClient;
use pkgworker::config::BackendSection;
use pkgworker::daemon::{self, DaemonConfig, DaemonState};
use pkgworker::transaction::QueueSettings;
use pkgworker::worker::backend::CommandBackend;
use pkgworker::{Worker, WorkerSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A daemon serving on a socket inside a temporary directory.
///
/// Dropping it shuts the runtime down; keep it alive for the whole test.
pub struct TestDaemon {
    runtime: tokio::runtime::Runtime,
    pub state: Arc<DaemonState>,
    pub socket: PathBuf,
    pub dir: TempDir,
}

impl TestDaemon {
    /// Start a daemon whose commit helper is the shell script returned by
    /// `script` for the daemon's temporary directory.
    ///
    /// The script gets the instructions (`install=foo`, ...) as positional
    /// parameters and `$PKGWORKER_STATUS_FD` for status lines.
    pub fn start<F: FnOnce(&Path) -> String>(script: F, grace_period: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("pkgworker.sock");
        let script = script(dir.path());

        let backend = BackendSection {
            lock_path: dir.path().join("pm.lock"),
            archive_dir: dir.path().join("archives"),
            lists_dir: dir.path().join("lists"),
            commit: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                script,
                "pm-commit".to_string(),
            ],
            ..BackendSection::default()
        };
        let worker = Worker::new(
            Box::new(CommandBackend::new(backend)),
            WorkerSettings {
                lock_retry: Duration::from_millis(50),
                ..WorkerSettings::default()
            },
        );

        let mut config = DaemonConfig::default()
            .with_socket_path(&socket)
            .with_lock_path(dir.path().join("daemon.lock"))
            .without_polkit();
        config.queue = QueueSettings {
            grace_period,
            ..QueueSettings::default()
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let state = {
            let _guard = runtime.enter();
            let state = DaemonState::start(config, worker).unwrap();
            let listener = tokio::net::UnixListener::bind(&socket).unwrap();
            runtime.spawn(daemon::serve(listener, state.clone()));
            state
        };

        Self {
            runtime,
            state,
            socket,
            dir,
        }
    }

    /// Stop serving as if the daemon process died
    ///
    /// Open connections are dropped; the worker thread is left behind.
    pub fn kill(self) {
        let TestDaemon { runtime, dir, .. } = self;
        runtime.shutdown_timeout(Duration::from_secs(1));
        drop(dir);
    }

    pub fn client(&self) -> DaemonClient {
        DaemonClient::with_socket_path(&self.socket)
    }

    /// Path of a file inside the daemon's temporary directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Commit script that records its instructions in `log`, reports one status
/// line per package and then sleeps `delay`.
pub fn recording_script(log: &Path, delay: &str) -> String {
    format!(
        "echo \"$*\" >> '{log}'; \
         for i in \"$@\"; do \
           echo \"pmstatus:${{i#*=}}:50:Working on $i\" >&$PKGWORKER_STATUS_FD; \
         done; \
         sleep {delay}",
        log = log.display(),
        delay = delay,
    )
}

/// Poll `check` until it returns true or `timeout` passes
pub fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}
