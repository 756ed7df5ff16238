// src/lib.rs

//! pkgworker - privileged package transaction daemon
//!
//! Unprivileged clients ask a single trusted daemon to refresh package
//! metadata, install, remove or upgrade packages, and follow the work as
//! it happens.
//!
//! # Architecture
//!
//! - Transactions: one privileged operation each, a state machine plus a
//!   property store that publishes every change
//! - Queue: strict FIFO admission, one transaction executing at a time
//! - Worker: a dedicated thread driving downloads and the package manager
//!   child process
//! - Daemon: HTTP over a Unix socket, with Server-Sent Events for changes
//! - Client: blocking API and a mirror that turns changes into typed events

pub mod client;
pub mod config;
pub mod daemon;
mod error;
pub mod lock;
pub mod progress;
pub mod transaction;
pub mod worker;

pub use client::{DaemonClient, MirrorEvent, MirrorSubscription, TransactionMirror};
pub use config::WorkerConfig;
pub use daemon::{DaemonConfig, run_daemon};
pub use error::{Error, Result};
pub use progress::{DownloadProgress, DownloadStatus, TransactionProgressBar};
pub use transaction::{
    Capabilities, ErrorCode, ExitStatus, PackageAction, Role, Status, Transaction,
    TransactionRequest,
};
pub use worker::{Worker, WorkerSettings};
