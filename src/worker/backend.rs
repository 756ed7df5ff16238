// src/worker/backend.rs

//! Package-manager backend
//!
//! The worker never looks inside the package database. Everything it needs
//! from the package manager goes through [`PackageBackend`]: loading the
//! cache, the list of index files to refresh, the archive plan for a set of
//! instructions and the command that commits them.
//!
//! [`CommandBackend`] implements the trait with external helper programs
//! named in the `[backend]` configuration section.
//!
//! # Instructions
//!
//! A transaction's package map is flattened into instruction strings
//! passed to the helpers as arguments:
//!
//! - `install=foo`, `remove=bar,1.2-1`, ... one per package
//! - `install-file=/tmp/foo.deb` for a local package file
//! - `upgrade-system` for a full upgrade
//!
//! # Resolve helper output
//!
//! One archive per line, tab separated:
//!
//! ```text
//! <uri>\t<size>\t<package>[\tuntrusted]
//! ```
//!
//! Exit codes: 0 planned, 2 package not found, 3 wrong architecture,
//! 4 download not allowed, anything else a marking failure.

use crate::config::BackendSection;
use crate::transaction::{ErrorCode, PackageMap, Role, TransactionError};
use crate::worker::acquire::AcquireItem;
use crate::worker::install::InstallCommand;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info};

pub type BackendResult<T> = std::result::Result<T, TransactionError>;

/// Archives a set of instructions needs
#[derive(Debug, Clone, Default)]
pub struct ArchivePlan {
    /// Archives not yet in the archive directory
    pub items: Vec<AcquireItem>,
    /// Packages without a valid signature chain
    pub unauthenticated: Vec<String>,
    /// Bytes to download
    pub download_size: u64,
}

/// Operations the worker needs from the package manager
pub trait PackageBackend: Send {
    /// Package-manager lock file
    fn lock_path(&self) -> &Path;

    /// Directory archives are downloaded into
    fn archive_dir(&self) -> &Path;

    /// Load (or verify) the package database
    fn open_cache(&self) -> BackendResult<()>;

    /// Index files fetched by an update
    fn index_items(&self) -> Vec<AcquireItem>;

    /// Integrate freshly fetched index files
    fn apply_indexes(&self) -> BackendResult<()>;

    /// Work out which archives `instructions` need
    fn plan_archives(&self, instructions: &[String]) -> BackendResult<ArchivePlan>;

    /// Command that unpacks and configures `instructions`
    fn commit_command(&self, instructions: &[String]) -> InstallCommand;

    /// Rebuild the package search index
    fn rebuild_search_index(&self) -> BackendResult<()>;
}

/// Flatten a transaction's work into instruction strings
pub fn instructions(role: Role, packages: &PackageMap, package_file: &str) -> Vec<String> {
    let mut out: Vec<String> = packages
        .iter()
        .map(|(name, action)| format!("{}={}", action.as_str(), name))
        .collect();
    match role {
        Role::UpgradeSystem => out.push("upgrade-system".to_string()),
        Role::InstallFile if !package_file.is_empty() => {
            out.push(format!("install-file={}", package_file));
        }
        _ => {}
    }
    out
}

/// Backend driven by external helper programs
#[derive(Debug, Clone)]
pub struct CommandBackend {
    config: BackendSection,
}

impl CommandBackend {
    pub fn new(config: BackendSection) -> Self {
        Self { config }
    }

    fn run_helper(&self, argv: &[String], extra: &[String]) -> BackendResult<Output> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            TransactionError::new(ErrorCode::UnknownError, "backend helper has no program")
        })?;
        debug!("Running backend helper {} {:?}", program, extra);
        Command::new(program)
            .args(args)
            .args(extra)
            .output()
            .map_err(|e| {
                TransactionError::new(
                    ErrorCode::UnknownError,
                    format!("Failed to run {}: {}", program, e),
                )
            })
    }

    /// Run an optional helper, mapping a non-zero exit to `code`
    fn run_optional(&self, argv: Option<&Vec<String>>, code: ErrorCode) -> BackendResult<()> {
        let Some(argv) = argv else {
            return Ok(());
        };
        let output = self.run_helper(argv, &[])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransactionError::new(code, helper_message(&output)))
        }
    }
}

impl PackageBackend for CommandBackend {
    fn lock_path(&self) -> &Path {
        &self.config.lock_path
    }

    fn archive_dir(&self) -> &Path {
        &self.config.archive_dir
    }

    fn open_cache(&self) -> BackendResult<()> {
        self.run_optional(self.config.check.as_ref(), ErrorCode::InitError)
    }

    fn index_items(&self) -> Vec<AcquireItem> {
        self.config
            .index_sources
            .iter()
            .map(|uri| {
                let destination = self.config.lists_dir.join(index_file_name(uri));
                AcquireItem::new(uri, destination).with_short_desc(short_desc(uri))
            })
            .collect()
    }

    fn apply_indexes(&self) -> BackendResult<()> {
        self.run_optional(self.config.update.as_ref(), ErrorCode::InitError)
    }

    fn plan_archives(&self, instructions: &[String]) -> BackendResult<ArchivePlan> {
        let Some(ref argv) = self.config.resolve else {
            return Ok(ArchivePlan::default());
        };
        let output = self.run_helper(argv, instructions)?;
        if !output.status.success() {
            let code = match output.status.code() {
                Some(2) => ErrorCode::NotFoundError,
                Some(3) => ErrorCode::WrongArchError,
                Some(4) => ErrorCode::DownloadDisallowedError,
                _ => ErrorCode::MarkingError,
            };
            return Err(TransactionError::new(code, helper_message(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let plan = parse_plan(&stdout, &self.config.archive_dir)?;
        info!(
            "Planned {} archive(s), {} bytes to download",
            plan.items.len(),
            plan.download_size
        );
        Ok(plan)
    }

    fn commit_command(&self, instructions: &[String]) -> InstallCommand {
        let (program, args) = match self.config.commit.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("/bin/false", &[][..]),
        };
        let mut command = InstallCommand::new(program);
        for arg in args.iter().chain(instructions) {
            command = command.arg(arg.as_str());
        }
        command
    }

    fn rebuild_search_index(&self) -> BackendResult<()> {
        self.run_optional(self.config.search_index.as_ref(), ErrorCode::UnknownError)
    }
}

/// Parse resolve helper output into a plan
///
/// Archives already present in `archive_dir` with the expected size are
/// left out.
pub fn parse_plan(text: &str, archive_dir: &Path) -> BackendResult<ArchivePlan> {
    let mut plan = ArchivePlan::default();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let (uri, size, package) = match fields.as_slice() {
            [uri, size, package, ..] => (*uri, *size, *package),
            _ => {
                return Err(TransactionError::new(
                    ErrorCode::MarkingError,
                    format!("Malformed plan line: {:?}", line),
                ));
            }
        };
        let size: u64 = size.trim().parse().map_err(|_| {
            TransactionError::new(ErrorCode::MarkingError, format!("Bad archive size in {:?}", line))
        })?;
        if fields.get(3).is_some_and(|flag| flag.trim() == "untrusted") {
            plan.unauthenticated.push(package.to_string());
        }

        let destination = archive_dir.join(archive_file_name(uri));
        if std::fs::metadata(&destination).is_ok_and(|m| m.len() == size) {
            debug!("{} already downloaded", destination.display());
            continue;
        }
        plan.download_size += size;
        plan.items
            .push(AcquireItem::new(uri, destination).with_short_desc(package).with_size(size));
    }
    Ok(plan)
}

/// Last path segment of a locator
fn archive_file_name(uri: &str) -> PathBuf {
    let name = uri.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("archive");
    PathBuf::from(name)
}

/// Flatten an index locator into a unique file name
fn index_file_name(uri: &str) -> String {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    without_scheme.replace('/', "_")
}

fn short_desc(uri: &str) -> String {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    match without_scheme.split_once('/') {
        Some((host, path)) => format!("{} {}", host, path.rsplit('/').next().unwrap_or(path)),
        None => without_scheme.to_string(),
    }
}

fn helper_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("backend helper exited with {}", output.status)
    } else {
        stderr
    }
}
