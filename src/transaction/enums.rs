// src/transaction/enums.rs

//! Enumerations that cross the IPC boundary
//!
//! Every enum here travels as a small integer, never as a symbolic name.
//! The integer assignments are part of the wire contract and must not be
//! reordered.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generates the integer wire mapping for a fieldless enum
macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        impl $name {
            /// All variants in wire order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Integer transmitted on the wire
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Decode a wire integer
            pub fn from_code(code: u8) -> Result<Self> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(Error::ParseError(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value.code()
            }
        }

        impl TryFrom<u8> for $name {
            type Error = Error;

            fn try_from(code: u8) -> Result<Self> {
                $name::from_code(code)
            }
        }
    };
}

/// The kind of operation a transaction performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Role {
    /// Refresh package metadata
    UpdateCache,
    /// Apply a package-instruction map
    CommitChanges,
    /// Upgrade every upgradable package
    UpgradeSystem,
    /// Install a local package file
    InstallFile,
    /// Download archives without installing
    DownloadArchives,
    /// Rebuild the package search index
    UpdateSearchIndex,
    /// No role assigned yet
    Empty,
}

wire_enum!(Role {
    UpdateCache = 0,
    CommitChanges = 1,
    UpgradeSystem = 2,
    InstallFile = 3,
    DownloadArchives = 4,
    UpdateSearchIndex = 5,
    Empty = 6,
});

impl Role {
    /// PolicyKit action required to run a transaction of this role
    ///
    /// An empty string means the role is auto-approved.
    pub fn privilege(self) -> &'static str {
        match self {
            Role::UpdateCache => "org.pkgworker.update-cache",
            Role::CommitChanges => "org.pkgworker.install-or-remove-packages",
            Role::UpgradeSystem => "org.pkgworker.upgrade-packages",
            Role::InstallFile => "org.pkgworker.install-file",
            Role::DownloadArchives => "org.pkgworker.get-archives",
            Role::UpdateSearchIndex | Role::Empty => "",
        }
    }

    /// Whether this role needs the fetch phase
    pub fn downloads(self) -> bool {
        matches!(
            self,
            Role::UpdateCache | Role::CommitChanges | Role::UpgradeSystem | Role::DownloadArchives
        )
    }

    /// Whether this role runs the install subprocess
    pub fn commits(self) -> bool {
        matches!(
            self,
            Role::CommitChanges | Role::UpgradeSystem | Role::InstallFile
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::UpdateCache => "update-cache",
            Role::CommitChanges => "commit-changes",
            Role::UpgradeSystem => "upgrade-system",
            Role::InstallFile => "install-file",
            Role::DownloadArchives => "download-archives",
            Role::UpdateSearchIndex => "update-search-index",
            Role::Empty => "empty",
        };
        f.write_str(name)
    }
}

/// Transaction state machine value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Setup,
    Waiting,
    Authentication,
    WaitingLock,
    LoadingCache,
    Downloading,
    Committing,
    /// Paused for a removable medium (side state of Downloading)
    WaitingMedium,
    /// Paused for a configuration file decision (side state of Committing)
    WaitingConfigFilePrompt,
    Finished,
}

wire_enum!(Status {
    Setup = 0,
    Waiting = 1,
    Authentication = 2,
    WaitingLock = 3,
    LoadingCache = 4,
    Downloading = 5,
    Committing = 6,
    WaitingMedium = 7,
    WaitingConfigFilePrompt = 8,
    Finished = 9,
});

impl Status {
    /// Position along the main path of the state machine
    ///
    /// Side states share the rank of the state they pause. Authorization
    /// happens before admission, so `Authentication` ranks below `Waiting`.
    pub fn rank(self) -> u8 {
        match self {
            Status::Setup => 0,
            Status::Authentication => 1,
            Status::Waiting => 2,
            Status::WaitingLock => 3,
            Status::LoadingCache => 4,
            Status::Downloading | Status::WaitingMedium => 5,
            Status::Committing | Status::WaitingConfigFilePrompt => 6,
            Status::Finished => 7,
        }
    }

    /// The state a side state returns to on resolution
    pub fn resumes_to(self) -> Option<Status> {
        match self {
            Status::WaitingMedium => Some(Status::Downloading),
            Status::WaitingConfigFilePrompt => Some(Status::Committing),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` respects the state machine
    pub fn can_transition_to(self, next: Status) -> bool {
        if self == Status::Finished {
            return false;
        }
        // Side states pause one main state and return only to it
        if let Some(origin) = self.resumes_to() {
            return next == origin || next == Status::Finished;
        }
        if let Some(origin) = next.resumes_to() {
            return self == origin;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Setup => "setting up",
            Status::Waiting => "waiting",
            Status::Authentication => "waiting for authentication",
            Status::WaitingLock => "waiting for package manager lock",
            Status::LoadingCache => "loading cache",
            Status::Downloading => "downloading",
            Status::Committing => "committing",
            Status::WaitingMedium => "waiting for medium",
            Status::WaitingConfigFilePrompt => "waiting for configuration file decision",
            Status::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Outcome carried by a finished transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ExitStatus {
    /// Not finished yet
    #[default]
    Unfinished,
    Success,
    Failed,
    Cancelled,
}

wire_enum!(ExitStatus {
    Unfinished = 0,
    Success = 1,
    Failed = 2,
    Cancelled = 3,
});

impl ExitStatus {
    /// Whether this is a terminal outcome
    pub fn is_terminal(self) -> bool {
        self != ExitStatus::Unfinished
    }
}

/// Failure taxonomy reported on a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ErrorCode {
    /// Package database failed to load
    InitError,
    /// Another manager holds the system lock
    LockError,
    /// Insufficient free space
    DiskSpaceError,
    /// Download failed
    FetchError,
    /// Install or removal failed
    CommitError,
    /// Authorization denied or caller mismatch
    AuthError,
    /// The daemon vanished mid-operation (client side only)
    WorkerDisappeared,
    /// Signature verification declined
    UntrustedError,
    DownloadDisallowedError,
    NotFoundError,
    WrongArchError,
    MarkingError,
    /// Free-text fallback
    UnknownError,
}

wire_enum!(ErrorCode {
    InitError = 1,
    LockError = 2,
    DiskSpaceError = 3,
    FetchError = 4,
    CommitError = 5,
    AuthError = 6,
    WorkerDisappeared = 7,
    UntrustedError = 8,
    DownloadDisallowedError = 9,
    NotFoundError = 10,
    WrongArchError = 11,
    MarkingError = 12,
    UnknownError = 13,
});

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::InitError => "Failed to load the package database",
            ErrorCode::LockError => "The package system is locked by another manager",
            ErrorCode::DiskSpaceError => "Not enough free disk space",
            ErrorCode::FetchError => "Failed to download packages",
            ErrorCode::CommitError => "Package operation failed",
            ErrorCode::AuthError => "Not authorized",
            ErrorCode::WorkerDisappeared => "The daemon disappeared",
            ErrorCode::UntrustedError => "Untrusted packages were not accepted",
            ErrorCode::DownloadDisallowedError => "Downloading is not allowed",
            ErrorCode::NotFoundError => "Package not found",
            ErrorCode::WrongArchError => "Package is built for a different architecture",
            ErrorCode::MarkingError => "Could not mark packages for the operation",
            ErrorCode::UnknownError => "Unknown error",
        };
        f.write_str(text)
    }
}

/// Action requested for a single package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PackageAction {
    Install,
    Reinstall,
    Upgrade,
    Downgrade,
    Remove,
    Purge,
    Held,
}

wire_enum!(PackageAction {
    Install = 0,
    Reinstall = 1,
    Upgrade = 2,
    Downgrade = 3,
    Remove = 4,
    Purge = 5,
    Held = 6,
});

impl PackageAction {
    /// Keyword handed to the install child
    pub fn as_str(self) -> &'static str {
        match self {
            PackageAction::Install => "install",
            PackageAction::Reinstall => "reinstall",
            PackageAction::Upgrade => "upgrade",
            PackageAction::Downgrade => "downgrade",
            PackageAction::Remove => "remove",
            PackageAction::Purge => "purge",
            PackageAction::Held => "hold",
        }
    }

    /// Whether packages with this action need an archive download
    pub fn needs_archive(self) -> bool {
        matches!(
            self,
            PackageAction::Install
                | PackageAction::Reinstall
                | PackageAction::Upgrade
                | PackageAction::Downgrade
        )
    }
}

/// Key of the package-instruction map, `name` or `name,version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec<'a> {
    pub name: &'a str,
    pub version: Option<&'a str>,
}

impl<'a> PackageSpec<'a> {
    /// Split a map key into name and optional target version
    pub fn parse(key: &'a str) -> Self {
        match key.split_once(',') {
            Some((name, version)) if !version.is_empty() => Self {
                name,
                version: Some(version),
            },
            Some((name, _)) => Self {
                name,
                version: None,
            },
            None => Self {
                name: key,
                version: None,
            },
        }
    }
}

/// Interactive prompts a client can service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Removable medium change requests
    pub const MEDIUM: Capabilities = Capabilities(1);
    /// Confirmation of unauthenticated packages
    pub const UNTRUSTED: Capabilities = Capabilities(1 << 1);
    /// Configuration file conflict resolution
    pub const CONFIG_FILE: Capabilities = Capabilities(1 << 2);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Capabilities(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}
