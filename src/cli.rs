// src/cli.rs
//! CLI definitions for pkgworker
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pkgworker")]
#[command(author = "pkgworker Contributors")]
#[command(version)]
#[command(about = "Queued, observable package transactions run by a privileged daemon", long_about = None)]
pub struct Cli {
    /// Daemon socket path (default: /run/pkgworker/pkgworker.sock)
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every transaction-creating command
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TransactionOpts {
    /// Accept packages without a valid signature
    #[arg(long)]
    pub allow_unauthenticated: bool,

    /// Answer every prompt with yes (replace conffiles, accept untrusted)
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// HTTP proxy for downloads
    #[arg(long)]
    pub proxy: Option<String>,

    /// Print the transaction id and return once it is queued
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon
    Daemon {
        /// Configuration file (default: /etc/pkgworker/pkgworker.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Exit after this long with nothing to do (e.g. "10m")
        #[arg(long)]
        idle_timeout: Option<String>,

        /// Grant every caller without asking PolicyKit
        #[arg(long)]
        no_polkit: bool,
    },

    /// Refresh package metadata
    Update {
        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Install packages (`name` or `name,version`)
    Install {
        #[arg(required = true)]
        packages: Vec<String>,

        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Remove packages
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Also remove configuration files
        #[arg(long)]
        purge: bool,

        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Upgrade every installed package
    Upgrade {
        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Install a local package file
    InstallFile {
        path: PathBuf,

        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Download package archives without installing them
    Download {
        #[arg(required = true)]
        packages: Vec<String>,

        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Rebuild the package search index
    SearchIndex {
        #[command(flatten)]
        opts: TransactionOpts,
    },

    /// Follow a running transaction
    Watch {
        id: String,

        /// Answer every prompt with yes
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Cancel a transaction
    Cancel { id: String },

    /// Show every property of a transaction
    Show {
        id: String,

        /// Print the package manager's recent terminal output instead
        #[arg(long)]
        output: bool,
    },

    /// Show the transaction queue
    Queue {
        /// Keep printing queue changes
        #[arg(short, long)]
        follow: bool,
    },
}
