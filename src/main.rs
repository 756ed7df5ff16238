// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use pkgworker::{PackageAction, Role, TransactionRequest};

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let socket = cli.socket.as_deref();
    let client = commands::client(socket);

    match cli.command {
        Commands::Daemon {
            config,
            idle_timeout,
            no_polkit,
        } => commands::cmd_daemon(config.as_deref(), socket, idle_timeout.as_deref(), no_polkit),
        Commands::Update { opts } => {
            commands::cmd_transaction(&client, commands::simple_request(Role::UpdateCache), &opts)
        }
        Commands::Install { packages, opts } => {
            let request = TransactionRequest::new(Role::CommitChanges)
                .with_packages(commands::package_map(&packages, PackageAction::Install));
            commands::cmd_transaction(&client, request, &opts)
        }
        Commands::Remove {
            packages,
            purge,
            opts,
        } => {
            let action = if purge {
                PackageAction::Purge
            } else {
                PackageAction::Remove
            };
            let request = TransactionRequest::new(Role::CommitChanges)
                .with_packages(commands::package_map(&packages, action));
            commands::cmd_transaction(&client, request, &opts)
        }
        Commands::Upgrade { opts } => {
            commands::cmd_transaction(&client, commands::simple_request(Role::UpgradeSystem), &opts)
        }
        Commands::InstallFile { path, opts } => {
            let request = commands::install_file_request(&path)?;
            commands::cmd_transaction(&client, request, &opts)
        }
        Commands::Download { packages, opts } => {
            let request = TransactionRequest::new(Role::DownloadArchives)
                .with_packages(commands::package_map(&packages, PackageAction::Install));
            commands::cmd_transaction(&client, request, &opts)
        }
        Commands::SearchIndex { opts } => commands::cmd_transaction(
            &client,
            commands::simple_request(Role::UpdateSearchIndex),
            &opts,
        ),
        Commands::Watch { id, yes } => commands::cmd_watch(&client, &id, yes),
        Commands::Cancel { id } => commands::cmd_cancel(&client, &id),
        Commands::Show { id, output } => commands::cmd_show(&client, &id, output),
        Commands::Queue { follow } => commands::cmd_queue(&client, follow),
    }
}
