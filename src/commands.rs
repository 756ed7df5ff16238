// src/commands.rs
//! Command implementations for the pkgworker binary

use crate::cli::TransactionOpts;
use anyhow::{Context, Result, bail};
use pkgworker::client::DaemonClient;
use pkgworker::config::{WorkerConfig, parse_duration};
use pkgworker::transaction::PackageMap;
use pkgworker::worker::backend::CommandBackend;
use pkgworker::{
    Capabilities, DaemonConfig, DownloadStatus, ErrorCode, ExitStatus, MirrorEvent,
    MirrorSubscription, PackageAction, Role, TransactionProgressBar, TransactionRequest, Worker,
    WorkerSettings,
};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Build a client for the given socket, or the default one
pub fn client(socket: Option<&Path>) -> DaemonClient {
    match socket {
        Some(path) => DaemonClient::with_socket_path(path),
        None => DaemonClient::new(),
    }
}

/// Run the daemon in the foreground
pub fn cmd_daemon(
    config_path: Option<&Path>,
    socket: Option<&Path>,
    idle_timeout: Option<&str>,
    no_polkit: bool,
) -> Result<()> {
    let file = WorkerConfig::load_or_default(config_path)?;

    let mut config: DaemonConfig = file.to_daemon_config()?;
    if let Some(socket) = socket {
        config = config.with_socket_path(socket);
    }
    if let Some(idle) = idle_timeout {
        let idle = parse_duration(idle).context("Invalid --idle-timeout")?;
        config = config.with_idle_timeout(idle.as_secs());
    }
    if no_polkit {
        config = config.without_polkit();
    }
    if pkgworker::daemon::is_daemon_running(&config.lock_path) {
        bail!(
            "Another daemon holds {}; stop it first",
            config.lock_path.display()
        );
    }

    let settings = WorkerSettings {
        fetch: file.fetch_settings()?,
        ..WorkerSettings::default()
    };
    let worker = Worker::new(Box::new(CommandBackend::new(file.backend.clone())), settings);

    info!("Socket: {}", config.socket_path.display());
    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    runtime.block_on(pkgworker::run_daemon(config, worker))?;
    Ok(())
}

/// Package map with one action for every name
pub fn package_map(packages: &[String], action: PackageAction) -> PackageMap {
    packages
        .iter()
        .map(|name| (name.clone(), action))
        .collect()
}

/// Create, run and follow a transaction
pub fn cmd_transaction(
    client: &DaemonClient,
    mut request: TransactionRequest,
    opts: &TransactionOpts,
) -> Result<()> {
    request.allow_unauthenticated = opts.allow_unauthenticated;
    request.proxy = opts.proxy.clone();
    request.locale = std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LANG"))
        .ok();
    if !opts.no_wait && (opts.yes || std::io::stdin().is_terminal()) {
        request.capabilities =
            Capabilities::MEDIUM | Capabilities::UNTRUSTED | Capabilities::CONFIG_FILE;
    }

    let tx = client.create(&request).context("Failed to create transaction")?;
    info!("Created transaction {} ({})", tx.id, tx.role);

    if opts.no_wait {
        client.run(&tx.id)?;
        println!("{}", tx.id);
        return Ok(());
    }

    // Subscribe first so no change between run and attach is missed
    let subscription = client.subscribe(&tx.id)?;
    client
        .run(&tx.id)
        .with_context(|| format!("Failed to run transaction {}", tx.id))?;
    follow(subscription, opts.yes)
}

/// Follow an existing transaction
pub fn cmd_watch(client: &DaemonClient, id: &str, yes: bool) -> Result<()> {
    let subscription = client.subscribe(id)?;
    if subscription.mirror().is_finished() {
        return report_exit(&subscription, subscription.mirror().exit_status());
    }
    follow(subscription, yes)
}

pub fn cmd_cancel(client: &DaemonClient, id: &str) -> Result<()> {
    let summary = client.cancel(id)?;
    println!("{}: {}", summary.id, summary.status);
    Ok(())
}

pub fn cmd_show(client: &DaemonClient, id: &str, output: bool) -> Result<()> {
    if output {
        for line in client.terminal_output(id)? {
            println!("{}", line);
        }
        return Ok(());
    }
    for property in client.properties(id)? {
        println!("{:?}: {}", property.id(), property.to_wire());
    }
    Ok(())
}

pub fn cmd_queue(client: &DaemonClient, follow: bool) -> Result<()> {
    let print = |queue: &pkgworker::transaction::QueueChange| {
        match &queue.active {
            Some(active) => println!("active: {}", active),
            None => println!("active: -"),
        }
        for (position, id) in queue.queued.iter().enumerate() {
            println!("  {:>3}  {}", position, id);
        }
    };

    if !follow {
        print(&client.queue()?);
        return Ok(());
    }

    for event in client.queue_stream()? {
        let event = event?;
        if event.event != "queue" {
            continue;
        }
        let queue = serde_json::from_str(&event.data).context("Malformed queue event")?;
        print(&queue);
    }
    Ok(())
}

fn confirm(bar: &TransactionProgressBar, question: &str) -> bool {
    bar.suspend(|| {
        print!("{} [y/N] ", question);
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).is_ok()
            && matches!(answer.trim(), "y" | "Y" | "yes")
    })
}

/// Render a subscription until the transaction finishes
fn follow(mut subscription: MirrorSubscription, yes: bool) -> Result<()> {
    let id = subscription.mirror().id().to_string();
    let bar = TransactionProgressBar::new(&subscription.mirror().role().to_string());
    bar.set_progress(subscription.mirror().progress());

    while let Some(event) = subscription.next() {
        let client = subscription.client();
        match event {
            MirrorEvent::StatusChanged(status) => bar.set_message(&status.to_string()),
            MirrorEvent::StatusDetailsChanged(details) if !details.is_empty() => {
                bar.set_message(&details)
            }
            MirrorEvent::ProgressChanged(percent) => bar.set_progress(percent),
            MirrorEvent::DownloadProgressChanged(item) => match item.status {
                DownloadStatus::Error | DownloadStatus::AuthError | DownloadStatus::NetworkError => {
                    bar.println(&format!("failed: {} {}", item.uri, item.message));
                }
                DownloadStatus::Done => bar.println(&format!("fetched: {}", item.short_desc)),
                _ => {}
            },
            MirrorEvent::ErrorOccurred(error) => bar.println(&format!("error: {}", error)),
            MirrorEvent::MediumRequired(request) => {
                let question = format!(
                    "Insert '{}' and mount it at {}. Continue?",
                    request.label, request.mount_point
                );
                if yes || confirm(&bar, &question) {
                    client.provide_medium(&id, &request.mount_point)?;
                } else {
                    client.cancel(&id)?;
                }
            }
            MirrorEvent::PromptUntrusted(packages) => {
                let question = format!(
                    "These packages cannot be authenticated: {}. Install anyway?",
                    packages.join(", ")
                );
                let approved = yes || confirm(&bar, &question);
                client.reply_untrusted(&id, approved)?;
            }
            MirrorEvent::ConfigFileConflict(conflict) => {
                let question = format!(
                    "Configuration file {} was modified. Replace it with the new version?",
                    conflict.old_path
                );
                let replace = yes || confirm(&bar, &question);
                client.resolve_conffile(&id, &conflict.old_path, replace)?;
            }
            MirrorEvent::Finished(exit) => {
                return match exit {
                    ExitStatus::Success => {
                        bar.finish("done");
                        Ok(())
                    }
                    other => {
                        bar.abandon(&other_label(other));
                        report_exit(&subscription, other)
                    }
                };
            }
            MirrorEvent::WorkerDisappeared => {
                bar.abandon("daemon disappeared");
                bail!("{}", ErrorCode::WorkerDisappeared);
            }
            _ => {}
        }
    }
    Ok(())
}

fn other_label(exit: ExitStatus) -> String {
    match exit {
        ExitStatus::Cancelled => "cancelled".to_string(),
        ExitStatus::Failed => "failed".to_string(),
        _ => "unfinished".to_string(),
    }
}

fn report_exit(subscription: &MirrorSubscription, exit: ExitStatus) -> Result<()> {
    let mirror = subscription.mirror();
    match exit {
        ExitStatus::Success => Ok(()),
        ExitStatus::Cancelled => bail!("Transaction {} was cancelled", mirror.id()),
        _ => match mirror.error() {
            Some(error) => bail!("Transaction {} failed: {}", mirror.id(), error),
            None => bail!("Transaction {} failed", mirror.id()),
        },
    }
}

/// Request for a role without package arguments
pub fn simple_request(role: Role) -> TransactionRequest {
    TransactionRequest::new(role)
}

/// Request to install a local file
pub fn install_file_request(path: &Path) -> Result<TransactionRequest> {
    let path: PathBuf = std::fs::canonicalize(path)
        .with_context(|| format!("Cannot find package file {}", path.display()))?;
    Ok(TransactionRequest::new(Role::InstallFile).with_package_file(path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_map() {
        let map = package_map(
            &["foo".to_string(), "bar,1.2-3".to_string()],
            PackageAction::Remove,
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map["bar,1.2-3"], PackageAction::Remove);
    }

    #[test]
    fn test_install_file_request_requires_file() {
        assert!(install_file_request(Path::new("/nonexistent/foo.deb")).is_err());

        let dir = tempfile::TempDir::new().unwrap();
        let deb = dir.path().join("foo.deb");
        std::fs::write(&deb, b"!<arch>\n").unwrap();
        let request = install_file_request(&deb).unwrap();
        assert_eq!(request.role, Some(Role::InstallFile));
        assert!(request.package_file.unwrap().ends_with("foo.deb"));
    }
}
