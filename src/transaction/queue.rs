// src/transaction/queue.rs

//! Admission queue for transactions
//!
//! The queue is a single actor task. It owns the *pending* set (created, not
//! yet authorized), the FIFO *queue* of authorized transactions and the set
//! of finished transactions waiting out their grace period. Everything else
//! talks to it through a cloneable [`QueueHandle`].
//!
//! Only the head of the queue executes. When the worker finishes it, the
//! actor removes it, publishes the new queue and hands the next head to the
//! worker. There is no priority and no preemption.

use crate::error::{Error, Result};
use crate::transaction::{ErrorCode, Status, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Queue timing settings
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Delay between a transaction finishing and its destruction
    pub grace_period: Duration,
    /// How long an unauthorized transaction may stay pending
    pub pending_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            pending_timeout: Duration::from_secs(300),
        }
    }
}

/// Queue-change notification: the active id and the ordered queued ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueChange {
    pub active: Option<String>,
    pub queued: Vec<String>,
}

enum Command {
    AddPending(Arc<Transaction>),
    Enqueue {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        id: String,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<Arc<Transaction>>>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueChange>,
    },
    Destroy {
        id: String,
    },
    ExpirePending {
        id: String,
    },
}

/// Cloneable front end of the queue actor
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::UnboundedSender<Command>,
    changes: broadcast::Sender<QueueChange>,
}

impl QueueHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Transaction queue is no longer running");
        }
    }

    /// Register a freshly created transaction
    pub async fn add_pending(&self, transaction: Arc<Transaction>) {
        self.send(Command::AddPending(transaction));
    }

    /// Move an authorized transaction from pending to the queue tail
    pub async fn enqueue(&self, id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            id: id.to_string(),
            reply,
        });
        rx.await
            .map_err(|_| Error::DaemonError("transaction queue stopped".to_string()))?
    }

    /// Remove a transaction and schedule its destruction (idempotent)
    pub async fn remove(&self, id: &str) {
        self.send(Command::Remove { id: id.to_string() });
    }

    /// Completion signal from the worker thread
    pub fn completed(&self, id: &str) {
        self.send(Command::Remove { id: id.to_string() });
    }

    /// Look up a live transaction
    pub async fn get(&self, id: &str) -> Option<Arc<Transaction>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            id: id.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Current active id and queued ids
    pub async fn snapshot(&self) -> QueueChange {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply });
        rx.await.unwrap_or_default()
    }

    /// Nothing running and nothing queued
    pub async fn is_idle(&self) -> bool {
        let snapshot = self.snapshot().await;
        snapshot.active.is_none() && snapshot.queued.is_empty()
    }

    /// Subscribe to queue-change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.changes.subscribe()
    }
}

/// The queue actor
pub struct TransactionQueue {
    settings: QueueSettings,
    pending: HashMap<String, Arc<Transaction>>,
    queue: VecDeque<Arc<Transaction>>,
    active: Option<String>,
    retiring: HashMap<String, Arc<Transaction>>,
    dispatch: std_mpsc::Sender<Arc<Transaction>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    changes: broadcast::Sender<QueueChange>,
}

impl TransactionQueue {
    /// Start the actor on the current runtime
    ///
    /// Returns the handle and the receiving end the worker thread consumes
    /// transactions from. Every transaction received must be reported back
    /// through [`QueueHandle::completed`].
    pub fn spawn(settings: QueueSettings) -> (QueueHandle, std_mpsc::Receiver<Arc<Transaction>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (dispatch, jobs) = std_mpsc::channel();
        let (changes, _) = broadcast::channel(64);

        let actor = TransactionQueue {
            settings,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            active: None,
            retiring: HashMap::new(),
            dispatch,
            commands: tx.downgrade(),
            changes: changes.clone(),
        };
        tokio::spawn(actor.run(rx));

        (
            QueueHandle {
                commands: tx,
                changes,
            },
            jobs,
        )
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Transaction queue started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::AddPending(transaction) => self.add_pending(transaction),
                Command::Enqueue { id, reply } => {
                    let _ = reply.send(self.enqueue(&id));
                }
                Command::Remove { id } => self.remove(&id),
                Command::Get { id, reply } => {
                    let _ = reply.send(self.get(&id));
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Destroy { id } => {
                    if self.retiring.remove(&id).is_some() {
                        debug!("Destroyed transaction {}", id);
                    }
                }
                Command::ExpirePending { id } => {
                    let never_run = self
                        .pending
                        .get(&id)
                        .is_some_and(|t| t.status() == Status::Setup);
                    if never_run && let Some(transaction) = self.pending.remove(&id) {
                        info!("Dropping transaction {} that was never run", id);
                        transaction.fail(
                            ErrorCode::UnknownError,
                            "transaction was not started in time",
                        );
                        self.retire(transaction);
                    }
                }
            }
        }
        debug!("Transaction queue stopped");
    }

    fn add_pending(&mut self, transaction: Arc<Transaction>) {
        let id = transaction.id().to_string();
        debug!("Pending transaction {}", id);
        self.pending.insert(id.clone(), transaction);
        self.after(self.settings.pending_timeout, Command::ExpirePending { id });
    }

    fn enqueue(&mut self, id: &str) -> Result<()> {
        let transaction = self
            .pending
            .remove(id)
            .ok_or_else(|| Error::NotFoundError(format!("transaction {} is not pending", id)))?;
        info!("Queued transaction {} ({})", id, transaction.role());
        self.queue.push_back(transaction);
        self.publish();
        self.dispatch_next();
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        let transaction = if let Some(pos) = self.queue.iter().position(|t| t.id() == id) {
            self.queue.remove(pos)
        } else {
            self.pending.remove(id)
        };

        let was_active = self.active.as_deref() == Some(id);
        if was_active {
            self.active = None;
        }

        if let Some(transaction) = transaction {
            self.retire(transaction);
            self.publish();
        }
        if was_active {
            self.dispatch_next();
        }
    }

    fn retire(&mut self, transaction: Arc<Transaction>) {
        let id = transaction.id().to_string();
        self.retiring.insert(id.clone(), transaction);
        self.after(self.settings.grace_period, Command::Destroy { id });
    }

    fn get(&self, id: &str) -> Option<Arc<Transaction>> {
        self.pending
            .get(id)
            .or_else(|| self.retiring.get(id))
            .cloned()
            .or_else(|| self.queue.iter().find(|t| t.id() == id).cloned())
    }

    fn snapshot(&self) -> QueueChange {
        QueueChange {
            active: self.active.clone(),
            queued: self.queue.iter().map(|t| t.id().to_string()).collect(),
        }
    }

    fn publish(&self) {
        let _ = self.changes.send(self.snapshot());
    }

    /// Hand the head to the worker if nothing is running
    fn dispatch_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(head) = self.queue.front().cloned() else {
            return;
        };
        let id = head.id().to_string();
        match self.dispatch.send(head) {
            Ok(()) => {
                debug!("Dispatched transaction {}", id);
                self.active = Some(id);
                self.publish();
            }
            Err(_) => warn!("Worker thread is gone, transaction {} stays queued", id),
        }
    }

    /// Deliver `command` to the actor after `delay`
    fn after(&self, delay: Duration, command: Command) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{ExitStatus, Role};

    fn settings() -> QueueSettings {
        QueueSettings {
            grace_period: Duration::from_millis(50),
            pending_timeout: Duration::from_secs(60),
        }
    }

    async fn authorized(handle: &QueueHandle, role: Role) -> Arc<Transaction> {
        let tx = Transaction::new(role, 1000);
        handle.add_pending(tx.clone()).await;
        tx.set_status(Status::Authentication).unwrap();
        tx.set_status(Status::Waiting).unwrap();
        tx
    }

    #[tokio::test]
    async fn test_fifo_admission_one_active() {
        let (handle, jobs) = TransactionQueue::spawn(settings());
        let mut changes = handle.subscribe();

        let a = authorized(&handle, Role::UpdateCache).await;
        let b = authorized(&handle, Role::CommitChanges).await;
        let c = authorized(&handle, Role::UpgradeSystem).await;
        handle.enqueue(a.id()).await.unwrap();
        handle.enqueue(b.id()).await.unwrap();
        handle.enqueue(c.id()).await.unwrap();

        // Only the head is dispatched
        let first = jobs.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.id(), a.id());
        assert!(jobs.try_recv().is_err());

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.active.as_deref(), Some(a.id()));
        assert_eq!(snapshot.queued, vec![a.id(), b.id(), c.id()]);

        first.finish(ExitStatus::Success);
        handle.completed(first.id());
        let second = tokio::task::spawn_blocking(move || jobs.recv_timeout(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id(), b.id());

        let mut saw_first = false;
        while let Ok(change) = changes.try_recv() {
            if change.active.as_deref() == Some(a.id()) {
                saw_first = true;
            }
        }
        assert!(saw_first);
        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.active.as_deref(), Some(b.id()));
        assert_eq!(snapshot.queued, vec![b.id(), c.id()]);
    }

    #[tokio::test]
    async fn test_enqueue_requires_pending() {
        let (handle, _jobs) = TransactionQueue::spawn(settings());
        assert!(matches!(
            handle.enqueue("no-such-id").await,
            Err(Error::NotFoundError(_))
        ));

        let tx = authorized(&handle, Role::UpdateCache).await;
        handle.enqueue(tx.id()).await.unwrap();
        assert!(handle.enqueue(tx.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_destroys_after_grace() {
        let (handle, jobs) = TransactionQueue::spawn(settings());
        let tx = authorized(&handle, Role::UpdateCache).await;
        handle.enqueue(tx.id()).await.unwrap();
        let running = jobs.recv_timeout(Duration::from_secs(1)).unwrap();

        running.finish(ExitStatus::Success);
        handle.completed(running.id());
        handle.remove(running.id()).await;

        // Still readable during the grace period
        assert!(handle.get(tx.id()).await.is_some());
        assert!(handle.is_idle().await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.get(tx.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_pending_timeout() {
        let (handle, _jobs) = TransactionQueue::spawn(QueueSettings {
            grace_period: Duration::from_secs(60),
            pending_timeout: Duration::from_millis(30),
        });
        let tx = Transaction::new(Role::CommitChanges, 1000);
        handle.add_pending(tx.clone()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(tx.is_finished());
        assert!(handle.enqueue(tx.id()).await.is_err());
    }
}
