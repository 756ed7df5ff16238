// src/worker/acquire.rs

//! Acquire translator
//!
//! Fetch engines report through the [`AcquireProgress`] callbacks. The
//! [`TransactionAcquireProgress`] implementation turns those callbacks into
//! transaction property updates: per-item [`DownloadProgress`] snapshots,
//! overall percentage within a configured slice, speed and remaining time.

use crate::progress::{DownloadProgress, DownloadStatus};
use crate::transaction::{PROGRESS_UNKNOWN, Status, Transaction};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Remaining-time estimates above this are reported as unknown (0)
const MAX_ETA_SECS: u64 = 2 * 24 * 60 * 60;

/// One item handled by the fetch engine
#[derive(Debug, Clone, Default)]
pub struct AcquireItem {
    pub uri: String,
    pub short_desc: String,
    pub destination: PathBuf,
    /// Expected size in bytes, 0 if unknown
    pub total_size: u64,
    pub fetched_size: u64,
    /// Final state reported by the engine
    pub status: DownloadStatus,
    /// Error text for failed items
    pub error: String,
}

impl AcquireItem {
    pub fn new(uri: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_short_desc(mut self, desc: impl Into<String>) -> Self {
        self.short_desc = desc.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.total_size = size;
        self
    }

    fn snapshot(&self, status: DownloadStatus) -> DownloadProgress {
        DownloadProgress::new(&self.uri, status)
            .with_short_desc(&self.short_desc)
            .with_sizes(self.total_size, self.fetched_size)
            .with_message(&self.error)
    }
}

/// Aggregate counters handed to every pulse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireStats {
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub current_items: u64,
    pub total_items: u64,
    /// Current speed in bytes per second
    pub current_cps: u64,
}

impl AcquireStats {
    /// Overall completion in percent, by bytes and items together
    pub fn percent(&self) -> f64 {
        let total = self.total_bytes + self.total_items;
        if total == 0 {
            return 0.0;
        }
        ((self.current_bytes + self.current_items) as f64 * 100.0 / total as f64).min(100.0)
    }

    /// Seconds left at the current speed, 0 when unknown
    pub fn eta(&self) -> u64 {
        if self.current_cps == 0 {
            return 0;
        }
        let eta = self.total_bytes.saturating_sub(self.current_bytes) / self.current_cps;
        if eta > MAX_ETA_SECS { 0 } else { eta }
    }
}

/// Callbacks a fetch engine drives
pub trait AcquireProgress {
    /// The fetch run begins
    fn start(&mut self);
    /// Item was already up to date
    fn ims_hit(&mut self, item: &AcquireItem);
    /// Item started downloading
    fn fetch(&mut self, item: &AcquireItem);
    /// Item finished
    fn done(&mut self, item: &AcquireItem);
    /// Item failed; the run continues
    fn fail(&mut self, item: &AcquireItem);
    /// Periodic update; returning false aborts the run
    fn pulse(&mut self, stats: &AcquireStats) -> bool;
    /// A removable medium is needed; returning false aborts the run
    fn media_change(&mut self, label: &str, mount_point: &str) -> bool;
    /// The fetch run ended
    fn stop(&mut self);
}

/// Maps fetch callbacks onto a transaction
pub struct TransactionAcquireProgress<'a> {
    transaction: &'a Transaction,
    begin: u32,
    end: u32,
    last_progress: u32,
    failed_items: usize,
}

impl<'a> TransactionAcquireProgress<'a> {
    /// Report into `[begin, end)` of the transaction's progress
    pub fn new(transaction: &'a Transaction, begin: u32, end: u32) -> Self {
        Self {
            transaction,
            begin,
            end: end.max(begin),
            last_progress: begin,
            failed_items: 0,
        }
    }

    /// Items that failed during this run
    pub fn failed_items(&self) -> usize {
        self.failed_items
    }

    fn scaled(&self, percent: f64) -> u32 {
        self.begin + (percent / 100.0 * f64::from(self.end - self.begin)) as u32
    }
}

impl AcquireProgress for TransactionAcquireProgress<'_> {
    fn start(&mut self) {
        if let Err(e) = self.transaction.set_status(Status::Downloading) {
            warn!("Cannot enter download state: {}", e);
        }
        self.transaction.set_cancellable(true);
        self.transaction.set_progress(self.begin);
    }

    fn ims_hit(&mut self, item: &AcquireItem) {
        debug!("Hit {}", item.uri);
        self.transaction
            .set_download_progress(item.snapshot(DownloadStatus::Done).with_message("Hit"));
    }

    fn fetch(&mut self, item: &AcquireItem) {
        debug!("Get {}", item.uri);
        self.transaction
            .set_download_progress(item.snapshot(DownloadStatus::Fetching));
        self.transaction.set_status_details(format!("Downloading {}", item.short_desc));
    }

    fn done(&mut self, item: &AcquireItem) {
        self.transaction
            .set_download_progress(item.snapshot(DownloadStatus::Done));
    }

    fn fail(&mut self, item: &AcquireItem) {
        self.failed_items += 1;
        let status = if item.status.is_final() && item.status != DownloadStatus::Done {
            item.status
        } else {
            DownloadStatus::Error
        };
        warn!("Failed to fetch {}: {}", item.uri, item.error);
        self.transaction
            .append_error_detail(format!("Failed to fetch {} {}", item.uri, item.error));
        self.transaction.set_download_progress(item.snapshot(status));
    }

    fn pulse(&mut self, stats: &AcquireStats) -> bool {
        let progress = self.scaled(stats.percent());
        if progress < self.last_progress {
            // Totals grew mid-run; report indeterminate rather than regress
            self.transaction.set_progress(PROGRESS_UNKNOWN);
        } else {
            self.transaction.set_progress(progress);
            self.last_progress = progress;
        }
        self.transaction.set_download_speed(stats.current_cps);
        self.transaction.set_remaining_time(stats.eta());
        !self.transaction.is_cancelled()
    }

    fn media_change(&mut self, label: &str, mount_point: &str) -> bool {
        info!("Medium '{}' required at {}", label, mount_point);
        let resumed = self.transaction.request_medium(label, mount_point);
        if !resumed && !self.transaction.is_cancelled() {
            self.transaction.append_error_detail(format!(
                "Medium '{}' is required in {}",
                label, mount_point
            ));
        }
        resumed
    }

    fn stop(&mut self) {
        self.transaction.set_download_speed(0);
        self.transaction.set_remaining_time(0);
        if !self.transaction.is_cancelled() {
            self.transaction.set_progress(self.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Capabilities, Property, Role, TransactionRequest};

    fn downloading(request: TransactionRequest) -> std::sync::Arc<Transaction> {
        let tx = Transaction::from_request(request, 1000);
        for status in [Status::Authentication, Status::Waiting, Status::WaitingLock, Status::LoadingCache] {
            tx.set_status(status).unwrap();
        }
        tx
    }

    #[test]
    fn test_percent_and_eta() {
        let stats = AcquireStats {
            current_bytes: 48,
            total_bytes: 98,
            current_items: 2,
            total_items: 2,
            current_cps: 10,
        };
        assert_eq!(stats.percent(), 50.0);
        assert_eq!(stats.eta(), 5);

        let slow = AcquireStats {
            total_bytes: 10_000_000_000,
            current_cps: 1,
            ..Default::default()
        };
        assert_eq!(slow.eta(), 0);
        assert_eq!(AcquireStats::default().percent(), 0.0);
    }

    #[test]
    fn test_progress_maps_into_slice() {
        let tx = downloading(TransactionRequest::new(Role::CommitChanges));
        let mut progress = TransactionAcquireProgress::new(&tx, 10, 50);
        progress.start();
        assert_eq!(tx.status(), Status::Downloading);

        let stats = AcquireStats {
            current_bytes: 50,
            total_bytes: 100,
            ..Default::default()
        };
        assert!(progress.pulse(&stats));
        assert_eq!(tx.progress(), 30);

        progress.stop();
        assert_eq!(tx.progress(), 50);
    }

    #[test]
    fn test_regression_emits_sentinel() {
        let tx = downloading(TransactionRequest::new(Role::UpdateCache));
        let mut progress = TransactionAcquireProgress::new(&tx, 0, 100);
        progress.start();
        progress.pulse(&AcquireStats {
            current_bytes: 60,
            total_bytes: 100,
            ..Default::default()
        });
        assert_eq!(tx.progress(), 60);

        // A newly discovered item grows the totals
        progress.pulse(&AcquireStats {
            current_bytes: 60,
            total_bytes: 200,
            ..Default::default()
        });
        assert_eq!(tx.progress(), PROGRESS_UNKNOWN);
    }

    #[test]
    fn test_failures_accumulate() {
        let tx = downloading(TransactionRequest::new(Role::UpdateCache));
        let mut rx = tx.subscribe();
        let mut progress = TransactionAcquireProgress::new(&tx, 0, 100);
        progress.start();

        let mut item = AcquireItem::new("http://mirror/a", "/tmp/a").with_short_desc("a");
        item.status = DownloadStatus::NetworkError;
        item.error = "connection refused".into();
        progress.fail(&item);
        progress.fail(&AcquireItem::new("http://mirror/b", "/tmp/b"));

        assert_eq!(progress.failed_items(), 2);
        assert_eq!(tx.error_log().len(), 2);
        assert!(tx.error_log()[0].contains("connection refused"));

        let mut first_download = None;
        while let Ok(change) = rx.try_recv() {
            if let Property::DownloadProgress(dp) = change.decode().unwrap() {
                first_download.get_or_insert(dp);
            }
        }
        assert_eq!(first_download.unwrap().status, DownloadStatus::NetworkError);
        assert!(tx.error().is_none());
    }

    #[test]
    fn test_pulse_aborts_after_cancel() {
        let tx = downloading(TransactionRequest::new(Role::UpdateCache));
        let mut progress = TransactionAcquireProgress::new(&tx, 0, 100);
        progress.start();
        tx.cancel(1000).unwrap();
        assert!(!progress.pulse(&AcquireStats::default()));
    }

    #[test]
    fn test_media_change_without_capability_fails() {
        let tx = downloading(TransactionRequest::new(Role::CommitChanges));
        let mut progress = TransactionAcquireProgress::new(&tx, 0, 100);
        progress.start();
        assert!(!progress.media_change("Disc 1", "/media/cdrom"));
        assert_eq!(tx.status(), Status::Downloading);
        assert_eq!(tx.error_log().len(), 1);
    }

    #[test]
    fn test_media_change_with_capability() {
        let tx = downloading(
            TransactionRequest::new(Role::CommitChanges).with_capabilities(Capabilities::MEDIUM),
        );
        let worker = {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let mut progress = TransactionAcquireProgress::new(&tx, 0, 100);
                progress.start();
                progress.media_change("Disc 1", "/media/cdrom")
            })
        };
        while tx.status() != Status::WaitingMedium {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        tx.provide_medium(1000, "/media/cdrom").unwrap();
        assert!(worker.join().unwrap());
        assert_eq!(tx.status(), Status::Downloading);
    }
}
