// src/daemon/systemd.rs

//! Systemd integration for pkgworker
//!
//! Provides:
//! - Socket activation support (LISTEN_FDS)
//! - Notification protocol (sd_notify): readiness, status, stopping
//! - Watchdog pings
//! - Idle timeout, so a socket-activated daemon exits when nothing is
//!   running, queued or connected
//!
//! Without the `daemon` feature every notification is a no-op.

use crate::transaction::QueueChange;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// First descriptor passed by systemd
const LISTEN_FDS_START: RawFd = 3;

/// Loop cadence when neither the watchdog nor the idle timer is sooner
const DEFAULT_TICK: Duration = Duration::from_secs(10);

/// Systemd notification state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyState<'a> {
    Ready,
    Stopping,
    /// Human-readable status line (`systemctl status`)
    Status(&'a str),
    Watchdog,
}

impl NotifyState<'_> {
    /// Wire form of the assignment
    pub fn as_assignment(&self) -> String {
        match self {
            NotifyState::Ready => "READY=1".to_string(),
            NotifyState::Stopping => "STOPPING=1".to_string(),
            NotifyState::Status(s) => format!("STATUS={}", s),
            NotifyState::Watchdog => "WATCHDOG=1".to_string(),
        }
    }
}

/// Send notification to systemd
///
/// Returns true if notification was sent (systemd is managing the service).
pub fn notify(states: &[NotifyState<'_>]) -> bool {
    #[cfg(feature = "daemon")]
    {
        let sd_states: Vec<sd_notify::NotifyState> = states
            .iter()
            .map(|s| match s {
                NotifyState::Ready => sd_notify::NotifyState::Ready,
                NotifyState::Stopping => sd_notify::NotifyState::Stopping,
                NotifyState::Status(msg) => sd_notify::NotifyState::Status(msg),
                NotifyState::Watchdog => sd_notify::NotifyState::Watchdog,
            })
            .collect();

        !sd_states.is_empty() && sd_notify::notify(false, &sd_states).is_ok()
    }

    #[cfg(not(feature = "daemon"))]
    {
        log::trace!(
            "systemd support not built in, dropping {:?}",
            states.iter().map(NotifyState::as_assignment).collect::<Vec<_>>()
        );
        false
    }
}

/// Descriptors passed by systemd for this process
///
/// Empty unless `LISTEN_PID` names this process.
pub fn listen_fds() -> Vec<RawFd> {
    let for_us = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());
    if !for_us {
        return Vec::new();
    }

    let count: RawFd = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (LISTEN_FDS_START..LISTEN_FDS_START + count).collect()
}

/// Watchdog timeout configured in the unit, if any
pub fn watchdog_timeout() -> Option<Duration> {
    std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|usec| *usec > 0)
        .map(Duration::from_micros)
}

/// One-line queue description for `STATUS=`
pub fn describe_queue(queue: &QueueChange) -> String {
    match &queue.active {
        Some(active) => {
            let waiting = queue.queued.len().saturating_sub(1);
            format!("Running transaction {} ({} waiting)", active, waiting)
        }
        None => "Idle".to_string(),
    }
}

/// Sends watchdog pings at a fixed interval
pub struct WatchdogTask {
    interval: Duration,
    last_ping: Instant,
}

impl WatchdogTask {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping: Instant::now(),
        }
    }

    /// Ping at half the configured timeout; None without a watchdog
    pub fn from_env() -> Option<Self> {
        watchdog_timeout().map(|timeout| Self::new(timeout / 2))
    }

    /// Ping if due; returns true if a ping was sent
    pub fn tick(&mut self) -> bool {
        if self.last_ping.elapsed() >= self.interval {
            self.last_ping = Instant::now();
            notify(&[NotifyState::Watchdog])
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Tracks the last activity for the idle timeout
pub struct IdleTracker {
    timeout: Duration,
    last_activity: Instant,
}

impl IdleTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: Instant::now(),
        }
    }

    /// Reset the idle timer
    pub fn activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() >= self.timeout
    }

    pub fn time_until_timeout(&self) -> Duration {
        self.timeout.saturating_sub(self.last_activity.elapsed())
    }
}

/// Systemd service manager for the daemon
pub struct SystemdManager {
    watchdog: Option<WatchdogTask>,
    idle: Option<IdleTracker>,
    /// NOTIFY_SOCKET is set
    is_systemd: bool,
}

impl SystemdManager {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            watchdog: WatchdogTask::from_env(),
            idle: idle_timeout.map(IdleTracker::new),
            is_systemd: std::env::var_os("NOTIFY_SOCKET").is_some(),
        }
    }

    pub fn is_systemd(&self) -> bool {
        self.is_systemd
    }

    pub fn notify_ready(&self, status: Option<&str>) {
        if !self.is_systemd {
            return;
        }
        match status {
            Some(msg) => notify(&[NotifyState::Ready, NotifyState::Status(msg)]),
            None => notify(&[NotifyState::Ready]),
        };
    }

    pub fn notify_stopping(&self) {
        if self.is_systemd {
            notify(&[NotifyState::Stopping]);
        }
    }

    pub fn notify_status(&self, message: &str) {
        if self.is_systemd {
            notify(&[NotifyState::Status(message)]);
        }
    }

    /// Send a watchdog ping if due
    pub fn watchdog_tick(&mut self) {
        if let Some(ref mut wd) = self.watchdog {
            wd.tick();
        }
    }

    /// Record activity for idle tracking
    pub fn activity(&mut self) {
        if let Some(ref mut idle) = self.idle {
            idle.activity();
        }
    }

    /// False when no idle timeout is configured
    pub fn is_idle_expired(&self) -> bool {
        self.idle.as_ref().is_some_and(IdleTracker::is_expired)
    }

    /// Longest the accept loop may block before the next housekeeping pass
    pub fn tick_interval(&self) -> Duration {
        let mut tick = DEFAULT_TICK;
        if let Some(wd) = &self.watchdog {
            tick = tick.min(wd.interval());
        }
        if let Some(idle) = &self.idle {
            // Never a zero timeout, the loop would spin
            tick = tick.min(idle.time_until_timeout().max(Duration::from_millis(100)));
        }
        tick
    }
}
