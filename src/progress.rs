// src/progress.rs

//! Progress value types and terminal rendering
//!
//! [`DownloadProgress`] is the per-item fetch snapshot carried on a
//! transaction. It is immutable: every update replaces the whole value.
//!
//! [`TransactionProgressBar`] renders a mirrored transaction on a terminal
//! for the `watch` command.

use crate::error::{Error, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// State of a single fetch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DownloadStatus {
    #[default]
    Idle,
    Fetching,
    Done,
    Error,
    AuthError,
    NetworkError,
}

impl DownloadStatus {
    pub fn code(self) -> u8 {
        match self {
            DownloadStatus::Idle => 0,
            DownloadStatus::Fetching => 1,
            DownloadStatus::Done => 2,
            DownloadStatus::Error => 3,
            DownloadStatus::AuthError => 4,
            DownloadStatus::NetworkError => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(DownloadStatus::Idle),
            1 => Ok(DownloadStatus::Fetching),
            2 => Ok(DownloadStatus::Done),
            3 => Ok(DownloadStatus::Error),
            4 => Ok(DownloadStatus::AuthError),
            5 => Ok(DownloadStatus::NetworkError),
            other => Err(Error::ParseError(format!(
                "invalid DownloadStatus value: {}",
                other
            ))),
        }
    }

    /// Whether the item reached a final state
    pub fn is_final(self) -> bool {
        !matches!(self, DownloadStatus::Idle | DownloadStatus::Fetching)
    }
}

impl From<DownloadStatus> for u8 {
    fn from(value: DownloadStatus) -> u8 {
        value.code()
    }
}

impl TryFrom<u8> for DownloadStatus {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        DownloadStatus::from_code(code)
    }
}

/// Snapshot of a single fetch item
///
/// On the wire this is a positional array
/// `[uri, status, short_desc, total_size, fetched_size, message]`, so
/// clients decode it explicitly rather than relying on field names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    /// Source locator
    pub uri: String,
    /// Item state
    pub status: DownloadStatus,
    /// Short description (usually the package or index name)
    pub short_desc: String,
    /// Total size in bytes, 0 if unknown
    pub total_size: u64,
    /// Bytes fetched so far
    pub fetched_size: u64,
    /// Status message (error text for failed items)
    pub message: String,
}

impl DownloadProgress {
    pub fn new(uri: impl Into<String>, status: DownloadStatus) -> Self {
        Self {
            uri: uri.into(),
            status,
            ..Default::default()
        }
    }

    pub fn with_short_desc(mut self, desc: impl Into<String>) -> Self {
        self.short_desc = desc.into();
        self
    }

    pub fn with_sizes(mut self, total_size: u64, fetched_size: u64) -> Self {
        self.total_size = total_size;
        self.fetched_size = fetched_size;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Encode as the positional wire array
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!([
            self.uri,
            self.status.code(),
            self.short_desc,
            self.total_size,
            self.fetched_size,
            self.message,
        ])
    }

    /// Decode the positional wire array
    pub fn from_wire(value: &serde_json::Value) -> Result<Self> {
        let fields = value
            .as_array()
            .filter(|a| a.len() == 6)
            .ok_or_else(|| Error::ParseError("download progress must be a 6-element array".into()))?;

        let text = |idx: usize| -> Result<String> {
            fields[idx]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::ParseError(format!("download progress field {} is not a string", idx)))
        };
        let number = |idx: usize| -> Result<u64> {
            fields[idx]
                .as_u64()
                .ok_or_else(|| Error::ParseError(format!("download progress field {} is not a number", idx)))
        };

        let status = u8::try_from(number(1)?)
            .map_err(|_| Error::ParseError("download status out of range".into()))
            .and_then(DownloadStatus::from_code)?;

        Ok(Self {
            uri: text(0)?,
            status,
            short_desc: text(2)?,
            total_size: number(3)?,
            fetched_size: number(4)?,
            message: text(5)?,
        })
    }
}

/// Terminal progress bar driven by transaction events
pub struct TransactionProgressBar {
    bar: ProgressBar,
}

impl TransactionProgressBar {
    /// Create a bar labelled with the transaction role
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos:>3}% {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Update the percentage; the regression sentinel (> 100) is ignored
    pub fn set_progress(&self, percent: u32) {
        if percent <= 100 {
            self.bar.set_position(u64::from(percent));
        }
    }

    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Print a line above the bar without disturbing it
    pub fn println(&self, line: &str) {
        self.bar.println(line);
    }

    /// Hide the bar while `f` talks to the terminal
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.bar.suspend(f)
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }
}
