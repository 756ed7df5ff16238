// src/client/mirror.rs

//! Client-side mirror of a remote transaction
//!
//! A [`TransactionMirror`] is a property cache fed with decoded property
//! changes. Each applied change that alters the cache yields typed
//! [`MirrorEvent`]s; re-applying a value already cached yields nothing, so
//! the snapshot the daemon sends at the start of a stream is harmless.
//!
//! [`MirrorSubscription`] attaches a mirror to the daemon: one full property
//! fetch, then the property stream. If the stream ends before the
//! transaction finished, the daemon went away and the subscription reports
//! [`MirrorEvent::WorkerDisappeared`] once.

use crate::client::DaemonClient;
use crate::client::http::EventStream;
use crate::progress::DownloadProgress;
use crate::transaction::{
    ConfigFileConflict, ExitStatus, MediumRequest, PackageMap, Property, PropertyChange,
    PropertyId, Role, Status, TransactionError,
};
use crate::Result;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Typed notification derived from a property change
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    StatusChanged(Status),
    StatusDetailsChanged(String),
    ErrorOccurred(TransactionError),
    ProgressChanged(u32),
    DownloadProgressChanged(DownloadProgress),
    /// Bytes per second
    DownloadSpeedChanged(u64),
    /// Seconds, 0 when unknown
    RemainingTimeChanged(u64),
    CancellableChanged(bool),
    Paused,
    Resumed,
    MediumRequired(MediumRequest),
    /// Packages that need approval before the transaction continues
    PromptUntrusted(Vec<String>),
    ConfigFileConflict(ConfigFileConflict),
    Finished(ExitStatus),
    /// The daemon vanished before the transaction finished
    WorkerDisappeared,
}

/// Cached view of one transaction
#[derive(Debug, Clone)]
pub struct TransactionMirror {
    id: String,
    properties: BTreeMap<PropertyId, Property>,
}

impl TransactionMirror {
    /// Empty mirror
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Mirror seeded from a full property fetch, without events
    pub fn from_properties(id: impl Into<String>, properties: Vec<Property>) -> Self {
        let mut mirror = Self::new(id);
        for property in properties {
            mirror.properties.insert(property.id(), property);
        }
        mirror
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, id: PropertyId) -> Option<&Property> {
        self.properties.get(&id)
    }

    pub fn role(&self) -> Role {
        match self.get(PropertyId::Role) {
            Some(Property::Role(role)) => *role,
            _ => Role::Empty,
        }
    }

    pub fn status(&self) -> Status {
        match self.get(PropertyId::Status) {
            Some(Property::Status(status)) => *status,
            _ => Status::Setup,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self.get(PropertyId::ExitStatus) {
            Some(Property::ExitStatus(exit)) => *exit,
            _ => ExitStatus::Unfinished,
        }
    }

    pub fn error(&self) -> Option<&TransactionError> {
        match self.get(PropertyId::Error) {
            Some(Property::Error(error)) => error.as_ref(),
            _ => None,
        }
    }

    pub fn error_log(&self) -> &[String] {
        match self.get(PropertyId::ErrorLog) {
            Some(Property::ErrorLog(lines)) => lines,
            _ => &[],
        }
    }

    pub fn progress(&self) -> u32 {
        match self.get(PropertyId::Progress) {
            Some(Property::Progress(p)) => *p,
            _ => 0,
        }
    }

    pub fn packages(&self) -> PackageMap {
        match self.get(PropertyId::Packages) {
            Some(Property::Packages(map)) => map.clone(),
            _ => PackageMap::new(),
        }
    }

    pub fn status_details(&self) -> &str {
        match self.get(PropertyId::StatusDetails) {
            Some(Property::StatusDetails(details)) => details,
            _ => "",
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.get(PropertyId::Cancellable), Some(Property::Cancellable(true)))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.get(PropertyId::Paused), Some(Property::Paused(true)))
    }

    /// Finished with a known outcome
    ///
    /// Status and exit status arrive as separate changes in either order;
    /// both must be in before the transaction counts as finished.
    pub fn is_finished(&self) -> bool {
        self.status() == Status::Finished && self.exit_status().is_terminal()
    }

    pub fn unauthenticated(&self) -> &[String] {
        match self.get(PropertyId::Unauthenticated) {
            Some(Property::Unauthenticated(packages)) => packages,
            _ => &[],
        }
    }

    pub fn required_medium(&self) -> Option<&MediumRequest> {
        match self.get(PropertyId::RequiredMedium) {
            Some(Property::RequiredMedium(request)) => request.as_ref(),
            _ => None,
        }
    }

    pub fn config_file_conflict(&self) -> Option<&ConfigFileConflict> {
        match self.get(PropertyId::ConfigFileConflict) {
            Some(Property::ConfigFileConflict(conflict)) => conflict.as_ref(),
            _ => None,
        }
    }

    /// Apply one change and return the events it causes
    pub fn apply(&mut self, property: Property) -> Vec<MirrorEvent> {
        if self.properties.get(&property.id()) == Some(&property) {
            return Vec::new();
        }
        let was_paused = self.is_paused();
        let was_finished = self.is_finished();
        self.properties.insert(property.id(), property.clone());

        let mut events = Vec::new();
        match property {
            Property::Status(status) => events.push(MirrorEvent::StatusChanged(status)),
            Property::StatusDetails(details) => {
                events.push(MirrorEvent::StatusDetailsChanged(details));
            }
            Property::Error(Some(error)) => events.push(MirrorEvent::ErrorOccurred(error)),
            Property::Progress(p) => events.push(MirrorEvent::ProgressChanged(p)),
            Property::DownloadProgress(dp) => {
                events.push(MirrorEvent::DownloadProgressChanged(dp));
            }
            Property::DownloadSpeed(speed) => events.push(MirrorEvent::DownloadSpeedChanged(speed)),
            Property::RemainingTime(eta) => events.push(MirrorEvent::RemainingTimeChanged(eta)),
            Property::Cancellable(b) => events.push(MirrorEvent::CancellableChanged(b)),
            Property::Paused(true) if !was_paused => {
                events.push(MirrorEvent::Paused);
                // Medium and conffile prompts announce themselves first
                let other_prompt =
                    self.required_medium().is_some() || self.config_file_conflict().is_some();
                if !other_prompt && !self.unauthenticated().is_empty() {
                    events.push(MirrorEvent::PromptUntrusted(self.unauthenticated().to_vec()));
                }
            }
            Property::Paused(false) if was_paused => events.push(MirrorEvent::Resumed),
            Property::RequiredMedium(Some(request)) => {
                events.push(MirrorEvent::MediumRequired(request));
            }
            Property::ConfigFileConflict(Some(conflict)) => {
                events.push(MirrorEvent::ConfigFileConflict(conflict));
            }
            _ => {}
        }
        if !was_finished && self.is_finished() {
            events.push(MirrorEvent::Finished(self.exit_status()));
        }
        events
    }

    /// Apply a wire change; undecodable changes are logged and skipped
    pub fn apply_change(&mut self, change: &PropertyChange) -> Vec<MirrorEvent> {
        match change.decode() {
            Ok(property) => self.apply(property),
            Err(e) => {
                warn!("Transaction {}: ignoring bad property change: {}", self.id, e);
                Vec::new()
            }
        }
    }
}

/// A mirror attached to the daemon
///
/// Iterating yields events until the transaction finishes or the daemon
/// disappears.
pub struct MirrorSubscription {
    client: DaemonClient,
    mirror: TransactionMirror,
    stream: Option<EventStream>,
    pending: VecDeque<MirrorEvent>,
}

impl MirrorSubscription {
    /// Fetch every property, then follow the property stream
    pub fn attach(client: DaemonClient, id: &str) -> Result<Self> {
        let stream = client.property_stream(id)?;
        let properties = client.properties(id)?;
        let mirror = TransactionMirror::from_properties(id, properties);
        debug!("Attached to transaction {} ({:?})", id, mirror.status());
        Ok(Self {
            client,
            mirror,
            stream: Some(stream),
            pending: VecDeque::new(),
        })
    }

    pub fn mirror(&self) -> &TransactionMirror {
        &self.mirror
    }

    pub fn client(&self) -> &DaemonClient {
        &self.client
    }

    /// Re-fetch every property after the stream dropped events
    fn resync(&mut self) {
        match self.client.properties(self.mirror.id()) {
            Ok(properties) => {
                for property in properties {
                    let events = self.mirror.apply(property);
                    self.pending.extend(events);
                }
            }
            Err(e) => warn!("Failed to resync transaction {}: {}", self.mirror.id(), e),
        }
    }

    fn disappeared(&mut self) -> Option<MirrorEvent> {
        self.stream = None;
        if self.mirror.is_finished() {
            None
        } else {
            Some(MirrorEvent::WorkerDisappeared)
        }
    }
}

impl Iterator for MirrorSubscription {
    type Item = MirrorEvent;

    fn next(&mut self) -> Option<MirrorEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.mirror.is_finished() {
                self.stream = None;
                return None;
            }

            let next = self.stream.as_mut()?.next();
            match next {
                Some(Ok(event)) if event.event == "property" => {
                    match serde_json::from_str::<PropertyChange>(&event.data) {
                        Ok(change) => {
                            let events = self.mirror.apply_change(&change);
                            self.pending.extend(events);
                        }
                        Err(e) => warn!("Ignoring malformed property event: {}", e),
                    }
                }
                Some(Ok(event)) if event.event == "warning" => {
                    debug!("Property stream lagged: {}", event.data);
                    self.resync();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Property stream failed: {}", e);
                    return self.disappeared();
                }
                None => return self.disappeared(),
            }
        }
    }
}
