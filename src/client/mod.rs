// src/client/mod.rs

//! Client side of the pkgworker socket API
//!
//! [`DaemonClient`] issues blocking requests over the daemon's Unix socket.
//! [`mirror::MirrorSubscription`] builds on it to follow one transaction.
//!
//! # Example
//!
//! ```ignore
//! use pkgworker::client::DaemonClient;
//! use pkgworker::transaction::{PackageAction, Role, TransactionRequest};
//!
//! let client = DaemonClient::connect()?;
//! let mut packages = std::collections::BTreeMap::new();
//! packages.insert("nginx".to_string(), PackageAction::Install);
//! let tx = client.create(&TransactionRequest::new(Role::CommitChanges).with_packages(packages))?;
//!
//! let subscription = client.subscribe(&tx.id)?;
//! client.run(&tx.id)?;
//! for event in subscription {
//!     println!("{:?}", event);
//! }
//! ```

pub mod http;
pub mod mirror;

pub use mirror::{MirrorEvent, MirrorSubscription, TransactionMirror};

use crate::daemon::routes::{
    ConfigFileReply, HealthResponse, MediumReply, TransactionSummary, UntrustedReply,
};
use crate::daemon::{DaemonConfig, DaemonError};
use crate::transaction::{Property, PropertyChange, QueueChange, TransactionRequest};
use crate::{Error, Result};
use http::{EventStream, HttpResponse};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Blocking client for the pkgworker daemon
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    /// Read/write timeout for ordinary requests
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Client for the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(DaemonConfig::default().socket_path)
    }

    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the request timeout
    ///
    /// `run` may wait on interactive authentication, so keep this generous.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to the default socket, failing if the daemon does not answer
    pub fn connect() -> Result<Self> {
        let client = Self::new();
        client.health()?;
        Ok(client)
    }

    pub fn connect_to<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let client = Self::with_socket_path(socket_path);
        client.health()?;
        Ok(client)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn health(&self) -> Result<HealthResponse> {
        let response = self.request("GET", "/health", None)?;
        parse_response(response)
    }

    /// Create a transaction owned by the calling user
    pub fn create(&self, request: &TransactionRequest) -> Result<TransactionSummary> {
        let body = serde_json::to_string(request)?;
        let response = self.request("POST", "/v1/transactions", Some(&body))?;
        parse_response(response)
    }

    /// Every property of a transaction
    pub fn properties(&self, id: &str) -> Result<Vec<Property>> {
        let response = self.request("GET", &format!("/v1/transactions/{}", id), None)?;
        let changes: Vec<PropertyChange> = parse_response(response)?;
        changes.iter().map(PropertyChange::decode).collect()
    }

    /// Recent terminal output of the package manager
    pub fn terminal_output(&self, id: &str) -> Result<Vec<String>> {
        let response = self.request("GET", &format!("/v1/transactions/{}/output", id), None)?;
        parse_response(response)
    }

    /// Set a session property while the transaction is in `Setup`
    pub fn set_property(&self, id: &str, property: &Property) -> Result<()> {
        let body = serde_json::to_string(&PropertyChange::from(property))?;
        let response = self.request(
            "PUT",
            &format!("/v1/transactions/{}/properties", id),
            Some(&body),
        )?;
        expect_success(response)
    }

    /// Authorize and queue the transaction
    pub fn run(&self, id: &str) -> Result<TransactionSummary> {
        let response = self.request("POST", &format!("/v1/transactions/{}/run", id), None)?;
        parse_response(response)
    }

    pub fn cancel(&self, id: &str) -> Result<TransactionSummary> {
        let response = self.request("POST", &format!("/v1/transactions/{}/cancel", id), None)?;
        parse_response(response)
    }

    pub fn provide_medium(&self, id: &str, mount_point: &str) -> Result<()> {
        let body = serde_json::to_string(&MediumReply {
            mount_point: mount_point.to_string(),
        })?;
        let response = self.request(
            "POST",
            &format!("/v1/transactions/{}/medium", id),
            Some(&body),
        )?;
        expect_success(response)
    }

    pub fn reply_untrusted(&self, id: &str, approved: bool) -> Result<()> {
        let body = serde_json::to_string(&UntrustedReply { approved })?;
        let response = self.request(
            "POST",
            &format!("/v1/transactions/{}/untrusted", id),
            Some(&body),
        )?;
        expect_success(response)
    }

    /// Answer a configuration file conflict; `replace` takes the new file
    pub fn resolve_conffile(&self, id: &str, path: &str, replace: bool) -> Result<()> {
        let body = serde_json::to_string(&ConfigFileReply {
            path: path.to_string(),
            replace,
        })?;
        let response = self.request(
            "POST",
            &format!("/v1/transactions/{}/conffile", id),
            Some(&body),
        )?;
        expect_success(response)
    }

    /// Active and queued transaction ids
    pub fn queue(&self) -> Result<QueueChange> {
        let response = self.request("GET", "/v1/queue", None)?;
        parse_response(response)
    }

    /// Raw property change stream of a transaction
    pub fn property_stream(&self, id: &str) -> Result<EventStream> {
        self.open_stream(&format!("/v1/transactions/{}/stream", id))
    }

    /// Queue change stream
    pub fn queue_stream(&self) -> Result<EventStream> {
        self.open_stream("/v1/queue/stream")
    }

    /// Attach a mirror to a transaction
    pub fn subscribe(&self, id: &str) -> Result<MirrorSubscription> {
        MirrorSubscription::attach(self.clone(), id)
    }

    fn open_stream(&self, path: &str) -> Result<EventStream> {
        let (head, body) = http::send(&self.socket_path, None, "GET", path, None)?;
        if !head.is_success() {
            let mut text = String::new();
            let mut body = body;
            std::io::Read::read_to_string(&mut body, &mut text)?;
            return Err(error_from_response(head.status_code, &text));
        }
        Ok(EventStream::new(body))
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<HttpResponse> {
        http::request(&self.socket_path, self.timeout, method, path, body)
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(response: HttpResponse) -> Result<T> {
    if response.head.is_success() {
        serde_json::from_str(&response.body)
            .map_err(|e| Error::ParseError(format!("Failed to parse response: {}", e)))
    } else {
        Err(error_from_response(response.head.status_code, &response.body))
    }
}

fn expect_success(response: HttpResponse) -> Result<()> {
    if response.head.is_success() {
        Ok(())
    } else {
        Err(error_from_response(response.head.status_code, &response.body))
    }
}

/// Map a problem+json response back onto the crate error
pub fn error_from_response(status_code: u16, body: &str) -> Error {
    let Ok(problem) = serde_json::from_str::<DaemonError>(body) else {
        return Error::DaemonError(format!(
            "Request failed with status {}: {}",
            status_code, body
        ));
    };

    let kind = problem
        .error_type
        .rsplit(':')
        .next()
        .unwrap_or_default();
    match kind {
        "access_denied" => Error::AccessDenied(problem.detail),
        "not_authorized" => Error::AuthError(problem.detail),
        "not_found" => Error::NotFoundError(problem.detail),
        "conflict" => Error::InvalidState(problem.detail),
        "bad_request" => Error::ParseError(problem.detail),
        _ => Error::DaemonError(format!("{} ({}): {}", problem.title, problem.status, problem.detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = DaemonClient::new();
        assert_eq!(
            client.socket_path(),
            Path::new("/run/pkgworker/pkgworker.sock")
        );

        let client = DaemonClient::with_socket_path("/tmp/test.sock").with_timeout(Duration::from_secs(60));
        assert_eq!(client.socket_path(), Path::new("/tmp/test.sock"));
        assert_eq!(client.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_connect_to_missing_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = DaemonClient::connect_to(dir.path().join("none.sock")).unwrap_err();
        assert!(matches!(err, Error::DaemonError(_)));
    }

    #[test]
    fn test_error_from_problem_json() {
        let body = serde_json::to_string(&DaemonError::access_denied("not yours")).unwrap();
        assert!(matches!(
            error_from_response(403, &body),
            Error::AccessDenied(msg) if msg == "not yours"
        ));

        let body = serde_json::to_string(&DaemonError::conflict("already running")).unwrap();
        assert!(matches!(error_from_response(409, &body), Error::InvalidState(_)));

        let body = serde_json::to_string(&DaemonError::internal("boom")).unwrap();
        assert!(matches!(error_from_response(500, &body), Error::DaemonError(_)));
    }

    #[test]
    fn test_error_from_plain_body() {
        match error_from_response(502, "bad gateway") {
            Error::DaemonError(msg) => assert!(msg.contains("502")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
