// src/transaction/property.rs

//! Transaction properties and their wire form
//!
//! A property change is published as `(PropertyId, value)`. The transport
//! (JSON over the daemon socket) does not preserve rich types, so enums go
//! out as integers and structured values as positional arrays. Decoding is
//! done per property in [`Property::from_wire`], with no catch-all arm.

use crate::error::{Error, Result};
use crate::progress::DownloadProgress;
use crate::transaction::enums::{
    Capabilities, ErrorCode, ExitStatus, PackageAction, Role, Status,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Package-instruction map: full name (or `name,version`) to action
pub type PackageMap = BTreeMap<String, PackageAction>;

/// Error recorded on a failed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionError {
    pub code: ErrorCode,
    pub details: String,
}

impl TransactionError {
    pub fn new(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.details)
        }
    }
}

/// Outstanding removable-medium request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumRequest {
    pub label: String,
    pub mount_point: String,
}

/// Outstanding configuration file conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFileConflict {
    pub old_path: String,
    pub new_path: String,
}

/// Property identifiers, transmitted as integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PropertyId {
    Id,
    Owner,
    CreatedAt,
    Role,
    Status,
    ExitStatus,
    Error,
    ErrorLog,
    Locale,
    Proxy,
    DebconfSocket,
    Packages,
    PackageFile,
    AllowUnauthenticated,
    Capabilities,
    Cancellable,
    Cancelled,
    Paused,
    StatusDetails,
    Progress,
    DownloadProgress,
    Unauthenticated,
    DownloadSpeed,
    RemainingTime,
    RequiredMedium,
    ConfigFileConflict,
}

impl PropertyId {
    /// All identifiers in wire order
    pub const ALL: [PropertyId; 26] = [
        PropertyId::Id,
        PropertyId::Owner,
        PropertyId::CreatedAt,
        PropertyId::Role,
        PropertyId::Status,
        PropertyId::ExitStatus,
        PropertyId::Error,
        PropertyId::ErrorLog,
        PropertyId::Locale,
        PropertyId::Proxy,
        PropertyId::DebconfSocket,
        PropertyId::Packages,
        PropertyId::PackageFile,
        PropertyId::AllowUnauthenticated,
        PropertyId::Capabilities,
        PropertyId::Cancellable,
        PropertyId::Cancelled,
        PropertyId::Paused,
        PropertyId::StatusDetails,
        PropertyId::Progress,
        PropertyId::DownloadProgress,
        PropertyId::Unauthenticated,
        PropertyId::DownloadSpeed,
        PropertyId::RemainingTime,
        PropertyId::RequiredMedium,
        PropertyId::ConfigFileConflict,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or_else(|| Error::ParseError(format!("invalid property id: {}", code)))
    }

    /// Whether a client may set this property (only during setup)
    pub fn is_client_writable(self) -> bool {
        matches!(
            self,
            PropertyId::Locale
                | PropertyId::Proxy
                | PropertyId::DebconfSocket
                | PropertyId::Packages
                | PropertyId::PackageFile
                | PropertyId::AllowUnauthenticated
                | PropertyId::Capabilities
        )
    }
}

impl From<PropertyId> for u8 {
    fn from(id: PropertyId) -> u8 {
        id.code()
    }
}

impl TryFrom<u8> for PropertyId {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        PropertyId::from_code(code)
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Id(String),
    Owner(u32),
    CreatedAt(String),
    Role(Role),
    Status(Status),
    ExitStatus(ExitStatus),
    Error(Option<TransactionError>),
    ErrorLog(Vec<String>),
    Locale(String),
    Proxy(String),
    DebconfSocket(String),
    Packages(PackageMap),
    PackageFile(String),
    AllowUnauthenticated(bool),
    Capabilities(Capabilities),
    Cancellable(bool),
    Cancelled(bool),
    Paused(bool),
    StatusDetails(String),
    Progress(u32),
    DownloadProgress(DownloadProgress),
    Unauthenticated(Vec<String>),
    DownloadSpeed(u64),
    RemainingTime(u64),
    RequiredMedium(Option<MediumRequest>),
    ConfigFileConflict(Option<ConfigFileConflict>),
}

impl Property {
    pub fn id(&self) -> PropertyId {
        match self {
            Property::Id(_) => PropertyId::Id,
            Property::Owner(_) => PropertyId::Owner,
            Property::CreatedAt(_) => PropertyId::CreatedAt,
            Property::Role(_) => PropertyId::Role,
            Property::Status(_) => PropertyId::Status,
            Property::ExitStatus(_) => PropertyId::ExitStatus,
            Property::Error(_) => PropertyId::Error,
            Property::ErrorLog(_) => PropertyId::ErrorLog,
            Property::Locale(_) => PropertyId::Locale,
            Property::Proxy(_) => PropertyId::Proxy,
            Property::DebconfSocket(_) => PropertyId::DebconfSocket,
            Property::Packages(_) => PropertyId::Packages,
            Property::PackageFile(_) => PropertyId::PackageFile,
            Property::AllowUnauthenticated(_) => PropertyId::AllowUnauthenticated,
            Property::Capabilities(_) => PropertyId::Capabilities,
            Property::Cancellable(_) => PropertyId::Cancellable,
            Property::Cancelled(_) => PropertyId::Cancelled,
            Property::Paused(_) => PropertyId::Paused,
            Property::StatusDetails(_) => PropertyId::StatusDetails,
            Property::Progress(_) => PropertyId::Progress,
            Property::DownloadProgress(_) => PropertyId::DownloadProgress,
            Property::Unauthenticated(_) => PropertyId::Unauthenticated,
            Property::DownloadSpeed(_) => PropertyId::DownloadSpeed,
            Property::RemainingTime(_) => PropertyId::RemainingTime,
            Property::RequiredMedium(_) => PropertyId::RequiredMedium,
            Property::ConfigFileConflict(_) => PropertyId::ConfigFileConflict,
        }
    }

    /// Encode the value for the wire
    pub fn to_wire(&self) -> Value {
        match self {
            Property::Id(s)
            | Property::CreatedAt(s)
            | Property::Locale(s)
            | Property::Proxy(s)
            | Property::DebconfSocket(s)
            | Property::PackageFile(s)
            | Property::StatusDetails(s) => json!(s),
            Property::Owner(uid) => json!(uid),
            Property::Role(role) => json!(role.code()),
            Property::Status(status) => json!(status.code()),
            Property::ExitStatus(exit) => json!(exit.code()),
            Property::Error(None) => json!([0, ""]),
            Property::Error(Some(err)) => json!([err.code.code(), err.details]),
            Property::ErrorLog(lines) | Property::Unauthenticated(lines) => json!(lines),
            Property::Packages(map) => {
                let encoded: serde_json::Map<String, Value> = map
                    .iter()
                    .map(|(name, action)| (name.clone(), json!(action.code())))
                    .collect();
                Value::Object(encoded)
            }
            Property::AllowUnauthenticated(b)
            | Property::Cancellable(b)
            | Property::Cancelled(b)
            | Property::Paused(b) => json!(b),
            Property::Capabilities(caps) => json!(caps.bits()),
            Property::Progress(p) => json!(p),
            Property::DownloadProgress(dp) => dp.to_wire(),
            Property::DownloadSpeed(n) | Property::RemainingTime(n) => json!(n),
            Property::RequiredMedium(None) => json!(["", ""]),
            Property::RequiredMedium(Some(m)) => json!([m.label, m.mount_point]),
            Property::ConfigFileConflict(None) => json!(["", ""]),
            Property::ConfigFileConflict(Some(c)) => json!([c.old_path, c.new_path]),
        }
    }

    /// Decode a wire value for the given property
    pub fn from_wire(id: PropertyId, value: &Value) -> Result<Self> {
        let property = match id {
            PropertyId::Id => Property::Id(as_string(id, value)?),
            PropertyId::Owner => Property::Owner(as_u32(id, value)?),
            PropertyId::CreatedAt => Property::CreatedAt(as_string(id, value)?),
            PropertyId::Role => Property::Role(Role::from_code(as_u8(id, value)?)?),
            PropertyId::Status => Property::Status(Status::from_code(as_u8(id, value)?)?),
            PropertyId::ExitStatus => {
                Property::ExitStatus(ExitStatus::from_code(as_u8(id, value)?)?)
            }
            PropertyId::Error => {
                let (code, details) = as_pair(id, value)?;
                let code = code
                    .as_u64()
                    .and_then(|c| u8::try_from(c).ok())
                    .ok_or_else(|| type_error(id, "an error code"))?;
                let details = details
                    .as_str()
                    .ok_or_else(|| type_error(id, "error details"))?;
                if code == 0 {
                    Property::Error(None)
                } else {
                    Property::Error(Some(TransactionError::new(
                        ErrorCode::from_code(code)?,
                        details,
                    )))
                }
            }
            PropertyId::ErrorLog => Property::ErrorLog(as_string_list(id, value)?),
            PropertyId::Locale => Property::Locale(as_string(id, value)?),
            PropertyId::Proxy => Property::Proxy(as_string(id, value)?),
            PropertyId::DebconfSocket => Property::DebconfSocket(as_string(id, value)?),
            PropertyId::Packages => {
                let object = value
                    .as_object()
                    .ok_or_else(|| type_error(id, "an object"))?;
                let mut map = PackageMap::new();
                for (name, code) in object {
                    let code = code
                        .as_u64()
                        .and_then(|c| u8::try_from(c).ok())
                        .ok_or_else(|| type_error(id, "integer action codes"))?;
                    map.insert(name.clone(), PackageAction::from_code(code)?);
                }
                Property::Packages(map)
            }
            PropertyId::PackageFile => Property::PackageFile(as_string(id, value)?),
            PropertyId::AllowUnauthenticated => {
                Property::AllowUnauthenticated(as_bool(id, value)?)
            }
            PropertyId::Capabilities => {
                Property::Capabilities(Capabilities::from_bits(as_u32(id, value)?))
            }
            PropertyId::Cancellable => Property::Cancellable(as_bool(id, value)?),
            PropertyId::Cancelled => Property::Cancelled(as_bool(id, value)?),
            PropertyId::Paused => Property::Paused(as_bool(id, value)?),
            PropertyId::StatusDetails => Property::StatusDetails(as_string(id, value)?),
            PropertyId::Progress => Property::Progress(as_u32(id, value)?),
            PropertyId::DownloadProgress => {
                Property::DownloadProgress(DownloadProgress::from_wire(value)?)
            }
            PropertyId::Unauthenticated => Property::Unauthenticated(as_string_list(id, value)?),
            PropertyId::DownloadSpeed => Property::DownloadSpeed(as_u64(id, value)?),
            PropertyId::RemainingTime => Property::RemainingTime(as_u64(id, value)?),
            PropertyId::RequiredMedium => {
                let (label, mount) = as_string_pair(id, value)?;
                if label.is_empty() && mount.is_empty() {
                    Property::RequiredMedium(None)
                } else {
                    Property::RequiredMedium(Some(MediumRequest {
                        label,
                        mount_point: mount,
                    }))
                }
            }
            PropertyId::ConfigFileConflict => {
                let (old, new) = as_string_pair(id, value)?;
                if old.is_empty() && new.is_empty() {
                    Property::ConfigFileConflict(None)
                } else {
                    Property::ConfigFileConflict(Some(ConfigFileConflict {
                        old_path: old,
                        new_path: new,
                    }))
                }
            }
        };
        Ok(property)
    }
}

/// One property change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Property id as an integer
    pub property: PropertyId,
    /// Wire-encoded value
    pub value: Value,
}

impl PropertyChange {
    /// Decode into a typed property
    pub fn decode(&self) -> Result<Property> {
        Property::from_wire(self.property, &self.value)
    }
}

impl From<&Property> for PropertyChange {
    fn from(property: &Property) -> Self {
        Self {
            property: property.id(),
            value: property.to_wire(),
        }
    }
}

fn type_error(id: PropertyId, expected: &str) -> Error {
    Error::ParseError(format!("property {:?} expects {}", id, expected))
}

fn as_string(id: PropertyId, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| type_error(id, "a string"))
}

fn as_bool(id: PropertyId, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| type_error(id, "a boolean"))
}

fn as_u64(id: PropertyId, value: &Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| type_error(id, "an unsigned integer"))
}

fn as_u32(id: PropertyId, value: &Value) -> Result<u32> {
    as_u64(id, value).and_then(|n| u32::try_from(n).map_err(|_| type_error(id, "a 32-bit integer")))
}

fn as_u8(id: PropertyId, value: &Value) -> Result<u8> {
    as_u64(id, value).and_then(|n| u8::try_from(n).map_err(|_| type_error(id, "a small integer")))
}

fn as_string_list(id: PropertyId, value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| type_error(id, "an array of strings"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| type_error(id, "an array of strings"))
        })
        .collect()
}

fn as_pair(id: PropertyId, value: &Value) -> Result<(&Value, &Value)> {
    match value.as_array().map(Vec::as_slice) {
        Some([first, second]) => Ok((first, second)),
        _ => Err(type_error(id, "a 2-element array")),
    }
}

fn as_string_pair(id: PropertyId, value: &Value) -> Result<(String, String)> {
    let (first, second) = as_pair(id, value)?;
    Ok((as_string(id, first)?, as_string(id, second)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_ids_match_wire_order() {
        for (idx, id) in PropertyId::ALL.iter().enumerate() {
            assert_eq!(usize::from(id.code()), idx);
            assert_eq!(PropertyId::from_code(idx as u8).unwrap(), *id);
        }
        assert!(PropertyId::from_code(200).is_err());
    }

    #[test]
    fn test_enum_properties_travel_as_integers() {
        let change = PropertyChange::from(&Property::Status(Status::Committing));
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(json, r#"{"property":4,"value":6}"#);
    }

    #[test]
    fn test_packages_decode() {
        let value = json!({"foo": 0, "bar,1.0": 4});
        let property = Property::from_wire(PropertyId::Packages, &value).unwrap();
        let Property::Packages(map) = property else {
            panic!("expected packages");
        };
        assert_eq!(map["foo"], PackageAction::Install);
        assert_eq!(map["bar,1.0"], PackageAction::Remove);

        assert!(Property::from_wire(PropertyId::Packages, &json!({"foo": 99})).is_err());
    }

    #[test]
    fn test_error_decode() {
        let none = Property::from_wire(PropertyId::Error, &json!([0, ""])).unwrap();
        assert_eq!(none, Property::Error(None));

        let err = Property::from_wire(PropertyId::Error, &json!([5, "dpkg failed"])).unwrap();
        assert_eq!(
            err,
            Property::Error(Some(TransactionError::new(ErrorCode::CommitError, "dpkg failed")))
        );
    }

    #[test]
    fn test_medium_and_conffile_decode() {
        let medium = Property::RequiredMedium(Some(MediumRequest {
            label: "Debian DVD 1".to_string(),
            mount_point: "/media/cdrom".to_string(),
        }));
        let decoded = Property::from_wire(PropertyId::RequiredMedium, &medium.to_wire()).unwrap();
        assert_eq!(decoded, medium);

        let cleared = Property::from_wire(PropertyId::ConfigFileConflict, &json!(["", ""])).unwrap();
        assert_eq!(cleared, Property::ConfigFileConflict(None));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        assert!(Property::from_wire(PropertyId::Progress, &json!("fifty")).is_err());
        assert!(Property::from_wire(PropertyId::Status, &json!(300)).is_err());
        assert!(Property::from_wire(PropertyId::Paused, &json!(1)).is_err());
    }

    #[test]
    fn test_writability() {
        assert!(PropertyId::Locale.is_client_writable());
        assert!(!PropertyId::Status.is_client_writable());
        for identity in [PropertyId::Id, PropertyId::Owner, PropertyId::CreatedAt] {
            assert!(!identity.is_client_writable());
        }
    }
}
