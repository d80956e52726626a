use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Longest accepted application name or instance id.
const MAX_NAME_LEN: usize = 128;

/// Type-safe representation of an instance's lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    #[default]
    Unknown,
}

impl InstanceStatus {
    /// Wire name used in status-update requests and serialized snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parse from the wire name.
    pub fn from_name(name: &str) -> Option<InstanceStatus> {
        match name {
            "UP" => Some(InstanceStatus::Up),
            "DOWN" => Some(InstanceStatus::Down),
            "STARTING" => Some(InstanceStatus::Starting),
            "OUT_OF_SERVICE" => Some(InstanceStatus::OutOfService),
            "UNKNOWN" => Some(InstanceStatus::Unknown),
            _ => None,
        }
    }

    /// All supported statuses.
    pub fn all() -> &'static [InstanceStatus] {
        &[
            InstanceStatus::Up,
            InstanceStatus::Down,
            InstanceStatus::Starting,
            InstanceStatus::OutOfService,
            InstanceStatus::Unknown,
        ]
    }
}

/// One registered service instance.
///
/// Records are immutable once stored: every update (status change, replicated
/// overwrite) produces a new value. `last_dirty_timestamp_ms` is the owning
/// client's logical clock and drives last-writer-wins conflict resolution on
/// the replication path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub app_name: String,
    pub instance_id: String,
    pub host_name: String,
    pub ip_addr: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_port: Option<u16>,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub last_dirty_timestamp_ms: u64,
    /// Per-instance lease TTL override; the registry default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_secs: Option<u64>,
    /// Opaque client-supplied key/value pairs. BTreeMap keeps serialized
    /// snapshots byte-stable across identical registry states.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl InstanceRecord {
    /// Reject malformed records before they touch the store.
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_name("app_name", &self.app_name)?;
        validate_name("instance_id", &self.instance_id)?;
        if self.ip_addr.is_empty() {
            return Err(RegistryError::InvalidRecord("ip_addr is empty".into()));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidRecord("port is zero".into()));
        }
        Ok(())
    }

    /// Application names are case-insensitive on the wire; the store keys
    /// them uppercase.
    pub(crate) fn normalize(&mut self) {
        self.app_name = self.app_name.to_uppercase();
    }

    /// New record with an updated status and dirty timestamp.
    pub(crate) fn with_status(&self, status: InstanceStatus, dirty_ms: u64) -> InstanceRecord {
        let mut next = self.clone();
        next.status = status;
        next.last_dirty_timestamp_ms = dirty_ms;
        next
    }
}

fn validate_name(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.is_empty() {
        return Err(RegistryError::InvalidRecord(format!("{} is empty", field)));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(RegistryError::InvalidRecord(format!(
            "{} exceeds {} chars",
            field, MAX_NAME_LEN
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(RegistryError::InvalidRecord(format!(
            "{} contains invalid chars",
            field
        )));
    }
    Ok(())
}
