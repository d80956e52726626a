//! Registry error taxonomy.

use thiserror::Error;

/// Errors surfaced by registry operations.
///
/// Replication transport failures are deliberately absent: replication is
/// best-effort and never reported to the originating client.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Renew/cancel/status target is not registered. Recoverable: the caller
    /// may re-register.
    #[error("instance {app_name}/{instance_id} not found")]
    NotFound {
        app_name: String,
        instance_id: String,
    },

    /// Malformed record rejected before any state change.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The instance id is already registered under a different application.
    #[error("instance id {instance_id} already registered to {owner}")]
    InstanceIdConflict { instance_id: String, owner: String },

    /// A replicated write lost last-writer-wins against the stored record.
    #[error("replicated write for {app_name}/{instance_id} is stale")]
    StaleReplica {
        app_name: String,
        instance_id: String,
    },

    /// A delta marker older than the retained change window; the caller must
    /// fetch a full snapshot and restart incremental sync from its marker.
    #[error("delta marker {since} predates retained history")]
    FullSnapshotRequired { since: u64 },

    /// Rendering a registry view failed.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compressing a registry view failed.
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] std::io::Error),
}

impl RegistryError {
    pub(crate) fn not_found(app_name: &str, instance_id: &str) -> Self {
        RegistryError::NotFound {
            app_name: app_name.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

/// Result alias used across the registry core.
pub type Result<T> = std::result::Result<T, RegistryError>;
