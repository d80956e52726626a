// src/lib.rs

pub mod cache;
pub mod config;
pub mod error;
pub mod eviction;
pub mod instance;
pub mod lease;
pub mod preservation;
pub mod registry;
pub mod replication;
pub mod server;
pub mod store;

pub use error::{RegistryError, Result};
pub use instance::{InstanceRecord, InstanceStatus};
pub use registry::{Origin, Registry};
pub use replication::{BatchResponse, OperationOutcome, ReplicationAction, ReplicationBatch};
