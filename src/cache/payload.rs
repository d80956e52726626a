//! Serialized registry views: full and compact snapshots, deltas, gzip.

use std::collections::BTreeMap;
use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::cache::changelog::{ChangeEntry, ChangeKind};
use crate::cache::key::{PayloadEncoding, PayloadFormat};
use crate::error::Result;
use crate::instance::{InstanceRecord, InstanceStatus};
use crate::store::{AppSnapshot, LeaseSnapshot};

/// Full instance entry: the record plus lease timing. Renewal timestamps are
/// deliberately not serialized, so a renew-only interval leaves the payload
/// byte-identical and cache hits stay valid.
#[derive(Debug, Serialize)]
struct FullInstance {
    instance_id: String,
    host_name: String,
    ip_addr: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    secure_port: Option<u16>,
    status: InstanceStatus,
    last_dirty_timestamp_ms: u64,
    registered_at_ms: u64,
    lease_duration_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_up_since_ms: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

impl From<&LeaseSnapshot> for FullInstance {
    fn from(lease: &LeaseSnapshot) -> Self {
        FullInstance {
            instance_id: lease.record.instance_id.clone(),
            host_name: lease.record.host_name.clone(),
            ip_addr: lease.record.ip_addr.clone(),
            port: lease.record.port,
            secure_port: lease.record.secure_port,
            status: lease.record.status,
            last_dirty_timestamp_ms: lease.record.last_dirty_timestamp_ms,
            registered_at_ms: lease.registered_at_ms,
            lease_duration_secs: lease.lease_duration_ms / 1000,
            service_up_since_ms: lease.service_up_since_ms,
            metadata: lease.record.metadata.clone(),
        }
    }
}

/// Compact instance entry: just enough to route a request.
#[derive(Debug, Serialize)]
struct CompactInstance {
    instance_id: String,
    ip_addr: String,
    port: u16,
    status: InstanceStatus,
}

impl From<&LeaseSnapshot> for CompactInstance {
    fn from(lease: &LeaseSnapshot) -> Self {
        CompactInstance {
            instance_id: lease.record.instance_id.clone(),
            ip_addr: lease.record.ip_addr.clone(),
            port: lease.record.port,
            status: lease.record.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApplicationView<I> {
    name: String,
    instances: Vec<I>,
}

impl<I> ApplicationView<I> {
    fn build(app: &AppSnapshot) -> ApplicationView<I>
    where
        for<'a> I: From<&'a LeaseSnapshot>,
    {
        ApplicationView {
            name: app.name.clone(),
            instances: app.instances.iter().map(I::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApplicationsPayload<I> {
    generation: u64,
    applications: Vec<ApplicationView<I>>,
}

#[derive(Debug, Serialize)]
struct SingleApplicationPayload<I> {
    generation: u64,
    application: ApplicationView<I>,
}

#[derive(Debug, Serialize)]
struct DeltaChange<'a> {
    sequence: u64,
    kind: ChangeKind,
    instance: &'a InstanceRecord,
}

#[derive(Debug, Serialize)]
struct DeltaPayload<'a> {
    latest_marker: u64,
    changes: Vec<DeltaChange<'a>>,
}

/// Serialize the all-applications view.
pub fn render_applications(
    snapshot: &[AppSnapshot],
    generation: u64,
    format: PayloadFormat,
) -> Result<Vec<u8>> {
    let bytes = match format {
        PayloadFormat::Full => serde_json::to_vec(&ApplicationsPayload::<FullInstance> {
            generation,
            applications: snapshot.iter().map(ApplicationView::build).collect(),
        })?,
        PayloadFormat::Compact => serde_json::to_vec(&ApplicationsPayload::<CompactInstance> {
            generation,
            applications: snapshot.iter().map(ApplicationView::build).collect(),
        })?,
    };
    Ok(bytes)
}

/// Serialize one application's view. An unknown application serializes as an
/// empty instance list rather than an error.
pub fn render_application(
    name: &str,
    snapshot: Option<&AppSnapshot>,
    generation: u64,
    format: PayloadFormat,
) -> Result<Vec<u8>> {
    let empty = AppSnapshot {
        name: name.to_string(),
        instances: Vec::new(),
    };
    let app = snapshot.unwrap_or(&empty);
    let bytes = match format {
        PayloadFormat::Full => serde_json::to_vec(&SingleApplicationPayload::<FullInstance> {
            generation,
            application: ApplicationView::build(app),
        })?,
        PayloadFormat::Compact => {
            serde_json::to_vec(&SingleApplicationPayload::<CompactInstance> {
                generation,
                application: ApplicationView::build(app),
            })?
        }
    };
    Ok(bytes)
}

/// Serialize a delta response. `latest_marker` is the client's next `since`.
pub fn render_delta(entries: &[ChangeEntry], latest_marker: u64) -> Result<Vec<u8>> {
    let payload = DeltaPayload {
        latest_marker,
        changes: entries
            .iter()
            .map(|e| DeltaChange {
                sequence: e.sequence,
                kind: e.kind,
                instance: &e.record,
            })
            .collect(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Apply the payload encoding. Identity passes bytes through; gzip compresses
/// with the default level.
pub fn encode(bytes: Vec<u8>, encoding: PayloadEncoding) -> Result<Bytes> {
    match encoding {
        PayloadEncoding::Identity => Ok(Bytes::from(bytes)),
        PayloadEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
            encoder.write_all(&bytes)?;
            Ok(Bytes::from(encoder.finish()?))
        }
    }
}
