use std::time::Duration;

use reqwest::Client;
use tracing::{debug, error};

use crate::replication::retry::{with_retry, IsRetryable, RetryConfig};
use crate::replication::{BatchResponse, ReplicationBatch};

/// Errors that can occur when sending a batch to a peer
#[derive(Debug)]
pub enum ReplicationSendError {
    Timeout,
    Http { status: u16, peer: String },
    Network(String),
    Serialize(String),
}

impl std::fmt::Display for ReplicationSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationSendError::Timeout => write!(f, "request timed out"),
            ReplicationSendError::Http { status, peer } => {
                write!(f, "HTTP {} from {}", status, peer)
            }
            ReplicationSendError::Network(msg) => write!(f, "network error: {}", msg),
            ReplicationSendError::Serialize(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl IsRetryable for ReplicationSendError {
    fn is_retryable(&self) -> bool {
        match self {
            ReplicationSendError::Timeout => true,
            ReplicationSendError::Http { status, .. } => matches!(status, 502..=504),
            ReplicationSendError::Network(_) => true,
            ReplicationSendError::Serialize(_) => false,
        }
    }
}

/// HTTP client for the peer batch endpoint. One instance is shared by every
/// peer task.
pub struct PeerClient {
    client: Client,
    retry: RetryConfig,
}

impl PeerClient {
    /// Create a new client. Returns an error if the HTTP client fails to
    /// build (e.g., TLS configuration issues).
    pub fn new(send_timeout: Duration, retry: RetryConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(send_timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self { client, retry })
    }

    /// Send one replication batch to a peer and parse the per-operation
    /// results. Transient failures are retried; anything else is returned to
    /// the caller, which owns the drop decision.
    #[tracing::instrument(
        name = "peer_send",
        skip(self, batch),
        fields(
            peer = %peer_url,
            op_count = batch.operations.len(),
        )
    )]
    pub async fn send_batch(
        &self,
        peer_url: &str,
        batch: &ReplicationBatch,
    ) -> Result<BatchResponse, ReplicationSendError> {
        let endpoint = format!("{}/v1/peer/batch", peer_url.trim_end_matches('/'));
        debug!(endpoint = %endpoint, "sending replication batch");

        with_retry(&self.retry, || async {
            let response = self
                .client
                .post(&endpoint)
                .json(batch)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        ReplicationSendError::Timeout
                    } else {
                        ReplicationSendError::Network(e.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                let resp_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "(failed to read body)".to_string());
                error!(
                    endpoint = %endpoint,
                    status,
                    response_body = %resp_body,
                    "peer returned error status"
                );
                return Err(ReplicationSendError::Http {
                    status,
                    peer: peer_url.to_string(),
                });
            }

            response
                .json::<BatchResponse>()
                .await
                .map_err(|e| ReplicationSendError::Serialize(e.to_string()))
        })
        .await
    }
}
