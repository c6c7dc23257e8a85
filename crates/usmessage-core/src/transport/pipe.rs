//! Per-endpoint request serialization
//!
//! Characteristic endpoints carry no correlation id, so a response can only
//! be attributed to the request that was written last. [`RequestPipe`] holds
//! one fair FIFO gate per endpoint for the whole write-then-read exchange and
//! bounds every exchange by a timeout and by link loss, so a stuck call
//! always releases its gate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::DEFAULT_MAX_CHUNK_PAYLOAD;
use crate::connection::ConnectionMachine;
use crate::errors::{Result, SyncError};
use crate::protocol::{Request, Response};
use crate::transport::Endpoint;

/// Issues requests over the active link, one at a time per endpoint
pub struct RequestPipe {
    machine: Arc<ConnectionMachine>,
    gates: [Mutex<()>; Endpoint::COUNT],
    timeout: Duration,
    max_chunk_payload: usize,
}

impl RequestPipe {
    pub fn new(machine: Arc<ConnectionMachine>, timeout: Duration) -> Self {
        Self {
            machine,
            gates: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
            timeout,
            max_chunk_payload: DEFAULT_MAX_CHUNK_PAYLOAD,
        }
    }

    /// Largest data frame accepted in a chunked response
    pub fn with_max_chunk_payload(mut self, size: usize) -> Self {
        self.max_chunk_payload = size;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_chunk_payload(&self) -> usize {
        self.max_chunk_payload
    }

    /// Single write-then-read exchange decoded as a [`Response`]
    pub async fn request(&self, endpoint: Endpoint, request: &Request) -> Result<Response> {
        let payload = request.encode()?;
        let bytes = self.exchange(endpoint, &payload, false).await?;
        Response::decode(&bytes)
    }

    /// Exchange whose response arrives as a chunked transfer
    pub async fn request_large(&self, endpoint: Endpoint, request: &Request) -> Result<Vec<u8>> {
        let payload = request.encode()?;
        self.exchange(endpoint, &payload, true).await
    }

    async fn exchange(&self, endpoint: Endpoint, payload: &[u8], large: bool) -> Result<Vec<u8>> {
        let _gate = self.gates[endpoint.index()].lock().await;

        // Resolve the link only once the gate is held so a queued request
        // never runs against a link that closed while it waited.
        let link = self.machine.active_link().ok_or(SyncError::NotConnected)?;
        let mut lost = link.lost.clone();

        debug!(
            "Request on {} endpoint ({} bytes, chunked: {})",
            endpoint,
            payload.len(),
            large
        );

        let operation = async {
            if large {
                link.channel
                    .request_large(endpoint, payload, self.max_chunk_payload)
                    .await
            } else {
                link.channel.request(endpoint, payload).await
            }
        };
        let link_gone = async move { lost.wait_for(|lost| *lost).await.map(|_| ()) };

        let result = tokio::select! {
            outcome = tokio::time::timeout(self.timeout, operation) => match outcome {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout {
                    duration_ms: self.timeout.as_millis() as u64,
                }),
            },
            _ = link_gone => Err(SyncError::LinkLost),
        };

        match &result {
            Err(SyncError::LinkLost) => {
                self.machine
                    .link_lost(link.generation, "link lost during request");
            }
            Err(SyncError::MalformedTransfer { reason }) => {
                error!("Malformed transfer on {} endpoint: {}", endpoint, reason);
            }
            Err(e) => debug!("Request on {} endpoint failed: {}", endpoint, e),
            Ok(bytes) => debug!("Response on {} endpoint ({} bytes)", endpoint, bytes.len()),
        }
        result
    }
}

impl std::fmt::Debug for RequestPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipe")
            .field("timeout", &self.timeout)
            .field("max_chunk_payload", &self.max_chunk_payload)
            .finish()
    }
}
