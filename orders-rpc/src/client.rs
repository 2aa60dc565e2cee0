use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::read_envelope;
use crate::write_frame;
use crate::AddressRequiredSnafu;
use crate::ConnectFailedSnafu;
use crate::ConnectionClosedSnafu;
use crate::Error;
use crate::RPCEnvelope;
use crate::RPCStatus;
use crate::RecvFailedSnafu;
use crate::Result;
use crate::StatusCode;
use snafu::prelude::*;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::oneshot;

// `None` once the read loop has exited and no reply can arrive.
type PendingRequestsMap = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<RPCEnvelope>>>>>;

/// A multiplexed connection to one server.
///
/// Calls may be issued concurrently; replies are matched back to callers by
/// sequence number.
pub struct RPCClient {
    write_half: Mutex<OwnedWriteHalf>,
    next_sequence_number: AtomicU64,
    pending_requests: PendingRequestsMap,
}

#[derive(Default)]
pub struct RPCClientBuilder {
    address: Option<String>,
}

impl RPCClientBuilder {
    pub fn new() -> Self {
        Self { address: None }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub async fn build(self) -> Result<Arc<RPCClient>> {
        let address = self.address.context(AddressRequiredSnafu)?;
        tracing::debug!("Attempting to connect to server at {}", address);
        let stream = TcpStream::connect(&address)
            .await
            .context(ConnectFailedSnafu)?;
        stream.set_nodelay(true).context(ConnectFailedSnafu)?;
        tracing::debug!("Connected to server at {}", address);
        let (read_half, write_half) = stream.into_split();
        let client = Arc::new(RPCClient {
            write_half: Mutex::new(write_half),
            next_sequence_number: AtomicU64::new(1),
            pending_requests: Arc::new(Mutex::new(Some(HashMap::new()))),
        });

        let pending = client.pending_requests.clone();
        tokio::spawn(async move {
            if let Err(e) = read_loop(read_half, pending).await {
                tracing::error!("Read loop error: {}", e);
            }
        });

        Ok(client)
    }
}

impl RPCClient {
    /// Sends one request and waits for its reply.
    ///
    /// Any status other than `Ok` comes back as [`Error::Status`].
    pub async fn call(&self, service: &str, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let sequence_number = self.next_sequence_number.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Calling RPC: service={}, method={}, seq={}, payload_size={}",
            service,
            method,
            sequence_number,
            payload.len()
        );
        let (tx, rx) = oneshot::channel::<RPCEnvelope>();
        match self.pending_requests.lock().await.as_mut() {
            Some(pending) => pending.insert(sequence_number, tx),
            None => return ConnectionClosedSnafu.fail(),
        };

        let request = RPCEnvelope::request(sequence_number, service, method, payload);
        let sent = write_frame(&mut *self.write_half.lock().await, &request).await;
        if let Err(e) = sent {
            if let Some(pending) = self.pending_requests.lock().await.as_mut() {
                pending.remove(&sequence_number);
            }
            return Err(e);
        }

        let reply = rx.await.context(RecvFailedSnafu)?;
        let status = reply
            .status
            .unwrap_or_else(|| RPCStatus::new(StatusCode::Internal, "reply carried no status"));
        if !status.is_ok() {
            return Err(Error::Status { status });
        }
        Ok(reply.payload)
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number.load(Ordering::Relaxed)
    }
}

/// Routes replies to waiting callers until the server hangs up. Dropping the
/// pending senders on exit fails every outstanding call with `RecvFailed`.
async fn read_loop(mut read_half: OwnedReadHalf, pending: PendingRequestsMap) -> Result<()> {
    let outcome = loop {
        let reply = match read_envelope(&mut read_half).await {
            Ok(reply) => reply,
            Err(e) if e.is_disconnect() => break Ok(()),
            Err(e) => break Err(e),
        };
        let sequence_number = reply.sequence_number;
        let tx = pending
            .lock()
            .await
            .as_mut()
            .and_then(|waiting| waiting.remove(&sequence_number));
        match tx {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    tracing::debug!("Caller went away before reply: seq={}", sequence_number);
                }
            }
            None => tracing::warn!("No pending request found for seq={}", sequence_number),
        }
    };

    if let Some(abandoned) = pending.lock().await.take() {
        if !abandoned.is_empty() {
            tracing::debug!("Cleaning up {} pending requests", abandoned.len());
        }
    }
    outcome
}
