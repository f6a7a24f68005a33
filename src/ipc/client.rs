//! Child-Side IPC Client
//!
//! Skill code running under the agent finds the channel pre-opened on
//! fd 3. Availability is probed once at construction; when the descriptor
//! cannot be adopted the client still constructs, and every call returns
//! an "IPC unavailable" error object so skill code can run and be tested
//! outside the full agent context.
//!
//! Every outbound request carries a locally-unique, monotonically
//! increasing id. A reader task resolves pending callers as matching
//! response lines arrive; unmatched ids are logged and discarded. When the
//! stream ends, every pending caller is rejected with a channel-closed
//! error so no request is left permanently unresolved.

use super::{BridgeErrorResponse, PaidResponseMsg, IPC_FD};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default wait for a paid-request response.
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for status queries.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending callers by request id. `None` once the channel has closed.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Value>>>>>;

struct ClientInner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
}

pub struct IpcClient {
    inner: Option<Arc<ClientInner>>,
    payment_timeout: Duration,
    status_timeout: Duration,
}

impl IpcClient {
    /// Adopt the pre-opened agent descriptor. Must be called from within a
    /// tokio runtime. If fd 3 is not an open socket the channel is marked
    /// unavailable.
    pub fn from_agent_fd() -> Self {
        let std_stream = unsafe { StdUnixStream::from_raw_fd(IPC_FD) };
        if std_stream.peer_addr().is_err() || std_stream.set_nonblocking(true).is_err() {
            debug!("no IPC channel on fd {IPC_FD}, marking unavailable");
            std::mem::forget(std_stream); // do not close a descriptor we never owned
            return Self::unavailable();
        }
        match UnixStream::from_std(std_stream) {
            Ok(stream) => Self::from_stream(stream),
            Err(e) => {
                debug!("could not register IPC stream: {e}");
                Self::unavailable()
            }
        }
    }

    /// A client with no channel; every call returns `IPC_UNAVAILABLE`.
    pub fn unavailable() -> Self {
        Self {
            inner: None,
            payment_timeout: PAYMENT_TIMEOUT,
            status_timeout: STATUS_TIMEOUT,
        }
    }

    /// Wrap an already-connected stream (tests, embedded use).
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        tokio::spawn(read_loop(read, pending.clone()));
        Self {
            inner: Some(Arc::new(ClientInner {
                writer: tokio::sync::Mutex::new(write),
                pending,
                next_id: AtomicU64::new(0),
            })),
            payment_timeout: PAYMENT_TIMEOUT,
            status_timeout: STATUS_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, payment: Duration, status: Duration) -> Self {
        self.payment_timeout = payment;
        self.status_timeout = status;
        self
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_some()
    }

    /// Issue a metered paid request through the agent's payment bridge.
    pub async fn x402_request(
        &self,
        url: &str,
        method: &str,
        body: Option<Value>,
        task_id: Option<&str>,
        headers: Option<HashMap<String, String>>,
    ) -> Result<PaidResponseMsg, BridgeErrorResponse> {
        let mut fields = json!({ "url": url, "method": method });
        if let Some(body) = body {
            fields["body"] = body;
        }
        if let Some(task) = task_id {
            fields["taskId"] = json!(task);
        }
        if let Some(headers) = headers {
            fields["headers"] = json!(headers);
        }
        let value = self
            .call("x402_request", fields, self.payment_timeout)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeErrorResponse::transport(None, format!("malformed response: {e}")))
    }

    /// Query the agent's live session spending object.
    pub async fn get_session_spending(&self) -> Result<Value, BridgeErrorResponse> {
        let value = self
            .call("get_session_spending", json!({}), self.status_timeout)
            .await?;
        Ok(value.get("spending").cloned().unwrap_or(value))
    }

    async fn call(
        &self,
        action: &str,
        mut fields: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeErrorResponse> {
        let inner = match self.inner {
            Some(ref inner) => inner,
            None => return Err(BridgeErrorResponse::ipc_unavailable()),
        };

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        fields["action"] = json!(action);
        fields["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = inner.pending.lock().unwrap();
            match guard.as_mut() {
                Some(map) => {
                    map.insert(id, tx);
                }
                None => return Err(BridgeErrorResponse::channel_closed(Some(id))),
            }
        }

        let line = fields.to_string();
        debug!("→ {line}");
        {
            let mut writer = inner.writer.lock().await;
            let write_failed = writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err();
            if write_failed {
                if let Some(map) = inner.pending.lock().unwrap().as_mut() {
                    map.remove(&id);
                }
                return Err(BridgeErrorResponse::transport(
                    Some(id),
                    "failed to write request".to_string(),
                ));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => {
                if value.get("error").is_some() {
                    Err(serde_json::from_value(value).unwrap_or_else(|_| {
                        BridgeErrorResponse::transport(
                            Some(id),
                            "malformed error response".to_string(),
                        )
                    }))
                } else {
                    Ok(value)
                }
            }
            Ok(Err(_)) => Err(BridgeErrorResponse::channel_closed(Some(id))),
            Err(_) => {
                // Remove the entry: a late response for this id is then
                // treated as unmatched and discarded.
                if let Some(map) = inner.pending.lock().unwrap().as_mut() {
                    map.remove(&id);
                }
                Err(BridgeErrorResponse::timeout(Some(id), timeout))
            }
        }
    }
}

async fn read_loop(read: OwnedReadHalf, pending: Pending) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                debug!("← {trimmed}");
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("discarding unparseable IPC line: {e}");
                        continue;
                    }
                };
                let id = value.get("id").and_then(Value::as_u64);
                let sender = id.and_then(|id| {
                    pending
                        .lock()
                        .unwrap()
                        .as_mut()
                        .and_then(|map| map.remove(&id))
                });
                match sender {
                    Some(tx) => {
                        let _ = tx.send(value);
                    }
                    None => warn!("discarding IPC response with unmatched id {id:?}"),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    // End of stream: reject every pending caller immediately.
    let drained = pending.lock().unwrap().take();
    if let Some(map) = drained {
        for (id, tx) in map {
            let closed = serde_json::to_value(BridgeErrorResponse::channel_closed(Some(id)))
                .unwrap_or_default();
            let _ = tx.send(closed);
        }
    }
}
