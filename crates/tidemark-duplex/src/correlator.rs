use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use tidemark_protocol::{
    CallId, ConsumerMessage, Envelope, RegistrationFailureCode, RegistrationRequest,
    RegistrationResponse, RetryState, RuntimeMessage,
};

use crate::error::{DuplexError, DuplexResult};

/// Configuration for one duplex connection.
#[derive(Clone, Debug)]
pub struct DuplexConfig {
    /// Keepalive ping cadence while serving.
    pub ping_interval: Duration,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// Correlation table owned by one connection.
///
/// One mutex guards the call counter, the pending map, and the completed
/// flag, so registration can never race connection teardown.
struct CorrelationTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    next_call: u64,
    completed: bool,
    pending: HashMap<CallId, oneshot::Sender<Vec<u8>>>,
}

impl CorrelationTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_call: 0,
                completed: false,
                pending: HashMap::new(),
            }),
        }
    }

    /// Mint a call id and register its completion. `None` once the
    /// connection has completed.
    fn register(&self) -> Option<(CallId, oneshot::Receiver<Vec<u8>>)> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.completed {
            return None;
        }
        inner.next_call += 1;
        let id = CallId::new(inner.next_call);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        Some((id, rx))
    }

    /// Complete the pending call for `id`. Returns `false` when no call
    /// matches (stale or duplicate delivery); the payload is dropped.
    fn complete_call(&self, id: CallId, payload: Vec<u8>) -> bool {
        let sender = self.inner.lock().expect("lock poisoned").pending.remove(&id);
        match sender {
            // The caller may have been cancelled between removal and send;
            // a failed send is the same silent drop.
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Remove an abandoned call so a late response is dropped.
    fn abandon(&self, id: CallId) {
        self.inner.lock().expect("lock poisoned").pending.remove(&id);
    }

    /// Mark the connection completed and fail every pending call.
    fn complete_connection(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.completed = true;
        // Dropping the senders wakes the callers with a completion error.
        inner.pending.clear();
    }
}

/// Removes the pending entry if the call future is dropped before completion.
struct PendingCall {
    table: Arc<CorrelationTable>,
    id: CallId,
    armed: bool,
}

impl PendingCall {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.armed {
            self.table.abandon(self.id);
        }
    }
}

/// Handle for issuing calls over an active connection.
///
/// Cheap to clone; any number of calls may be in flight concurrently. The
/// correlation table, not sequencing, matches responses to calls.
#[derive(Clone)]
pub struct Correlator {
    table: Arc<CorrelationTable>,
    outbound: mpsc::Sender<RuntimeMessage>,
}

impl Correlator {
    /// Send a request and await the matching response payload.
    ///
    /// Fails with [`DuplexError::ConnectionCompleted`] — without touching the
    /// transport — once the connection has completed. Dropping the returned
    /// future abandons the call; a late response for it is silently dropped.
    pub async fn call(
        &self,
        payload: Vec<u8>,
        retry: Option<RetryState>,
    ) -> DuplexResult<Vec<u8>> {
        let Some((id, rx)) = self.table.register() else {
            return Err(DuplexError::ConnectionCompleted);
        };
        let guard = PendingCall {
            table: Arc::clone(&self.table),
            id,
            armed: true,
        };

        let request = RuntimeMessage::Request {
            call: id,
            payload,
            retry,
        };
        if self.outbound.send(request).await.is_err() {
            return Err(DuplexError::TransportClosed);
        }
        trace!(call = %id, "request sent");

        match rx.await {
            Ok(response) => {
                guard.disarm();
                Ok(response)
            }
            // Sender dropped: the connection completed while we waited.
            Err(_) => {
                guard.disarm();
                Err(DuplexError::ConnectionCompleted)
            }
        }
    }
}

/// One consumer connection over a duplex transport.
///
/// Protocol: the remote sends a [`RegistrationRequest`] first
/// ([`handshake`](Self::handshake)); the local side then either
/// [`accept`](Self::accept)s — entering the serving loop until the transport
/// closes — or [`reject`](Self::reject)s, which ends the connection without
/// serving. Both consume the connection, so exactly one of them can ever be
/// issued.
pub struct DuplexConnection {
    table: Arc<CorrelationTable>,
    outbound: mpsc::Sender<RuntimeMessage>,
    inbound: mpsc::Receiver<ConsumerMessage>,
    config: DuplexConfig,
    handshaken: bool,
}

impl DuplexConnection {
    pub fn new(
        outbound: mpsc::Sender<RuntimeMessage>,
        inbound: mpsc::Receiver<ConsumerMessage>,
        config: DuplexConfig,
    ) -> Self {
        Self {
            table: Arc::new(CorrelationTable::new()),
            outbound,
            inbound,
            config,
            handshaken: false,
        }
    }

    /// A call handle tied to this connection's correlation table. Valid for
    /// the connection's lifetime; calls fail once the connection completes.
    pub fn correlator(&self) -> Correlator {
        Correlator {
            table: Arc::clone(&self.table),
            outbound: self.outbound.clone(),
        }
    }

    /// Await the remote's registration request.
    pub async fn handshake(&mut self) -> DuplexResult<RegistrationRequest> {
        match self.inbound.recv().await {
            Some(ConsumerMessage::Registration(request)) => {
                self.handshaken = true;
                debug!(consumer = %request.consumer, kind = %request.kind, "handshake received");
                Ok(request)
            }
            Some(other) => {
                warn!(message = other.type_name(), "expected registration");
                Err(DuplexError::ProtocolViolation(other.type_name()))
            }
            None => Err(DuplexError::TransportClosed),
        }
    }

    /// Accept the registration and serve the connection until the transport
    /// closes. All pending calls fail once serving ends.
    pub async fn accept(mut self) -> DuplexResult<()> {
        if !self.handshaken {
            return Err(DuplexError::HandshakeRequired);
        }
        if self
            .outbound
            .send(RuntimeMessage::Registration(RegistrationResponse::Accepted))
            .await
            .is_err()
        {
            return Err(DuplexError::TransportClosed);
        }
        debug!("registration accepted, serving");
        self.serve().await
    }

    /// Refuse the registration with a typed failure and end the connection
    /// without entering the serving loop.
    pub async fn reject(
        mut self,
        code: RegistrationFailureCode,
        message: impl Into<String>,
    ) -> DuplexResult<()> {
        if !self.handshaken {
            return Err(DuplexError::HandshakeRequired);
        }
        let message = message.into();
        debug!(?code, %message, "registration rejected");
        let response = RuntimeMessage::Registration(RegistrationResponse::Rejected {
            code,
            message,
        });
        self.table.complete_connection();
        // Close our end so the remote sees the rejection as final.
        self.inbound.close();
        self.outbound
            .send(response)
            .await
            .map_err(|_| DuplexError::TransportClosed)
    }

    async fn serve(&mut self) -> DuplexResult<()> {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ping.tick().await;

        loop {
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(ConsumerMessage::Response { call, payload }) => {
                        if !self.table.complete_call(call, payload) {
                            trace!(call = %call, "dropping response for unknown call");
                        }
                    }
                    Some(ConsumerMessage::Pong) => {
                        trace!("pong");
                    }
                    Some(ConsumerMessage::Registration(_)) => {
                        warn!("registration re-sent on active connection");
                        return Err(DuplexError::ProtocolViolation("Registration"));
                    }
                    None => {
                        debug!("transport closed, connection complete");
                        return Ok(());
                    }
                },
                _ = ping.tick() => {
                    if self.outbound.send(RuntimeMessage::Ping).await.is_err() {
                        debug!("transport closed on ping, connection complete");
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Drop for DuplexConnection {
    // Covers every exit path, including the serve task being aborted:
    // pending callers are failed rather than left hanging.
    fn drop(&mut self) {
        self.table.complete_connection();
    }
}
