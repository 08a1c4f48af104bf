//! Transport multiplexer: one RPC channel per plugin instance
//!
//! A channel owns at most one live socket connection. Calls are tagged with a
//! call id and written by a dedicated writer task; a reader task routes each
//! response to its waiting caller, so any number of calls can be outstanding
//! and they complete in whatever order the plugin answers them.
//!
//! - A call that exceeds its timeout fails alone; the connection stays up.
//! - A connection that drops fails every in-flight call and reports the
//!   instance on the failure channel so it is re-probed immediately.
//! - The next call after a drop reconnects to the same endpoint.

use crate::error::TransportError;
use crate::host::InstanceId;
use crate::plugin::framing::{read_message, write_message};
use crate::plugin::protocol::{
    Envelope, NegotiateRequest, NegotiateResponse, PingRequest, PriceRequest, PriceResponse,
    envelope::Body,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

type Reply = oneshot::Sender<Result<Body, TransportError>>;

/// In-flight calls of one connection
#[derive(Default)]
struct Pending {
    calls: HashMap<u64, Reply>,
    closed: bool,
}

struct Connection {
    outbound: mpsc::Sender<Envelope>,
    pending: Arc<Mutex<Pending>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn spawn<S>(
        stream: S,
        instance: InstanceId,
        failures: mpsc::UnboundedSender<InstanceId>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::channel::<Envelope>(64);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let failures = failures.clone();
            tokio::spawn(async move {
                while let Some(envelope) = outbound_rx.recv().await {
                    if let Err(err) = write_message(&envelope, &mut write_half).await {
                        fail_connection(
                            &pending,
                            &closed,
                            &failures,
                            instance,
                            format!("write failed: {err}"),
                        );
                        break;
                    }
                }
            })
        };

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let reason = loop {
                    match read_message::<Envelope, _>(&mut read_half).await {
                        Ok(Some(envelope)) => route_response(&pending, instance, envelope),
                        Ok(None) => break "plugin closed the connection".to_string(),
                        Err(err) => break format!("read failed: {err}"),
                    }
                };
                fail_connection(&pending, &closed, &failures, instance, reason);
            })
        };

        Self {
            outbound,
            pending,
            closed,
            reader,
            writer,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register(&self, call_id: u64, reply: Reply) -> Result<(), TransportError> {
        let mut pending = lock(&self.pending);
        if pending.closed {
            return Err(TransportError::ChannelFailure(
                "connection already closed".to_string(),
            ));
        }
        pending.calls.insert(call_id, reply);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        lock(&self.pending).calls.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Removes a call's pending entry however the call ends, cancellation included
struct Registration<'a> {
    pending: &'a Mutex<Pending>,
    call_id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(self.pending).calls.remove(&self.call_id);
    }
}

fn lock(pending: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn route_response(pending: &Mutex<Pending>, instance: InstanceId, envelope: Envelope) {
    let Some(reply) = lock(pending).calls.remove(&envelope.call_id) else {
        // The caller gave up (timeout) before the plugin answered
        debug!(
            "Instance {instance}: dropping late response for call {}",
            envelope.call_id
        );
        return;
    };

    let result = match envelope.body {
        Some(Body::ErrorResponse(err)) => Err(TransportError::Protocol(err.message)),
        Some(body) => Ok(body),
        None => Err(TransportError::Protocol("response without a body".to_string())),
    };
    let _ = reply.send(result);
}

fn fail_connection(
    pending: &Mutex<Pending>,
    closed: &AtomicBool,
    failures: &mpsc::UnboundedSender<InstanceId>,
    instance: InstanceId,
    reason: String,
) {
    let drained: Vec<Reply> = {
        let mut pending = lock(pending);
        if pending.closed {
            return;
        }
        pending.closed = true;
        pending.calls.drain().map(|(_, reply)| reply).collect()
    };
    closed.store(true, Ordering::Release);

    warn!(
        "Instance {instance}: channel failed ({reason}), failing {} in-flight call(s)",
        drained.len()
    );
    for reply in drained {
        let _ = reply.send(Err(TransportError::ChannelFailure(reason.clone())));
    }
    let _ = failures.send(instance);
}

/// The live connection to one plugin instance
pub struct RpcChannel {
    instance: InstanceId,
    endpoint: PathBuf,
    next_call_id: AtomicU64,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    failures: mpsc::UnboundedSender<InstanceId>,
}

impl RpcChannel {
    pub fn new(
        instance: InstanceId,
        endpoint: impl Into<PathBuf>,
        failures: mpsc::UnboundedSender<InstanceId>,
    ) -> Self {
        Self {
            instance,
            endpoint: endpoint.into(),
            next_call_id: AtomicU64::new(1),
            connection: tokio::sync::Mutex::new(None),
            failures,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Number of calls currently waiting for a response
    pub async fn in_flight(&self) -> usize {
        match self.connection.lock().await.as_ref() {
            Some(connection) => connection.in_flight(),
            None => 0,
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, TransportError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if !connection.is_closed() {
                return Ok(Arc::clone(connection));
            }
            debug!("Instance {}: reconnecting to {}", self.instance, self.endpoint.display());
        }

        let stream = UnixStream::connect(&self.endpoint)
            .await
            .map_err(|err| TransportError::Connect(format!("{}: {err}", self.endpoint.display())))?;
        let connection = Arc::new(Connection::spawn(stream, self.instance, self.failures.clone()));
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Issue one call and wait for its response, bounded by `timeout`
    pub async fn call(&self, body: Body, timeout: Duration) -> Result<Body, TransportError> {
        let deadline = Instant::now() + timeout;
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let kind = body.kind();

        let connection = tokio::time::timeout_at(deadline, self.connection())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let (reply_tx, reply_rx) = oneshot::channel();
        connection.register(call_id, reply_tx)?;
        let _registration = Registration {
            pending: &connection.pending,
            call_id,
        };

        let envelope = Envelope {
            call_id,
            body: Some(body),
        };
        // A peer that stops reading backs up the writer and then this queue,
        // so the send is bounded by the same deadline as the reply
        let exchange = async {
            connection
                .outbound
                .send(envelope)
                .await
                .map_err(|_| TransportError::ChannelFailure("writer stopped".to_string()))?;
            match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ChannelFailure(
                    "connection dropped before the response arrived".to_string(),
                )),
            }
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    "Instance {}: {kind} call {call_id} timed out after {timeout:?}",
                    self.instance
                );
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Drop the current connection without reporting a failure
    pub async fn close(&self) {
        self.connection.lock().await.take();
    }
}

/// Owns every instance's channel and applies the per-call timeout
pub struct Multiplexer {
    channels: RwLock<HashMap<InstanceId, Arc<RpcChannel>>>,
    call_timeout: Duration,
    failures: mpsc::UnboundedSender<InstanceId>,
    next_nonce: AtomicU64,
}

impl Multiplexer {
    /// `failures` receives the id of every instance whose connection drops
    pub fn new(call_timeout: Duration, failures: mpsc::UnboundedSender<InstanceId>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            call_timeout,
            failures,
            next_nonce: AtomicU64::new(1),
        }
    }

    pub fn open(&self, instance: InstanceId, endpoint: &Path) -> Arc<RpcChannel> {
        let channel = Arc::new(RpcChannel::new(instance, endpoint, self.failures.clone()));
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(instance, Arc::clone(&channel));
        channel
    }

    pub async fn close(&self, instance: InstanceId) {
        let channel = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&instance);
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    pub fn channel(&self, instance: InstanceId) -> Option<Arc<RpcChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&instance)
            .cloned()
    }

    pub async fn call(&self, instance: InstanceId, body: Body) -> Result<Body, TransportError> {
        self.call_with_timeout(instance, body, self.call_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        instance: InstanceId,
        body: Body,
        timeout: Duration,
    ) -> Result<Body, TransportError> {
        let channel = self
            .channel(instance)
            .ok_or(TransportError::UnknownInstance(instance))?;
        channel.call(body, timeout).await
    }

    pub async fn negotiate(
        &self,
        instance: InstanceId,
        request: NegotiateRequest,
        timeout: Duration,
    ) -> Result<NegotiateResponse, TransportError> {
        match self
            .call_with_timeout(instance, Body::NegotiateRequest(request), timeout)
            .await?
        {
            Body::NegotiateResponse(response) => Ok(response),
            other => Err(unexpected("NegotiateResponse", &other)),
        }
    }

    /// Liveness probe
    pub async fn ping(
        &self,
        instance: InstanceId,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        match self
            .call_with_timeout(instance, Body::PingRequest(PingRequest { nonce }), timeout)
            .await?
        {
            Body::PingResponse(response) if response.nonce == nonce => Ok(()),
            Body::PingResponse(response) => Err(TransportError::Protocol(format!(
                "ping nonce mismatch: sent {nonce}, got {}",
                response.nonce
            ))),
            other => Err(unexpected("PingResponse", &other)),
        }
    }

    pub async fn price(
        &self,
        instance: InstanceId,
        request: PriceRequest,
    ) -> Result<PriceResponse, TransportError> {
        match self.call(instance, Body::PriceRequest(request)).await? {
            Body::PriceResponse(response) => Ok(response),
            other => Err(unexpected("PriceResponse", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Body) -> TransportError {
    TransportError::Protocol(format!("expected {expected}, got {}", got.kind()))
}
