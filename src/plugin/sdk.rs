//! Plugin-side runtime
//!
//! A pricing plugin implements [`PricingPlugin`] and calls [`serve`] from its
//! `main`. The runtime binds the socket the host passed in, answers the
//! handshake and liveness probes, runs every pricing request on its own task,
//! and exits when the host closes the plugin's stdin.

use crate::plugin::framing::{read_message, write_message};
use crate::plugin::protocol::{
    Envelope, ErrorResponse, NegotiateRequest, NegotiateResponse, PingResponse, PriceRequest,
    PriceResponse, envelope::Body,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Environment variable carrying the socket path the plugin must listen on
pub const SOCKET_ENV: &str = "COSTHOST_PLUGIN_SOCKET";

/// Command-line flag carrying the same path
pub const SOCKET_ARG: &str = "--socket";

/// What a plugin reports about itself during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

impl PluginInfo {
    pub fn new<I, S>(name: &str, version: &str, protocol_version: u32, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            protocol_version,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
pub trait PricingPlugin: Send + Sync + 'static {
    fn info(&self) -> PluginInfo;

    /// Price one resource. Failures are answered with
    /// [`PriceResponse::error`], never by dropping the request.
    async fn price(&self, request: PriceRequest) -> PriceResponse;

    /// Liveness hook, called for every probe before it is answered
    async fn ping(&self) {}
}

/// Run a plugin until the host closes stdin
pub async fn serve<P: PricingPlugin>(plugin: P) -> Result<()> {
    let path = socket_path_from_env()?;
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("Failed to bind plugin socket {}", path.display()))?;

    let info = plugin.info();
    tracing::info!(
        "Starting {} v{} (protocol {}) on {}",
        info.name,
        info.version,
        info.protocol_version,
        path.display()
    );

    let result = serve_listener(listener, Arc::new(plugin), stdin_closed()).await;
    let _ = std::fs::remove_file(&path);
    result
}

/// Socket path from `--socket <path>` or the environment
pub fn socket_path_from_env() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == SOCKET_ARG {
            let value = args.next().context("--socket requires a path")?;
            return Ok(PathBuf::from(value));
        }
        if let Some(value) = arg.strip_prefix("--socket=") {
            return Ok(PathBuf::from(value));
        }
    }

    match std::env::var_os(SOCKET_ENV) {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => bail!("No socket path: pass {SOCKET_ARG} <path> or set {SOCKET_ENV}"),
    }
}

/// Resolves when stdin reaches EOF, which is how the host asks for shutdown
async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Accept connections until `shutdown` resolves. Dropping the returned future
/// tears down every connection it accepted.
pub async fn serve_listener<P, F>(listener: UnixListener, plugin: Arc<P>, shutdown: F) -> Result<()>
where
    P: PricingPlugin,
    F: Future<Output = ()>,
{
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, closing {} connection(s)", connections.len());
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("Failed to accept host connection")?;
                connections.spawn(handle_connection(stream, Arc::clone(&plugin)));
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Ok(Err(err)) = finished {
                    tracing::debug!("Connection ended: {err:#}");
                }
            }
        }
    }

    Ok(())
}

async fn handle_connection<P: PricingPlugin>(stream: UnixStream, plugin: Arc<P>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (responses_tx, mut responses_rx) = mpsc::channel::<Envelope>(64);

    let writer_task = async move {
        while let Some(envelope) = responses_rx.recv().await {
            write_message(&envelope, &mut writer)
                .await
                .context("Failed to write response")?;
        }
        anyhow::Ok(())
    };

    let reader_task = async move {
        let mut requests = JoinSet::new();
        while let Some(envelope) = read_message::<Envelope, _>(&mut reader)
            .await
            .context("Failed to read request")?
        {
            let plugin = Arc::clone(&plugin);
            let responses_tx = responses_tx.clone();
            requests.spawn(async move {
                let body = respond(plugin.as_ref(), envelope.body).await;
                let _ = responses_tx
                    .send(Envelope {
                        call_id: envelope.call_id,
                        body: Some(body),
                    })
                    .await;
            });
            // Reap finished requests so the set does not grow without bound
            while requests.try_join_next().is_some() {}
        }
        // Host hung up; outstanding requests have nobody to answer to
        requests.abort_all();
        anyhow::Ok(())
    };

    tokio::select! {
        result = reader_task => result,
        result = writer_task => result,
    }
}

async fn respond<P: PricingPlugin>(plugin: &P, body: Option<Body>) -> Body {
    match body {
        Some(Body::NegotiateRequest(request)) => {
            Body::NegotiateResponse(negotiate(plugin, &request))
        }
        Some(Body::PingRequest(request)) => {
            plugin.ping().await;
            Body::PingResponse(PingResponse {
                nonce: request.nonce,
            })
        }
        Some(Body::PriceRequest(request)) => Body::PriceResponse(plugin.price(request).await),
        Some(other) => Body::ErrorResponse(ErrorResponse {
            message: format!("unsupported request: {}", other.kind()),
        }),
        None => Body::ErrorResponse(ErrorResponse {
            message: "request without a body".to_string(),
        }),
    }
}

fn negotiate<P: PricingPlugin>(plugin: &P, request: &NegotiateRequest) -> NegotiateResponse {
    let info = plugin.info();
    tracing::debug!(
        "Host {} supports protocol {}..={}, plugin speaks {}",
        request.host_version,
        request.host_min_protocol,
        request.host_max_protocol,
        info.protocol_version
    );
    NegotiateResponse {
        plugin_name: info.name,
        plugin_version: info.version,
        protocol_version: info.protocol_version,
        capabilities: info.capabilities,
    }
}
