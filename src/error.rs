//! Error types for the plugin host

use crate::host::InstanceId;
use crate::plugin::framing::FrameError;
use miette::Diagnostic;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration and registry problems. These are operator errors and are
/// rendered through miette by the CLI.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read {}", path.display())]
    #[diagnostic(code(costhost::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    #[diagnostic(
        code(costhost::config::parse),
        help("Check the file against the documented YAML layout")
    )]
    Parse { path: PathBuf, message: String },

    #[error("invalid host configuration: {0}")]
    #[diagnostic(code(costhost::config::invalid))]
    Invalid(String),

    #[error("plugin registry entry '{plugin}' is invalid: {reason}")]
    #[diagnostic(code(costhost::registry::entry))]
    InvalidEntry {
        plugin: String,
        reason: String,
        #[help]
        help: String,
    },

    #[error("plugin '{0}' is registered more than once")]
    #[diagnostic(
        code(costhost::registry::duplicate),
        help("Plugin names must be unique within one registry")
    )]
    DuplicatePlugin(String),
}

/// Failures of a single call on an RPC channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel failure: {0}")]
    ChannelFailure(String),

    #[error("could not connect to plugin endpoint: {0}")]
    Connect(String),

    #[error("no channel is open for instance {0}")]
    UnknownInstance(InstanceId),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Worth trying again on the same or another instance
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::ChannelFailure(_)
                | TransportError::Connect(_)
        )
    }
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Decode(e) => TransportError::Protocol(e.to_string()),
            FrameError::TooLarge(n) => TransportError::Protocol(format!("frame of {n} bytes")),
            other => TransportError::ChannelFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("plugin speaks protocol {plugin}, host supports {min}..={max}")]
    Incompatible { plugin: u32, min: u32, max: u32 },

    #[error("plugin advertises no capability overlapping its registry declaration")]
    NoSharedCapabilities,

    #[error("plugin advertised an invalid capability: {0}")]
    InvalidCapability(String),

    #[error("negotiation transport failure: {0}")]
    Transport(TransportError),
}

impl NegotiationError {
    /// Version and capability mismatches are permanent for the instance
    pub fn is_incompatible(&self) -> bool {
        matches!(
            self,
            NegotiationError::Incompatible { .. }
                | NegotiationError::NoSharedCapabilities
                | NegotiationError::InvalidCapability(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to launch plugin '{plugin}': {reason}")]
    LaunchFailure { plugin: String, reason: String },

    #[error("plugin '{plugin}' failed negotiation: {source}")]
    Negotiation {
        plugin: String,
        #[source]
        source: NegotiationError,
    },

    #[error("plugin '{plugin}' exceeded its restart cap of {cap}")]
    RestartCapExceeded { plugin: String, cap: u32 },

    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("invalid cost request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("plugin host is shut down")]
    ShutDown,
}
