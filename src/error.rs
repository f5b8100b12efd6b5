use thiserror::Error;

use crate::phase::Phase;

/// Failures surfaced by the RPC transport layer.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The socket closed before (or while) the call completed.
    #[error("transport closed")]
    TransportClosed,

    /// The peer sent bytes we could not decode as a MessagePack-RPC frame.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer answered the call with an error payload.
    #[error("remote error: {0}")]
    Remote(rmpv::Value),
}

impl RpcError {
    /// True when the remote error payload is the "No plugin instance"
    /// sentinel a plugin server emits after dropping an instance.
    pub fn is_no_instance(&self) -> bool {
        match self {
            RpcError::Remote(payload) => payload
                .as_str()
                .map(|s| s.starts_with("No plugin instance"))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Errors a host operation can return to the embedding gateway.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("external plugin config: {0}")]
    Config(String),

    #[error("plugin '{0}' is already registered by another server")]
    DuplicatePlugin(String),

    #[error("info command for server '{server}' failed: {reason}")]
    InfoCmd { server: String, reason: String },

    #[error("could not spawn plugin server '{server}': {source}")]
    Spawn {
        server: String,
        source: std::io::Error,
    },

    #[error("no connection to plugin server '{0}'")]
    NotConnected(String),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("plugin '{plugin}' does not handle the '{phase}' phase")]
    PhaseNotSupported { plugin: String, phase: Phase },

    #[error("could not start instance of '{plugin}': {source}")]
    StartFailed {
        plugin: String,
        #[source]
        source: RpcError,
    },

    #[error("unexpected payload from plugin server: {0}")]
    Protocol(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl HostError {
    /// True when the underlying failure is the "No plugin instance"
    /// sentinel, regardless of which layer wrapped it.
    pub fn is_no_instance(&self) -> bool {
        match self {
            HostError::Rpc(e) => e.is_no_instance(),
            HostError::StartFailed { source, .. } => source.is_no_instance(),
            _ => false,
        }
    }
}
