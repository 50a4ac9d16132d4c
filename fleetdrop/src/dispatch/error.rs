//! Dispatch error types.

use thiserror::Error;

/// Failures reported by an [`EndpointTransport`](super::EndpointTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint has no live connection.
    #[error("endpoint {0} is not connected")]
    NotConnected(String),

    /// The transport rejected the command immediately.
    #[error("{0}")]
    SendFailed(String),

    /// The command could not be encoded for the wire.
    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// Errors raised by the dispatch layer to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The endpoint identifier failed structural validation.
    #[error("Invalid node identifier: {0}")]
    InvalidEndpoint(String),

    /// A request named no targets.
    #[error("No target devices provided.")]
    NoTargets,

    /// A deploy was requested but no artifact is published.
    #[error("Deployment asset not found on server.")]
    AssetUnavailable,

    /// The artifact download URL could not be built.
    #[error("Unable to derive asset URL.")]
    DownloadUrlUnavailable,

    /// The action name is not recognised.
    #[error("Unsupported action '{0}'")]
    UnsupportedAction(String),

    /// A custom action arrived without a script.
    #[error("Custom action requires a script.")]
    MissingScript,

    /// The dispatch daemon has shut down.
    #[error("dispatch daemon is not running")]
    DaemonStopped,
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
