//! Errors raised while talking to the aria2 daemon.

use std::time::Duration;

use haul_core::EngineError;
use thiserror::Error;

/// Result alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Failures raised by the JSON-RPC channel or the daemon launcher.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The WebSocket could not be established.
    #[error("failed to connect to aria2 rpc endpoint")]
    Connect {
        /// Endpoint that was dialled.
        url: String,
        /// Underlying client error.
        #[source]
        source: jsonrpsee::core::ClientError,
    },
    /// The call reached the daemon but failed.
    #[error("aria2 rpc call failed")]
    Call {
        /// RPC method name.
        method: &'static str,
        /// Underlying client error.
        #[source]
        source: jsonrpsee::core::ClientError,
    },
    /// The daemon answered with a JSON-RPC error object.
    #[error("aria2 rejected the call")]
    Daemon {
        /// RPC method name.
        method: &'static str,
        /// Error code from the daemon.
        code: i32,
        /// Error message from the daemon.
        message: String,
    },
    /// The call did not complete within the configured timeout.
    #[error("aria2 rpc call timed out")]
    Timeout {
        /// RPC method name.
        method: &'static str,
    },
    /// The response did not match the expected shape.
    #[error("aria2 rpc response could not be decoded")]
    Decode {
        /// RPC method name.
        method: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// The daemon process could not be spawned.
    #[error("failed to launch aria2 daemon")]
    Launch {
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The daemon never answered the readiness check.
    #[error("aria2 daemon did not become ready")]
    NotReady {
        /// How long readiness was awaited.
        waited: Duration,
    },
}

impl RpcError {
    /// Human-readable detail including the inner cause.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Connect { url, source } => format!("connect {url}: {source}"),
            Self::Call { method, source } => format!("{method}: {source}"),
            Self::Daemon {
                method,
                code,
                message,
            } => format!("{method}: daemon error {code}: {message}"),
            Self::Timeout { method } => format!("{method} timed out"),
            Self::Decode { method, source } => format!("{method}: malformed response: {source}"),
            Self::Launch { source } => format!("launch failed: {source}"),
            Self::NotReady { waited } => {
                format!("daemon not ready after {}s", waited.as_secs())
            }
        }
    }
}

impl From<RpcError> for EngineError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout { method } => Self::Timeout { operation: method },
            RpcError::Daemon {
                method, message, ..
            } => Self::Rejected {
                operation: method,
                message,
            },
            RpcError::Decode { method, .. } => Self::Internal {
                operation: method,
                message: format!("unexpected response shape from {method}"),
            },
            call @ RpcError::Call { method, .. } => Self::Transport {
                operation: method,
                source: Box::new(call),
            },
            other => Self::Transport {
                operation: "aria2",
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_errors_become_rejections() {
        let err: EngineError = RpcError::Daemon {
            method: "aria2.addUri",
            code: 1,
            message: "bad uri".into(),
        }
        .into();
        assert_eq!(err.detail(), "aria2.addUri rejected: bad uri");
    }

    #[test]
    fn timeouts_keep_method_name() {
        let err: EngineError = RpcError::Timeout {
            method: "aria2.tellActive",
        }
        .into();
        assert!(matches!(
            err,
            EngineError::Timeout {
                operation: "aria2.tellActive"
            }
        ));
    }
}
