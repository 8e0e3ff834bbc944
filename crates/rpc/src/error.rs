//! Transport, authentication and client error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// Authentication failures at the connection boundary.
///
/// These are answered by rejecting the request or connection and are never
/// propagated as internal faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No credential was supplied.
    #[error("missing credential")]
    MissingCredential,

    /// The authorization header does not carry a bearer token.
    #[error("malformed credential: expected 'Bearer <token>'")]
    MalformedCredential,

    /// The verifier refused the credential.
    #[error("credential rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    /// The remote error message, if the server answered with an error.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::JsonRpc(e) => Some(&e.message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
