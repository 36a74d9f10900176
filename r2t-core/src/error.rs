//! Tunnel-local and controller-local error types — spec.md §7's layers 2 and 3. Neither type is
//! ever propagated past the handler that produces it: a `TunnelError` becomes a CONN/BIND answer
//! or a CLOSE, a `ControllerError` just closes the offending controller connection.

use r2t_proto::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("hostname resolution failed: {0}")]
    Resolve(#[source] std::io::Error),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("local I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl TunnelError {
    /// Maps this failure onto the wire error code reported in the CONN/BIND answer.
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Connect(e) => ErrorCode::from_connect_error(e),
            TunnelError::Resolve(_) => ErrorCode::ResolveFailed,
            TunnelError::Spawn(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            TunnelError::Spawn(_) => ErrorCode::Generic,
            TunnelError::Io(_) => ErrorCode::Generic,
        }
    }
}

/// A bad line from a controller client (spec.md §4.7, §7 layer 3).
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("empty command line")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(char),

    #[error("expected {expected} arguments, got {got}")]
    WrongArgCount { expected: usize, got: usize },

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
