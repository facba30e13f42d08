use std::io;

use thiserror::Error;

use crate::packet::ErrorCode;

/// Wire decoding and request encoding failures.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u16),
    #[error("missing string terminator")]
    MissingTerminator,
    #[error("invalid string encoding")]
    InvalidEncoding,
    #[error("empty filename")]
    EmptyFilename,
    #[error("request does not fit in {max} bytes")]
    RequestTooLarge { max: usize },
    #[error("unknown mode: {0}")]
    UnknownMode(String),
}

/// Failure of a dispatcher operation, delivered through its completion.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The operation was cancelled before it completed.
    #[error("operation canceled")]
    Canceled,
    /// A cancel targeted an operation that had already completed.
    #[error("operation not found")]
    NotFound,
    #[error("unknown socket handle")]
    UnknownSocket,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DispatchError {
    /// Completions a session receives as a side effect of its own cancels.
    pub fn is_benign(&self) -> bool {
        matches!(self, DispatchError::Canceled | DispatchError::NotFound)
    }
}

/// The error that ended a server session: sent to the peer, received from
/// it, or local.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {message}")]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure of a client transfer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server error {code}: {message}")]
    Remote { code: u16, message: String },
    #[error("timeout after {retries} retransmits")]
    Timeout { retries: u32 },
    #[error("server acknowledged options that were not requested")]
    InvalidOptions,
    #[error("transfer size mismatch: announced {announced} bytes, received {received}")]
    SizeMismatch { announced: u64, received: u64 },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A failed client request. The hint is set when the failure was the first
/// reply to a request carrying options, so a plain retry may succeed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RequestFailure {
    pub error: ClientError,
    pub server_may_not_support_options: bool,
}

impl From<ClientError> for RequestFailure {
    fn from(error: ClientError) -> Self {
        Self {
            error,
            server_may_not_support_options: false,
        }
    }
}

impl From<io::Error> for RequestFailure {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err).into()
    }
}

impl From<PacketError> for RequestFailure {
    fn from(err: PacketError) -> Self {
        ClientError::Packet(err).into()
    }
}
