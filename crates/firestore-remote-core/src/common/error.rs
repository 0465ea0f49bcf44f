//! Error types for the remote transport.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure of the transport: token acquisition,
//! RPC statuses, undecodable responses and shutdown. It implements
//! `From<Error>` for `tonic::Status` so that stream delegates always receive a
//! gRPC status, and `From<tonic::Status>` for `Error` so that unary callers
//! always receive an `Error`.
//!
//! ## Error Cases
//! - `ChannelError`: An internal communication failure between the worker
//!   queue, the completion queue and the network tasks.
//! - `Rpc`: The server (or the transport) finished a call with a non-ok
//!   status.
//! - `Credentials`: The credentials provider could not produce a token.
//! - `Decode` / `InvalidResponse`: The server sent something we cannot use.
//! - `InvalidArgument`: The caller handed us malformed input.
//! - `Transport`: The channel could not be constructed.
//! - `Cancelled`: The call was cancelled, typically by shutdown.
//! - `ServiceShutdown`: Work arrived after shutdown.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the remote transport.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed queue).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A call finished with a non-ok gRPC status.
    #[error("RPC failed ({code:?}): {message}")]
    Rpc { code: Code, message: String },

    /// The credentials provider failed to produce a token.
    #[error("Credentials error: {reason}")]
    Credentials { reason: String },

    /// A wire message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A wire message decoded but violates the protocol.
    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// The caller supplied invalid input.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The underlying channel could not be built.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// The call was cancelled before it completed.
    #[error("Request cancelled")]
    Cancelled,

    /// The datastore is in the process of shutting down.
    #[error("Datastore is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// The gRPC code this error is reported as.
    pub fn code(&self) -> Code {
        match self {
            Error::ChannelError { .. } => Code::Internal,
            Error::Rpc { code, .. } => *code,
            Error::Credentials { .. } => Code::Unauthenticated,
            Error::Decode(_) | Error::InvalidResponse { .. } => Code::Internal,
            Error::InvalidArgument { .. } => Code::InvalidArgument,
            Error::Transport { .. } => Code::Unavailable,
            Error::Cancelled => Code::Cancelled,
            Error::ServiceShutdown => Code::Unavailable,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Cancelled => Error::Cancelled,
            code => Error::Rpc {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::Rpc { code, message } => Status::new(code, message),
            Error::Credentials { reason } => Status::unauthenticated(reason),
            Error::Decode(e) => Status::internal(format!("Decode error: {}", e)),
            Error::InvalidResponse { reason } => {
                Status::internal(format!("Invalid response: {}", reason))
            }
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::Transport { context } => Status::unavailable(context),
            Error::Cancelled => Status::cancelled("Request was cancelled"),
            Error::ServiceShutdown => Status::unavailable("Datastore is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_status_becomes_cancelled_error() {
        let err = Error::from(Status::cancelled("gone"));
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[test]
    fn rpc_status_keeps_code_and_message() {
        let err = Error::from(Status::permission_denied("nope"));
        match &err {
            Error::Rpc { code, message } => {
                assert_eq!(*code, Code::PermissionDenied);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let status = Status::from(err);
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), "nope");
    }

    #[test]
    fn credentials_error_reports_unauthenticated() {
        let status = Status::from(Error::Credentials {
            reason: "expired".to_string(),
        });
        assert_eq!(status.code(), Code::Unauthenticated);
    }
}
