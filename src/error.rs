// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy shared by the database, the engine and the wire.

use crate::proto;

use std::io;

/// All the ways a locnet operation can fail. Each variant corresponds to a
/// wire status code, so errors survive a protocol round-trip.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed input value (out-of-range coordinate, bad address, ...).
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// The operation is illegal in the current state (unknown id, duplicate
    /// registration, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The underlying connection failed.
    #[error("connection error: {0}")]
    Connection(String),
    /// The peer violated the protocol (bad framing, bad version, request
    /// shape). Terminates the session.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The remote answered with something that is not a valid response to
    /// what was asked. Terminates the session.
    #[error("bad response: {0}")]
    BadResponse(String),
    /// The requested operation is not served on this interface.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// A broken invariant. Terminates the session.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the session this error surfaced on must be closed to avoid
    /// desynchronization.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_) | Error::BadResponse(_) | Error::Connection(_) | Error::Internal(_)
        )
    }

    pub(crate) fn to_status(&self) -> proto::Status {
        match self {
            Error::InvalidValue(_) => proto::Status::ErrorInvalidValue,
            Error::InvalidState(_) => proto::Status::ErrorInvalidState,
            Error::Connection(_) => proto::Status::ErrorConnection,
            Error::BadRequest(_) => proto::Status::ErrorBadRequest,
            Error::BadResponse(_) => proto::Status::ErrorBadResponse,
            Error::Unsupported(_) => proto::Status::ErrorUnsupported,
            Error::Internal(_) => proto::Status::ErrorInternal,
        }
    }

    pub(crate) fn from_status(status: proto::Status, details: String) -> Self {
        match status {
            proto::Status::Ok => Error::Internal("status ok is not an error".into()),
            proto::Status::ErrorBadRequest => Error::BadRequest(details),
            proto::Status::ErrorBadResponse => Error::BadResponse(details),
            proto::Status::ErrorInvalidValue => Error::InvalidValue(details),
            proto::Status::ErrorInvalidState => Error::InvalidState(details),
            proto::Status::ErrorConnection => Error::Connection(details),
            proto::Status::ErrorUnsupported => Error::Unsupported(details),
            proto::Status::ErrorInternal => Error::Internal(details),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Connection(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::BadRequest(format!("error decoding message: {}", e))
    }
}
