// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library error type

use thiserror::Error;

use crate::frame::ExceptionResponse;

/// A specialized [`Result`](std::result::Result) type for Modbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Modbus errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The received bytes could not be framed: CRC mismatch, truncated or
    /// overlong PDU, or an unknown function code in a decoded payload.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// A well-formed frame carried a semantically invalid field.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote device answered with a Modbus exception.
    #[error(transparent)]
    Exception(#[from] ExceptionResponse),

    /// No response within the receive timeout, the request could not be
    /// written within the send timeout, or a lock acquisition timed out.
    #[error("operation timed out")]
    Timeout,

    /// The connection was closed or failed; outstanding requests are
    /// resolved with this error.
    #[error("not connected")]
    Disconnected,

    /// The caller-provided cancellation signal was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// An out-of-range address, count, or device id was detected before
    /// transmission.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// General I/O error on the underlying transport.
    #[error(transparent)]
    Transport(#[from] std::io::Error),
}

impl Error {
    /// Classify an I/O error raised while decoding incoming bytes.
    ///
    /// Codecs report malformed frames as `InvalidData`; everything else is
    /// a transport failure.
    pub(crate) fn from_decode(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::InvalidData {
            Error::BadFrame(err.to_string())
        } else {
            Error::Transport(err)
        }
    }
}
