// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;

use crate::slave::SlaveId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) slave_id: SlaveId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestAdu {
    pub(crate) hdr: Header,
    pub(crate) pdu: RequestPdu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseAdu {
    pub(crate) hdr: Header,
    pub(crate) pdu: ResponsePdu,
}

/// A request frame as decoded on the server side.
///
/// A semantic violation inside an otherwise well-framed request (e.g. a
/// coil value that is neither `0x0000` nor `0xFF00`) is carried as a
/// ready-made exception so the session can answer it without losing the
/// frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestFrame {
    pub(crate) hdr: Header,
    pub(crate) pdu: Result<RequestPdu, ExceptionResponse>,
}
