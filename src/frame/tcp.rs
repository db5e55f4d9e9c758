// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;

/// Correlates a response with its request on a single connection.
pub(crate) type TransactionId = u16;

/// Selects the target device behind the connection endpoint.
pub(crate) type UnitId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) transaction_id: TransactionId,
    pub(crate) unit_id: UnitId,
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
/// A semantic violation inside an otherwise well-framed request is carried
/// as a ready-made exception so the session can answer it without closing
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestFrame {
    pub(crate) hdr: Header,
    pub(crate) pdu: Result<RequestPdu, ExceptionResponse>,
}
