// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus server endpoints.

#[cfg(feature = "rtu-server")]
pub mod rtu;

#[cfg(feature = "tcp-server")]
pub mod tcp;

pub(crate) mod service;
mod store;

pub use self::{
    service::{DeviceIdentity, StoreService},
    store::{DeviceStore, RegisterClass, StoreEvent},
};

use async_trait::async_trait;

use crate::{
    frame::{ExceptionCode, Request, Response},
    slave::Slave,
};

/// A Modbus server service.
///
/// Implementations decide per request whether and what to answer; the
/// transport sessions only do the framing.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Process one request addressed to `slave`.
    ///
    /// Returning `None` produces no response at all, e.g. for a device id
    /// this server does not recognize. Returning an [`ExceptionCode`]
    /// produces the matching exception response.
    async fn call(
        &self,
        slave: Slave,
        request: Request,
    ) -> Option<std::result::Result<Response, ExceptionCode>>;

    /// Whether requests addressed to `slave` are answered at all.
    ///
    /// Consulted for requests that are rejected before they reach
    /// [`Service::call`], e.g. with a semantically invalid payload: a
    /// server must stay silent about them unless it serves the device.
    fn accepts(&self, slave: Slave) -> bool {
        let _ = slave;
        true
    }
}
