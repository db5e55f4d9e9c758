// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common imports for working with this library.

pub use crate::{
    client::{Client as _, Reader as _, Writer as _},
    client::{ClientEvent, Context},
    slave::{Slave, SlaveId},
    Address, Coil, Error, ExceptionCode, FunctionCode, Quantity, Request, Response, Result,
    Word,
};

#[cfg(feature = "rtu")]
pub use crate::client::rtu;

#[cfg(feature = "tcp")]
pub use crate::client::tcp;

#[cfg(feature = "server")]
pub use crate::server::{self, DeviceStore, StoreService};

#[cfg(feature = "proxy")]
pub use crate::proxy::{Proxy, ProxyDestination, ProxySettings};
