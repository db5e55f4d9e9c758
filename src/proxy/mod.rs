// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A request-forwarding proxy with a short-lived response cache.
//!
//! The proxy composes a TCP server front-end and one client back-end
//! (TCP or serial). Reads are served from a per-device cache as long as
//! every requested address is younger than the freshness window; writes
//! are forwarded and update the cache on success.

mod cache;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{rtu::RtuClientOptions, tcp::TcpClientOptions, Context},
    frame::{
        Address, Coil, ExceptionCode, Quantity, Request, Response, Word, MAX_READ_BITS,
        MAX_READ_WORDS, MAX_WRITE_BITS, MAX_WRITE_WORDS,
    },
    server::{
        self,
        service::{check_count, check_span},
        RegisterClass, Service,
    },
    slave::Slave,
    Error, Result,
};

use self::cache::ProxyCache;

/// The back-end the proxy forwards to.
#[derive(Debug, Clone)]
pub enum ProxyDestination {
    Tcp(TcpClientOptions),
    Rtu(RtuClientOptions),
}

/// Configuration of a [`Proxy`].
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Address the front-end server listens on (default unspecified).
    pub listen_address: IpAddr,
    /// Port the front-end server listens on (default 502).
    pub listen_port: u16,
    /// The back-end endpoint requests are forwarded to.
    pub destination: ProxyDestination,
    /// Maximum age of cached values served without refetching; values
    /// below 200 ms are clamped up (default 1 s).
    pub freshness_window: Duration,
}

impl ProxySettings {
    #[must_use]
    pub fn new(destination: ProxyDestination) -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 502,
            destination,
            freshness_window: Duration::from_secs(1),
        }
    }
}

/// A running proxy instance.
#[derive(Debug)]
pub struct Proxy {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    backend: Arc<Context>,
}

impl Proxy {
    /// Connect the back-end, bind the front-end and start serving.
    pub async fn start(settings: ProxySettings) -> Result<Self> {
        let backend = match settings.destination {
            ProxyDestination::Tcp(options) => crate::client::tcp::connect(options).await?,
            ProxyDestination::Rtu(options) => crate::client::rtu::connect(options).await?,
        };
        let backend = Arc::new(backend);

        let service = Arc::new(ProxyService {
            backend: Arc::clone(&backend),
            cache: ProxyCache::new(settings.freshness_window),
        });

        let server = server::tcp::Server::bind(SocketAddr::new(
            settings.listen_address,
            settings.listen_port,
        ))
        .await?;
        let local_addr = server.local_addr()?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = server.serve_until(service, signal.cancelled_owned()).await {
                log::error!("Proxy server failed: {err}");
            }
        });

        log::debug!("Proxy listening on {local_addr}");
        Ok(Self {
            local_addr,
            shutdown,
            task,
            backend,
        })
    }

    /// The front-end's locally bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving and disconnect the back-end.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        let _ = self.task.await;
        self.backend.disconnect().await
    }
}

/// The front-end service: cache consult, back-end call on miss.
struct ProxyService {
    backend: Arc<Context>,
    cache: ProxyCache,
}

#[async_trait]
impl Service for ProxyService {
    async fn call(
        &self,
        slave: Slave,
        request: Request,
    ) -> Option<std::result::Result<Response, ExceptionCode>> {
        // The proxy answers for every device id; whether the device
        // exists is the back-end's verdict.
        Some(self.forward(slave, request).await)
    }
}

impl ProxyService {
    async fn forward(
        &self,
        slave: Slave,
        request: Request,
    ) -> std::result::Result<Response, ExceptionCode> {
        use Request::*;
        match request {
            ReadCoils(start, count) => {
                check_count(count, MAX_READ_BITS)?;
                check_span(start, count)?;
                self.read_bits(slave, RegisterClass::Coil, start, count)
                    .await
                    .map(Response::ReadCoils)
            }
            ReadDiscreteInputs(start, count) => {
                check_count(count, MAX_READ_BITS)?;
                check_span(start, count)?;
                self.read_bits(slave, RegisterClass::DiscreteInput, start, count)
                    .await
                    .map(Response::ReadDiscreteInputs)
            }
            ReadHoldingRegisters(start, count) => {
                check_count(count, MAX_READ_WORDS)?;
                check_span(start, count)?;
                self.read_words(slave, RegisterClass::HoldingRegister, start, count)
                    .await
                    .map(Response::ReadHoldingRegisters)
            }
            ReadInputRegisters(start, count) => {
                check_count(count, MAX_READ_WORDS)?;
                check_span(start, count)?;
                self.read_words(slave, RegisterClass::InputRegister, start, count)
                    .await
                    .map(Response::ReadInputRegisters)
            }
            WriteSingleCoil(address, value) => {
                self.backend_call(slave, WriteSingleCoil(address, value))
                    .await?;
                self.cache
                    .store_bits(slave.into(), RegisterClass::Coil, address, &[value]);
                Ok(Response::WriteSingleCoil(address, value))
            }
            WriteSingleRegister(address, value) => {
                self.backend_call(slave, WriteSingleRegister(address, value))
                    .await?;
                self.cache.store_words(
                    slave.into(),
                    RegisterClass::HoldingRegister,
                    address,
                    &[value],
                );
                Ok(Response::WriteSingleRegister(address, value))
            }
            WriteMultipleCoils(start, values) => {
                let count = count_of(&values)?;
                check_count(count, MAX_WRITE_BITS)?;
                check_span(start, count)?;
                self.backend_call(slave, WriteMultipleCoils(start, values.clone()))
                    .await?;
                self.cache
                    .store_bits(slave.into(), RegisterClass::Coil, start, &values);
                Ok(Response::WriteMultipleCoils(start, count))
            }
            WriteMultipleRegisters(start, values) => {
                let count = count_of(&values)?;
                check_count(count, MAX_WRITE_WORDS)?;
                check_span(start, count)?;
                self.backend_call(slave, WriteMultipleRegisters(start, values.clone()))
                    .await?;
                self.cache.store_words(
                    slave.into(),
                    RegisterClass::HoldingRegister,
                    start,
                    &values,
                );
                Ok(Response::WriteMultipleRegisters(start, count))
            }
            // Device identification is forwarded verbatim and never cached.
            request @ ReadDeviceInfo(_, _) => self.backend_call(slave, request).await,
        }
    }

    async fn read_bits(
        &self,
        slave: Slave,
        class: RegisterClass,
        start: Address,
        count: Quantity,
    ) -> std::result::Result<Vec<Coil>, ExceptionCode> {
        let slave_id = slave.into();
        if let Some(values) = self.cache.lookup_bits(slave_id, class, start, count) {
            return Ok(values);
        }

        let device = self.cache.device(slave_id);
        let _fill = device.fill_lock().await;
        // Another session may have refetched while we waited.
        if let Some(values) = self.cache.lookup_bits(slave_id, class, start, count) {
            return Ok(values);
        }

        let request = match class {
            RegisterClass::Coil => Request::ReadCoils(start, count),
            RegisterClass::DiscreteInput => Request::ReadDiscreteInputs(start, count),
            _ => unreachable!("not a bit class"),
        };
        let response = self.backend_call(slave, request).await?;
        let mut values = match response {
            Response::ReadCoils(values) | Response::ReadDiscreteInputs(values) => values,
            _ => return Err(ExceptionCode::SlaveDeviceFailure),
        };
        if values.len() < usize::from(count) {
            return Err(ExceptionCode::SlaveDeviceFailure);
        }
        values.truncate(count.into());
        self.cache.store_bits(slave_id, class, start, &values);
        Ok(values)
    }

    async fn read_words(
        &self,
        slave: Slave,
        class: RegisterClass,
        start: Address,
        count: Quantity,
    ) -> std::result::Result<Vec<Word>, ExceptionCode> {
        let slave_id = slave.into();
        if let Some(values) = self.cache.lookup_words(slave_id, class, start, count) {
            return Ok(values);
        }

        let device = self.cache.device(slave_id);
        let _fill = device.fill_lock().await;
        if let Some(values) = self.cache.lookup_words(slave_id, class, start, count) {
            return Ok(values);
        }

        let request = match class {
            RegisterClass::HoldingRegister => Request::ReadHoldingRegisters(start, count),
            RegisterClass::InputRegister => Request::ReadInputRegisters(start, count),
            _ => unreachable!("not a word class"),
        };
        let response = self.backend_call(slave, request).await?;
        let values = match response {
            Response::ReadHoldingRegisters(values) | Response::ReadInputRegisters(values) => {
                values
            }
            _ => return Err(ExceptionCode::SlaveDeviceFailure),
        };
        if values.len() != usize::from(count) {
            return Err(ExceptionCode::SlaveDeviceFailure);
        }
        self.cache.store_words(slave_id, class, start, &values);
        Ok(values)
    }

    async fn backend_call(
        &self,
        slave: Slave,
        request: Request,
    ) -> std::result::Result<Response, ExceptionCode> {
        match self.backend.call(slave, request).await {
            Ok(response) => Ok(response),
            // The device's own verdict passes through unchanged.
            Err(Error::Exception(exception)) => Err(exception.exception),
            Err(err) => {
                log::warn!("Back-end request for device {slave} failed: {err}");
                Err(ExceptionCode::SlaveDeviceFailure)
            }
        }
    }
}

fn count_of<T>(values: &[T]) -> std::result::Result<Quantity, ExceptionCode> {
    Quantity::try_from(values.len()).map_err(|_| ExceptionCode::IllegalDataValue)
}
