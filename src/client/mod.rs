// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus client endpoints.

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "rtu")]
mod rs485;

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    frame::{
        mei::{is_valid_object_id, DeviceInfoCategory, DeviceInfoObjectId},
        Address, Coil, Quantity, Request, Response, Word, MAX_READ_BITS, MAX_READ_WORDS,
        MAX_WRITE_BITS, MAX_WRITE_WORDS,
    },
    slave::Slave,
    Error, Result,
};

/// Connection-state notifications of a client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
}

/// A transport-independent asynchronous client.
#[async_trait]
pub trait Client: Send + Sync {
    /// Establish the connection, retrying with the configured backoff
    /// schedule until the reconnect window is exhausted.
    async fn connect(&self) -> Result<()>;

    /// Close the connection and fail all outstanding requests.
    async fn disconnect(&self) -> Result<()>;

    /// Send one request and await the matching response.
    async fn call(&self, slave: Slave, request: Request) -> Result<Response> {
        self.call_with_cancel(slave, request, CancellationToken::new())
            .await
    }

    /// Send one request and await the matching response, aborting with
    /// [`Error::Cancelled`] when the token fires.
    ///
    /// Cancellation removes the request's waiter but never closes the
    /// connection; bytes already written cannot be unsent.
    async fn call_with_cancel(
        &self,
        slave: Slave,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response>;

    /// Subscribe to connection-state notifications.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}

/// An asynchronous Modbus client context.
///
/// Wraps a transport-specific [`Client`] and offers the typed read/write
/// API of the [`Reader`] and [`Writer`] traits. An optional context-wide
/// cancellation token applies to every call issued through it.
pub struct Context {
    client: Box<dyn Client>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl From<Box<dyn Client>> for Context {
    fn from(client: Box<dyn Client>) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }
}

impl From<Context> for Box<dyn Client> {
    fn from(context: Context) -> Self {
        context.client
    }
}

impl Context {
    /// Replace the context-wide cancellation token.
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Establish the connection.
    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    /// Close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    /// Subscribe to connection-state notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.client.subscribe()
    }

    /// Send a raw request and await the matching response.
    pub async fn call(&self, slave: Slave, request: Request) -> Result<Response> {
        self.client
            .call_with_cancel(slave, request, self.cancel.clone())
            .await
    }

    /// Send a raw request with a per-call cancellation token.
    pub async fn call_with_cancel(
        &self,
        slave: Slave,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response> {
        self.client.call_with_cancel(slave, request, cancel).await
    }
}

/// An asynchronous Modbus reader.
#[async_trait]
pub trait Reader {
    async fn read_coils(&self, slave: Slave, start: Address, count: Quantity)
        -> Result<Vec<Coil>>;

    async fn read_discrete_inputs(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Coil>>;

    async fn read_holding_registers(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Word>>;

    async fn read_input_registers(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Word>>;

    /// Read device-identification objects, transparently following the
    /// more-requests-needed continuation.
    async fn read_device_information(
        &self,
        slave: Slave,
        category: DeviceInfoCategory,
        starting_object: Option<DeviceInfoObjectId>,
    ) -> Result<BTreeMap<DeviceInfoObjectId, String>>;
}

/// An asynchronous Modbus writer.
#[async_trait]
pub trait Writer {
    async fn write_single_coil(&self, slave: Slave, address: Address, value: Coil) -> Result<()>;

    async fn write_single_register(
        &self,
        slave: Slave,
        address: Address,
        value: Word,
    ) -> Result<()>;

    async fn write_multiple_coils(
        &self,
        slave: Slave,
        start: Address,
        values: &[Coil],
    ) -> Result<()>;

    async fn write_multiple_registers(
        &self,
        slave: Slave,
        start: Address,
        values: &[Word],
    ) -> Result<()>;
}

fn unexpected_response(rsp: &Response) -> Error {
    Error::Protocol(format!(
        "unexpected response function {}",
        rsp.function_code()
    ))
}

#[async_trait]
impl Reader for Context {
    async fn read_coils(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Coil>> {
        let rsp = self.call(slave, Request::ReadCoils(start, count)).await?;
        let Response::ReadCoils(mut coils) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if coils.len() < usize::from(count) {
            return Err(Error::Protocol(format!(
                "expected {count} coil(s), received {}",
                coils.len()
            )));
        }
        coils.truncate(count.into());
        Ok(coils)
    }

    async fn read_discrete_inputs(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Coil>> {
        let rsp = self
            .call(slave, Request::ReadDiscreteInputs(start, count))
            .await?;
        let Response::ReadDiscreteInputs(mut inputs) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if inputs.len() < usize::from(count) {
            return Err(Error::Protocol(format!(
                "expected {count} input(s), received {}",
                inputs.len()
            )));
        }
        inputs.truncate(count.into());
        Ok(inputs)
    }

    async fn read_holding_registers(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Word>> {
        let rsp = self
            .call(slave, Request::ReadHoldingRegisters(start, count))
            .await?;
        let Response::ReadHoldingRegisters(words) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if words.len() != usize::from(count) {
            return Err(Error::Protocol(format!(
                "expected {count} register(s), received {}",
                words.len()
            )));
        }
        Ok(words)
    }

    async fn read_input_registers(
        &self,
        slave: Slave,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Word>> {
        let rsp = self
            .call(slave, Request::ReadInputRegisters(start, count))
            .await?;
        let Response::ReadInputRegisters(words) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if words.len() != usize::from(count) {
            return Err(Error::Protocol(format!(
                "expected {count} register(s), received {}",
                words.len()
            )));
        }
        Ok(words)
    }

    async fn read_device_information(
        &self,
        slave: Slave,
        category: DeviceInfoCategory,
        starting_object: Option<DeviceInfoObjectId>,
    ) -> Result<BTreeMap<DeviceInfoObjectId, String>> {
        // An uncooperative device could ping-pong continuations forever.
        const MAX_CONTINUATIONS: usize = 16;

        let mut objects = BTreeMap::new();
        let mut next = starting_object.unwrap_or_default();
        for _ in 0..MAX_CONTINUATIONS {
            let rsp = self
                .call(slave, Request::ReadDeviceInfo(category, next))
                .await?;
            let Response::ReadDeviceInfo(info) = rsp else {
                return Err(unexpected_response(&rsp));
            };
            for obj in &info.objects {
                objects.insert(obj.id, obj.to_string_lossy());
            }
            if !info.more_follows || category == DeviceInfoCategory::Individual {
                return Ok(objects);
            }
            next = info.next_object_id;
        }
        Err(Error::Protocol(
            "device identification does not converge".to_string(),
        ))
    }
}

#[async_trait]
impl Writer for Context {
    async fn write_single_coil(&self, slave: Slave, address: Address, value: Coil) -> Result<()> {
        let rsp = self
            .call(slave, Request::WriteSingleCoil(address, value))
            .await?;
        let Response::WriteSingleCoil(rsp_address, rsp_value) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if rsp_address != address || rsp_value != value {
            return Err(Error::Protocol("write echo mismatch".to_string()));
        }
        Ok(())
    }

    async fn write_single_register(
        &self,
        slave: Slave,
        address: Address,
        value: Word,
    ) -> Result<()> {
        let rsp = self
            .call(slave, Request::WriteSingleRegister(address, value))
            .await?;
        let Response::WriteSingleRegister(rsp_address, rsp_value) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if rsp_address != address || rsp_value != value {
            return Err(Error::Protocol("write echo mismatch".to_string()));
        }
        Ok(())
    }

    async fn write_multiple_coils(
        &self,
        slave: Slave,
        start: Address,
        values: &[Coil],
    ) -> Result<()> {
        let count = values.len();
        let rsp = self
            .call(slave, Request::WriteMultipleCoils(start, values.to_vec()))
            .await?;
        let Response::WriteMultipleCoils(rsp_start, rsp_count) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if rsp_start != start || usize::from(rsp_count) != count {
            return Err(Error::Protocol("write echo mismatch".to_string()));
        }
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        slave: Slave,
        start: Address,
        values: &[Word],
    ) -> Result<()> {
        let count = values.len();
        let rsp = self
            .call(slave, Request::WriteMultipleRegisters(start, values.to_vec()))
            .await?;
        let Response::WriteMultipleRegisters(rsp_start, rsp_count) = rsp else {
            return Err(unexpected_response(&rsp));
        };
        if rsp_start != start || usize::from(rsp_count) != count {
            return Err(Error::Protocol("write echo mismatch".to_string()));
        }
        Ok(())
    }
}

/// Unwrap a response PDU, verifying it answers the request's function.
pub(crate) fn response_from_pdu(
    function: crate::frame::FunctionCode,
    pdu: crate::frame::ResponsePdu,
) -> Result<Response> {
    match pdu {
        crate::frame::ResponsePdu(Ok(response)) => {
            if response.function_code() != function {
                return Err(Error::Protocol(format!(
                    "response function {} does not match request function {function}",
                    response.function_code()
                )));
            }
            Ok(response)
        }
        crate::frame::ResponsePdu(Err(exception)) => Err(Error::Exception(exception)),
    }
}

/// Validate a request before any bytes hit the wire.
pub(crate) fn validate_request(request: &Request) -> Result<()> {
    use Request::*;

    fn check_count(count: Quantity, max: Quantity, what: &str) -> Result<()> {
        if count == 0 || count > max {
            return Err(Error::InvalidArgument(format!(
                "{what} count must be in 1..={max}, got {count}"
            )));
        }
        Ok(())
    }

    fn check_span(start: Address, count: Quantity) -> Result<()> {
        if u32::from(start) + u32::from(count) > 0x1_0000 {
            return Err(Error::InvalidArgument(format!(
                "address span {start}+{count} exceeds the address space"
            )));
        }
        Ok(())
    }

    fn len_as_count(len: usize, what: &str) -> Result<Quantity> {
        Quantity::try_from(len)
            .map_err(|_| Error::InvalidArgument(format!("too many {what}: {len}")))
    }

    match request {
        ReadCoils(start, count) | ReadDiscreteInputs(start, count) => {
            check_count(*count, MAX_READ_BITS, "read bit")?;
            check_span(*start, *count)
        }
        ReadHoldingRegisters(start, count) | ReadInputRegisters(start, count) => {
            check_count(*count, MAX_READ_WORDS, "read register")?;
            check_span(*start, *count)
        }
        WriteSingleCoil(_, _) | WriteSingleRegister(_, _) => Ok(()),
        WriteMultipleCoils(start, values) => {
            let count = len_as_count(values.len(), "coils")?;
            check_count(count, MAX_WRITE_BITS, "write coil")?;
            check_span(*start, count)
        }
        WriteMultipleRegisters(start, values) => {
            let count = len_as_count(values.len(), "registers")?;
            check_count(count, MAX_WRITE_WORDS, "write register")?;
            check_span(*start, count)
        }
        ReadDeviceInfo(_, object_id) => {
            if !is_valid_object_id(*object_id) {
                return Err(Error::InvalidArgument(format!(
                    "reserved device identification object id: 0x{object_id:0>2X}"
                )));
            }
            Ok(())
        }
    }
}

/// Backoff schedule shared by both transports: per-attempt timeout
/// starting at 2 s and growing by 2 s up to a cap, a fixed delay between
/// attempts, bounded in total by the reconnect window.
#[derive(Debug)]
pub(crate) struct ReconnectSchedule {
    attempt_timeout: Duration,
    max_attempt_timeout: Duration,
    window: Option<Duration>,
    started: Instant,
}

impl ReconnectSchedule {
    pub(crate) const INITIAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
    pub(crate) const ATTEMPT_TIMEOUT_STEP: Duration = Duration::from_secs(2);
    pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(1);

    pub(crate) fn new(max_attempt_timeout: Duration, window: Option<Duration>) -> Self {
        Self {
            attempt_timeout: Self::INITIAL_ATTEMPT_TIMEOUT,
            max_attempt_timeout,
            window,
            started: Instant::now(),
        }
    }

    /// The timeout to apply to the next connect attempt.
    pub(crate) fn next_attempt_timeout(&mut self) -> Duration {
        let timeout = self.attempt_timeout;
        self.attempt_timeout =
            (timeout + Self::ATTEMPT_TIMEOUT_STEP).min(self.max_attempt_timeout);
        timeout.min(self.max_attempt_timeout)
    }

    /// `true` once the total elapsed time exceeds the reconnect window.
    pub(crate) fn expired(&self) -> bool {
        self.window
            .is_some_and(|window| self.started.elapsed() > window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_validation() {
        assert!(validate_request(&Request::ReadCoils(0, 1)).is_ok());
        assert!(validate_request(&Request::ReadCoils(0, 2000)).is_ok());
        assert!(validate_request(&Request::ReadCoils(0, 0)).is_err());
        assert!(validate_request(&Request::ReadCoils(0, 2001)).is_err());
        assert!(validate_request(&Request::ReadHoldingRegisters(0, 126)).is_err());
        assert!(validate_request(&Request::ReadHoldingRegisters(0xFFFF, 1)).is_ok());
        assert!(validate_request(&Request::ReadHoldingRegisters(0xFFFF, 2)).is_err());
        assert!(validate_request(&Request::WriteMultipleCoils(0, vec![false; 1968])).is_ok());
        assert!(validate_request(&Request::WriteMultipleCoils(0, vec![false; 1969])).is_err());
        assert!(validate_request(&Request::WriteMultipleRegisters(0, vec![0; 123])).is_ok());
        assert!(validate_request(&Request::WriteMultipleRegisters(0, vec![])).is_err());
        assert!(validate_request(&Request::ReadDeviceInfo(
            DeviceInfoCategory::Individual,
            0x42
        ))
        .is_err());
        assert!(validate_request(&Request::ReadDeviceInfo(
            DeviceInfoCategory::Basic,
            0x00
        ))
        .is_ok());
    }

    #[test]
    fn reconnect_schedule_grows_to_cap() {
        let mut schedule =
            ReconnectSchedule::new(Duration::from_secs(5), Some(Duration::from_secs(60)));
        assert_eq!(schedule.next_attempt_timeout(), Duration::from_secs(2));
        assert_eq!(schedule.next_attempt_timeout(), Duration::from_secs(4));
        assert_eq!(schedule.next_attempt_timeout(), Duration::from_secs(5));
        assert_eq!(schedule.next_attempt_timeout(), Duration::from_secs(5));
        assert!(!schedule.expired());
    }

    #[test]
    fn infinite_window_never_expires() {
        let schedule = ReconnectSchedule::new(Duration::from_secs(30), None);
        assert!(!schedule.expired());
    }
}
