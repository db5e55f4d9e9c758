// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU client transport
//!
//! The serial bus is half-duplex and strictly request/response: every
//! call takes the send mutex, writes its frame and synchronously awaits
//! the answer before the next call may begin. Reconnecting follows the
//! same backoff schedule as the TCP transport. On Linux the RS-485
//! driver-enable handling of the kernel can be switched on per port.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{sink::SinkExt as _, stream::StreamExt as _};
use tokio::{
    sync::{broadcast, Mutex},
    time::{sleep, timeout, timeout_at},
};
use tokio_serial::SerialStream;
use tokio_util::{codec::Framed, sync::CancellationToken};

pub use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

use crate::{
    client::{
        response_from_pdu, rs485, validate_request, Client, ClientEvent, Context,
        ReconnectSchedule,
    },
    codec,
    frame::{
        rtu::{Header, RequestAdu, ResponseAdu},
        Request, Response,
    },
    slave::Slave,
    Error, Result,
};

const EVENT_CHANNEL_CAPACITY: usize = 16;

const MIN_BAUD_RATE: u32 = 2400;
const MAX_BAUD_RATE: u32 = 115_200;

/// Configuration of an [`RtuClient`].
#[derive(Debug, Clone)]
pub struct RtuClientOptions {
    /// Path of the serial interface, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port_name: String,
    /// Baud rate, 2400 through 115200.
    pub baud_rate: u32,
    /// Number of data bits (default 8).
    pub data_bits: DataBits,
    /// Parity (default none).
    pub parity: Parity,
    /// Number of stop bits (default 1).
    pub stop_bits: StopBits,
    /// Flow control handshake (default none).
    pub flow_control: FlowControl,
    /// Bound on writing one request frame (default 1 s).
    pub send_timeout: Duration,
    /// Bound on the wait for the response (default 1 s).
    pub receive_timeout: Duration,
    /// Total time budget for (re)opening the port; `None` retries forever.
    pub reconnect_window: Option<Duration>,
    /// Let the kernel toggle the RS-485 driver-enable line (Linux only,
    /// ignored elsewhere).
    pub driver_enable_rs485: bool,
}

impl RtuClientOptions {
    #[must_use]
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            send_timeout: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            reconnect_window: None,
            driver_enable_rs485: false,
        }
    }
}

/// Open the serial port and wrap the transport in a [`Context`].
pub async fn connect(options: RtuClientOptions) -> Result<Context> {
    let client = RtuClient::new(options);
    Client::connect(&client).await?;
    Ok(Context::from(Box::new(client) as Box<dyn Client>))
}

/// Modbus RTU client transport.
#[derive(Debug, Clone)]
pub struct RtuClient {
    inner: Arc<Inner>,
}

impl RtuClient {
    #[must_use]
    pub fn new(options: RtuClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                port: Mutex::new(None),
                events,
                closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration this client was created with.
    #[must_use]
    pub fn options(&self) -> &RtuClientOptions {
        &self.inner.options
    }
}

#[async_trait]
impl Client for RtuClient {
    async fn connect(&self) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connect_with_backoff().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.teardown(false).await;
        Ok(())
    }

    async fn call_with_cancel(
        &self,
        slave: Slave,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response> {
        self.inner.call(slave, request, cancel).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }
}

#[derive(Debug)]
struct Port {
    framed: Framed<SerialStream, codec::rtu::ClientCodec>,
    rs485: Option<rs485::DriverState>,
}

#[derive(Debug)]
struct Inner {
    options: RtuClientOptions,
    /// Also the send mutex: holding it serializes bus transactions.
    port: Mutex<Option<Port>>,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect_with_backoff(self: &Arc<Self>) -> Result<()> {
        let mut schedule = ReconnectSchedule::new(
            // Opening a serial port fails fast; the growing attempt
            // timeout of the schedule does not apply here.
            Duration::ZERO,
            self.options.reconnect_window,
        );
        loop {
            match self.try_open().await {
                Ok(()) => return Ok(()),
                // Retrying cannot fix a bad configuration.
                Err(err @ Error::InvalidArgument(_)) => return Err(err),
                Err(err) => {
                    if self.is_closed() {
                        return Err(Error::Disconnected);
                    }
                    if schedule.expired() {
                        log::warn!("Giving up opening {}: {err}", self.options.port_name);
                        return Err(err);
                    }
                    log::debug!("Opening {} failed: {err}", self.options.port_name);
                    sleep(ReconnectSchedule::RETRY_DELAY).await;
                }
            }
        }
    }

    async fn try_open(self: &Arc<Self>) -> Result<()> {
        let mut port = self.port.lock().await;
        if port.is_some() {
            return Ok(());
        }

        let serial = open_serial(&self.options)?;
        let rs485 = if self.options.driver_enable_rs485 {
            Some(rs485::enable_driver(&serial).map_err(Error::Transport)?)
        } else {
            None
        };
        *port = Some(Port {
            framed: Framed::new(serial, codec::rtu::ClientCodec::default()),
            rs485,
        });
        drop(port);
        log::debug!("Opened serial port {}", self.options.port_name);
        let _ = self.events.send(ClientEvent::Connected);
        Ok(())
    }

    /// Close the port, restore the RS-485 state and optionally kick off a
    /// background reconnect.
    async fn teardown(self: &Arc<Self>, reconnect: bool) {
        let Some(port) = self.port.lock().await.take() else {
            return;
        };
        if let Some(state) = port.rs485 {
            let serial = port.framed.into_inner();
            if let Err(err) = rs485::disable_driver(&serial, state) {
                log::debug!("Failed to restore the RS-485 configuration: {err}");
            }
        }
        let _ = self.events.send(ClientEvent::Disconnected);

        if reconnect && !self.is_closed() && !self.reconnecting.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let result = inner.connect_with_backoff().await;
                inner.reconnecting.store(false, Ordering::SeqCst);
                if let Err(err) = result {
                    log::warn!("Reconnect failed: {err}");
                }
            });
        }
    }

    async fn call(
        self: &Arc<Self>,
        slave: Slave,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response> {
        if !slave.is_single_device() {
            return Err(Error::InvalidArgument(format!(
                "serial bus device id must be 1..=247, got {slave}"
            )));
        }
        validate_request(&request)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut guard = self.port.lock().await;
        let Some(port) = guard.as_mut() else {
            return Err(Error::Disconnected);
        };

        let result = exchange(port, &self.options, slave, request, &cancel).await;
        drop(guard);

        match result {
            Ok(response) => Ok(response),
            Err(CallError { error, drop_port }) => {
                if drop_port {
                    self.teardown(true).await;
                }
                Err(error)
            }
        }
    }
}

struct CallError {
    error: Error,
    /// Whether the port is in an unusable state and must be reopened.
    drop_port: bool,
}

fn fatal(error: Error) -> CallError {
    CallError {
        error,
        drop_port: true,
    }
}

fn recoverable(error: Error) -> CallError {
    CallError {
        error,
        drop_port: false,
    }
}

/// One bus transaction: write the request, then synchronously read frames
/// until the response of the addressed device arrives or the receive
/// timeout strikes.
async fn exchange(
    port: &mut Port,
    options: &RtuClientOptions,
    slave: Slave,
    request: Request,
    cancel: &CancellationToken,
) -> std::result::Result<Response, CallError> {
    let function = request.function_code();
    let slave_id = slave.into();

    // Discard stale bytes of an earlier timed-out or cancelled call
    // before starting a new transaction.
    port.framed.read_buffer_mut().clear();

    let adu = RequestAdu {
        hdr: Header { slave_id },
        pdu: request.into(),
    };
    // The outcome is bound first so the racing futures and their borrow
    // of the port are gone before the buffers are touched.
    let sent = tokio::select! {
        () = cancel.cancelled() => None,
        result = timeout(options.send_timeout, port.framed.send(adu)) => Some(result),
    };
    match sent {
        None => {
            // Drop whatever of the frame has not been flushed yet; bytes
            // already on the bus are resolved by the peers' CRC checks.
            port.framed.write_buffer_mut().clear();
            return Err(recoverable(Error::Cancelled));
        }
        Some(Err(_)) => return Err(fatal(Error::Timeout)),
        Some(Ok(Err(err))) => return Err(fatal(Error::Transport(err))),
        Some(Ok(Ok(()))) => {}
    }

    let deadline = tokio::time::Instant::now() + options.receive_timeout;
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => None,
            result = timeout_at(deadline, port.framed.next()) => Some(result),
        };
        let item = match received {
            None => {
                port.framed.read_buffer_mut().clear();
                return Err(recoverable(Error::Cancelled));
            }
            Some(Err(_)) => {
                port.framed.read_buffer_mut().clear();
                return Err(recoverable(Error::Timeout));
            }
            Some(Ok(item)) => item,
        };

        match item {
            None => return Err(fatal(Error::Disconnected)),
            Some(Err(err)) => {
                port.framed.read_buffer_mut().clear();
                return Err(recoverable(Error::from_decode(err)));
            }
            Some(Ok(ResponseAdu { hdr, pdu })) => {
                if hdr.slave_id != slave_id {
                    log::warn!(
                        "Discarding response of device {} while waiting for {}",
                        hdr.slave_id,
                        slave_id
                    );
                    continue;
                }
                return response_from_pdu(function, pdu).map_err(recoverable);
            }
        }
    }
}

fn open_serial(options: &RtuClientOptions) -> Result<SerialStream> {
    if !(MIN_BAUD_RATE..=MAX_BAUD_RATE).contains(&options.baud_rate) {
        return Err(Error::InvalidArgument(format!(
            "baud rate must be in {MIN_BAUD_RATE}..={MAX_BAUD_RATE}, got {}",
            options.baud_rate
        )));
    }
    let builder = tokio_serial::new(&options.port_name, options.baud_rate)
        .data_bits(options.data_bits)
        .parity(options.parity)
        .stop_bits(options.stop_bits)
        .flow_control(options.flow_control);
    SerialStream::open(&builder).map_err(|err| Error::Transport(err.into()))
}
