// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU server

use std::{future::Future, io, path::Path, sync::Arc};

use futures_util::{sink::SinkExt as _, stream::StreamExt as _};
use tokio_serial::SerialStream;
use tokio_util::codec::Framed;

use crate::{
    codec,
    frame::{
        rtu::{RequestFrame, ResponseAdu},
        ExceptionResponse, Request, ResponsePdu,
    },
    server::Service,
    slave::Slave,
};

/// Serves requests arriving on one serial port.
///
/// The bus is half-duplex: one frame is decoded, dispatched and answered
/// at a time. Malformed frames are dropped since they cannot be
/// correlated; requests for device ids the service does not accept are
/// silently ignored as bus discipline demands.
#[derive(Debug)]
pub struct Server {
    serial: SerialStream,
}

impl Server {
    /// Set up a server on a pre-configured serial stream.
    #[must_use]
    pub fn new(serial: SerialStream) -> Self {
        Self { serial }
    }

    /// Set up a server from an interface path and baud rate.
    pub fn new_from_path<P: AsRef<Path>>(path: P, baud_rate: u32) -> io::Result<Self> {
        let builder = tokio_serial::new(path.as_ref().to_string_lossy(), baud_rate);
        let serial = SerialStream::open(&builder)?;
        Ok(Self { serial })
    }

    /// Serve requests until the serial stream fails.
    pub async fn serve<S>(self, service: Arc<S>) -> io::Result<()>
    where
        S: Service,
    {
        process(Framed::new(self.serial, codec::rtu::ServerCodec::default()), service).await
    }

    /// Serve requests until the given shutdown signal resolves.
    pub async fn serve_until<S, Sd>(self, service: Arc<S>, shutdown_signal: Sd) -> io::Result<()>
    where
        S: Service,
        Sd: Future<Output = ()> + Send,
    {
        tokio::select! {
            res = self.serve(service) => res,
            () = shutdown_signal => {
                log::debug!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

async fn process<S>(
    mut framed: Framed<SerialStream, codec::rtu::ServerCodec>,
    service: Arc<S>,
) -> io::Result<()>
where
    S: Service,
{
    loop {
        let frame = match framed.next().await {
            // Stream is exhausted
            None => return Ok(()),
            Some(Err(err)) => {
                // The codec already resynced byte-wise; whatever could not
                // be framed at all is dropped here.
                log::warn!("Dropped undecodable bytes: {err}");
                continue;
            }
            Some(Ok(frame)) => frame,
        };

        let RequestFrame { hdr, pdu } = frame;
        let slave = Slave(hdr.slave_id);
        let rsp_pdu: Option<ResponsePdu> = match pdu {
            Err(exception) => service.accepts(slave).then(|| exception.into()),
            Ok(request_pdu) => {
                let request = Request::from(request_pdu);
                let function = request.function_code();
                service
                    .call(slave, request)
                    .await
                    .map(|result| match result {
                        Ok(response) => response.into(),
                        Err(code) => ExceptionResponse::new(function, code).into(),
                    })
            }
        };

        let Some(pdu) = rsp_pdu else {
            continue;
        };
        framed.send(ResponseAdu { hdr, pdu }).await?;
    }
}
