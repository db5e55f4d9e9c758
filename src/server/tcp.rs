// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP server

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{sink::SinkExt as _, stream::StreamExt as _};
use socket2::{Domain, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    codec,
    frame::{
        tcp::{RequestFrame, ResponseAdu},
        ExceptionResponse, Request, ResponsePdu,
    },
    server::Service,
    slave::Slave,
};

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Notification about the lifetime of accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
}

/// Accepts connections and runs one independent session per client.
///
/// Requests on a single connection are processed strictly sequentially;
/// connections are served in parallel.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    stage_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Server {
    /// Wrap an already bound listener.
    #[must_use]
    pub fn new(listener: TcpListener) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listener,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            events,
        }
    }

    /// Bind a reusable listening socket on the given address.
    pub async fn bind(socket_addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(listener(socket_addr, 1024)?))
    }

    /// Bound per-stage timeout of every session (default 1 s).
    ///
    /// An idle wait for the next request is exempt; connections are kept
    /// alive indefinitely between requests.
    #[must_use]
    pub fn with_stage_timeout(mut self, stage_timeout: Duration) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Subscribe to connect/disconnect notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Accept and serve connections until the listener fails.
    pub async fn serve<S>(&self, service: Arc<S>) -> io::Result<()>
    where
        S: Service,
    {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            log::debug!("Accepted connection from {peer}");
            let _ = self.events.send(ConnectionEvent::ClientConnected(peer));

            let service = Arc::clone(&service);
            let events = self.events.clone();
            let stage_timeout = self.stage_timeout;
            tokio::spawn(async move {
                if let Err(err) = process(stream, service, stage_timeout).await {
                    log::warn!("Session with {peer} failed: {err}");
                }
                let _ = events.send(ConnectionEvent::ClientDisconnected(peer));
            });
        }
    }

    /// Serve connections until the given shutdown signal resolves.
    pub async fn serve_until<S, Sd>(&self, service: Arc<S>, shutdown_signal: Sd) -> io::Result<()>
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

/// The per-connection request-response loop.
async fn process<S>(stream: TcpStream, service: Arc<S>, stage_timeout: Duration) -> io::Result<()>
where
    S: Service,
{
    let mut framed = Framed::new(stream, codec::tcp::ServerCodec);

    loop {
        // Bind the outcome first: the frame future's borrow must end
        // before the read buffer is inspected.
        let next = timeout(stage_timeout, framed.next()).await;
        let frame = match next {
            Err(_) => {
                if framed.read_buffer().is_empty() {
                    // Idle between requests, keep the connection alive.
                    continue;
                }
                // A partial frame went stale, the boundary is lost.
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Timed out inside a request frame",
                ));
            }
            // Remote closed the connection.
            Ok(None) => return Ok(()),
            // Unframeable bytes: on TCP the only safe reaction is to
            // close, the frame boundary is gone.
            Ok(Some(Err(err))) => return Err(err),
            Ok(Some(Ok(frame))) => frame,
        };

        let RequestFrame { hdr, pdu } = frame;
        let rsp_pdu: Option<ResponsePdu> = match pdu {
            Err(exception) => service
                .accepts(Slave(hdr.unit_id))
                .then(|| exception.into()),
            Ok(request_pdu) => {
                let request = Request::from(request_pdu);
                let function = request.function_code();
                service
                    .call(Slave(hdr.unit_id), request)
                    .await
                    .map(|result| match result {
                        Ok(response) => response.into(),
                        Err(code) => ExceptionResponse::new(function, code).into(),
                    })
            }
        };

        // No response for unknown device ids, but the connection stays up.
        let Some(pdu) = rsp_pdu else {
            continue;
        };

        timeout(stage_timeout, framed.send(ResponseAdu { hdr, pdu }))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "Timed out writing a response")
            })??;
    }
}

/// Configure and open a reusable listening socket.
fn listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
        SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
    };
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
