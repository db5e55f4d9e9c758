// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP client transport
//!
//! A connection-managing client: requests may be issued from many tasks
//! concurrently, a send mutex serializes the frame writes, and one
//! background receive loop demultiplexes responses to their waiters by
//! transaction id. A failed connection is re-established with a growing
//! per-attempt timeout until the configured reconnect window runs out.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::StreamExt as _;
use tokio::{
    io::AsyncWriteExt as _,
    net::{
        lookup_host,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::{
    codec::{Encoder as _, FramedRead},
    sync::CancellationToken,
};

use crate::{
    client::{validate_request, Client, ClientEvent, Context, ReconnectSchedule},
    codec,
    frame::{
        tcp::{Header, RequestAdu, ResponseAdu, TransactionId},
        Request, Response,
    },
    slave::Slave,
    Error, Result,
};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Configuration of a [`TcpClient`].
#[derive(Debug, Clone)]
pub struct TcpClientOptions {
    /// Host name or address of the remote server.
    pub host: String,
    /// TCP port (default 502).
    pub port: u16,
    /// Bound on writing one request frame (default 1 s).
    pub send_timeout: Duration,
    /// Bound on the idle wait for a matching response (default 1 s).
    pub receive_timeout: Duration,
    /// Total time budget for (re)connecting; `None` retries forever.
    pub reconnect_window: Option<Duration>,
    /// Cap of the growing per-attempt connect timeout (default 30 s).
    pub max_connect_timeout: Duration,
    /// TCP keep-alive probe interval, `None` to leave the socket alone.
    pub keep_alive: Option<Duration>,
    /// Deliver responses to waiters in send order instead of matching
    /// transaction ids. Only useful for peers that do not echo the id
    /// correctly; not recommended.
    pub disable_transaction_id: bool,
}

impl TcpClientOptions {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 502,
            send_timeout: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            reconnect_window: None,
            max_connect_timeout: Duration::from_secs(30),
            keep_alive: Some(Duration::from_secs(30)),
            disable_transaction_id: false,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Connect to a Modbus TCP server and wrap the transport in a [`Context`].
pub async fn connect(options: TcpClientOptions) -> Result<Context> {
    let client = TcpClient::new(options);
    Client::connect(&client).await?;
    Ok(Context::from(Box::new(client) as Box<dyn Client>))
}

/// Modbus TCP client transport.
#[derive(Debug, Clone)]
pub struct TcpClient {
    inner: Arc<Inner>,
}

impl TcpClient {
    #[must_use]
    pub fn new(options: TcpClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let fifo = options.disable_transaction_id;
        Self {
            inner: Arc::new(Inner {
                options,
                conn: Mutex::new(ConnState::default()),
                waiters: StdMutex::new(Waiters::new(fifo)),
                next_transaction_id: AtomicU16::new(0),
                events,
                closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration this client was created with.
    #[must_use]
    pub fn options(&self) -> &TcpClientOptions {
        &self.inner.options
    }
}

#[async_trait]
impl Client for TcpClient {
    async fn connect(&self) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connect_with_backoff().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let was_connected = {
            let mut conn = self.inner.conn.lock().await;
            conn.generation += 1;
            if let Some(reader) = conn.reader.take() {
                reader.abort();
            }
            conn.write.take().is_some()
        };
        self.inner.fail_waiters();
        if was_connected {
            let _ = self.inner.events.send(ClientEvent::Disconnected);
        }
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

/// Requests waiting for their response.
///
/// The lock around this table is only ever held for constant-time
/// bookkeeping, never across a suspension point.
#[derive(Debug)]
struct Waiters {
    by_id: HashMap<TransactionId, oneshot::Sender<ResponseAdu>>,
    send_order: VecDeque<TransactionId>,
    fifo: bool,
}

impl Waiters {
    fn new(fifo: bool) -> Self {
        Self {
            by_id: HashMap::new(),
            send_order: VecDeque::new(),
            fifo,
        }
    }

    fn register(&mut self, id: TransactionId, tx: oneshot::Sender<ResponseAdu>) {
        self.by_id.insert(id, tx);
        self.send_order.push_back(id);
        // Drop order entries of waiters that are already gone.
        while let Some(&front) = self.send_order.front() {
            if self.by_id.contains_key(&front) {
                break;
            }
            self.send_order.pop_front();
        }
    }

    fn take(&mut self, response_id: TransactionId) -> Option<oneshot::Sender<ResponseAdu>> {
        if self.fifo {
            while let Some(id) = self.send_order.pop_front() {
                if let Some(tx) = self.by_id.remove(&id) {
                    return Some(tx);
                }
            }
            None
        } else {
            self.by_id.remove(&response_id)
        }
    }

    fn remove(&mut self, id: TransactionId) {
        self.by_id.remove(&id);
    }

    fn fail_all(&mut self) {
        // Dropping the senders resolves every pending receiver with an
        // error which callers surface as a disconnect.
        self.by_id.clear();
        self.send_order.clear();
    }
}

#[derive(Debug, Default)]
struct ConnState {
    write: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    /// Bumped whenever the connection changes so that stale teardowns
    /// (e.g. a receive loop of a replaced connection) become no-ops.
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    options: TcpClientOptions,
    conn: Mutex<ConnState>,
    waiters: StdMutex<Waiters>,
    next_transaction_id: AtomicU16,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fail_waiters(&self) {
        self.waiters
            .lock()
            .expect("waiter table poisoned")
            .fail_all();
    }

    async fn connect_with_backoff(self: &Arc<Self>) -> Result<()> {
        let mut schedule = ReconnectSchedule::new(
            self.options.max_connect_timeout,
            self.options.reconnect_window,
        );
        loop {
            let attempt_timeout = schedule.next_attempt_timeout();
            match self.try_connect(attempt_timeout).await {
                Ok(()) => return Ok(()),
                // Retrying cannot fix a bad configuration.
                Err(err @ Error::InvalidArgument(_)) => return Err(err),
                Err(err) => {
                    if self.is_closed() {
                        return Err(Error::Disconnected);
                    }
                    if schedule.expired() {
                        log::warn!(
                            "Giving up connecting to {}:{}: {err}",
                            self.options.host,
                            self.options.port
                        );
                        return Err(err);
                    }
                    log::debug!(
                        "Connecting to {}:{} failed: {err}",
                        self.options.host,
                        self.options.port
                    );
                    sleep(ReconnectSchedule::RETRY_DELAY).await;
                }
            }
        }
    }

    async fn try_connect(self: &Arc<Self>, attempt_timeout: Duration) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.write.is_some() {
            return Ok(());
        }

        let addrs: Vec<SocketAddr> =
            lookup_host((self.options.host.as_str(), self.options.port))
                .await
                .map_err(Error::Transport)?
                .collect();
        if addrs.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "host does not resolve: {}",
                self.options.host
            )));
        }

        let mut last_err = Error::Timeout;
        for addr in addrs {
            match timeout(attempt_timeout, TcpStream::connect(addr)).await {
                Err(_) => last_err = Error::Timeout,
                Ok(Err(err)) => last_err = Error::Transport(err),
                Ok(Ok(stream)) => {
                    self.configure_socket(&stream);
                    let (read_half, write_half) = stream.into_split();
                    conn.generation += 1;
                    let generation = conn.generation;
                    conn.write = Some(write_half);
                    conn.reader = Some(tokio::spawn(
                        Arc::clone(self).receive_loop(read_half, generation),
                    ));
                    drop(conn);
                    log::debug!("Connected to {addr}");
                    let _ = self.events.send(ClientEvent::Connected);
                    return Ok(());
                }
            }
        }
        Err(last_err)
    }

    fn configure_socket(&self, stream: &TcpStream) {
        let Some(keep_alive) = self.options.keep_alive else {
            return;
        };
        let keep_alive = socket2::TcpKeepalive::new().with_time(keep_alive);
        // Best effort, not every platform supports it.
        if let Err(err) = socket2::SockRef::from(stream).set_tcp_keepalive(&keep_alive) {
            log::debug!("Failed to enable TCP keep-alive: {err}");
        }
    }

    /// Owns the read side of the connection and completes waiters.
    async fn receive_loop(self: Arc<Self>, read_half: OwnedReadHalf, generation: u64) {
        let mut framed = FramedRead::new(read_half, codec::tcp::ClientCodec);
        loop {
            match framed.next().await {
                Some(Ok(adu)) => {
                    let waiter = self
                        .waiters
                        .lock()
                        .expect("waiter table poisoned")
                        .take(adu.hdr.transaction_id);
                    match waiter {
                        Some(tx) => {
                            // The caller may have given up; that is fine.
                            let _ = tx.send(adu);
                        }
                        None => log::warn!(
                            "Discarding response with unexpected transaction id {}",
                            adu.hdr.transaction_id
                        ),
                    }
                }
                Some(Err(err)) => {
                    log::warn!("Receive loop failed: {err}");
                    break;
                }
                None => {
                    log::debug!("Connection closed by remote");
                    break;
                }
            }
        }
        self.teardown(generation, true).await;
    }

    /// Drop the connection identified by `generation`, fail all waiters
    /// and optionally kick off a background reconnect.
    fn teardown(
        self: &Arc<Self>,
        generation: u64,
        reconnect: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            {
                let mut conn = self.conn.lock().await;
                if conn.generation != generation {
                    // A newer connection took over in the meantime.
                    return;
                }
                conn.generation += 1;
                conn.write = None;
                if let Some(reader) = conn.reader.take() {
                    reader.abort();
                }
            }
            self.fail_waiters();
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
        })
    }

    async fn call(
        self: &Arc<Self>,
        slave: Slave,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response> {
        validate_request(&request)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let function = request.function_code();
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);

        let adu = RequestAdu {
            hdr: Header {
                transaction_id,
                unit_id: slave.into(),
            },
            pdu: request.into(),
        };
        let mut frame = BytesMut::new();
        let mut encoder = codec::tcp::ClientCodec;
        encoder.encode(adu, &mut frame)?;

        // Register before sending so that even an immediate response
        // finds its waiter.
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter table poisoned")
            .register(transaction_id, tx);

        let send = async {
            let mut conn = self.conn.lock().await;
            let generation = conn.generation;
            let Some(write_half) = conn.write.as_mut() else {
                return Err((Error::Disconnected, None));
            };
            match timeout(self.options.send_timeout, write_half.write_all(&frame)).await {
                Err(_) => Err((Error::Timeout, Some(generation))),
                Ok(Err(err)) => Err((Error::Transport(err), Some(generation))),
                Ok(Ok(())) => Ok(generation),
            }
        };
        let generation = tokio::select! {
            () = cancel.cancelled() => {
                self.remove_waiter(transaction_id);
                return Err(Error::Cancelled);
            }
            result = send => match result {
                Ok(generation) => generation,
                Err((err, generation)) => {
                    self.remove_waiter(transaction_id);
                    if let Some(generation) = generation {
                        self.teardown(generation, true).await;
                    }
                    return Err(err);
                }
            }
        };

        let adu = tokio::select! {
            () = cancel.cancelled() => {
                self.remove_waiter(transaction_id);
                return Err(Error::Cancelled);
            }
            result = timeout(self.options.receive_timeout, rx) => match result {
                Err(_) => {
                    self.remove_waiter(transaction_id);
                    // The response may still arrive out of step; drop the
                    // connection to regain a clean request/response state.
                    self.teardown(generation, true).await;
                    return Err(Error::Timeout);
                }
                // Sender dropped: the connection was torn down.
                Ok(Err(_)) => return Err(Error::Disconnected),
                Ok(Ok(adu)) => adu,
            }
        };

        let ResponseAdu { pdu, .. } = adu;
        crate::client::response_from_pdu(function, pdu)
    }

    fn remove_waiter(&self, id: TransactionId) {
        self.waiters
            .lock()
            .expect("waiter table poisoned")
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adu(transaction_id: TransactionId) -> ResponseAdu {
        ResponseAdu {
            hdr: Header {
                transaction_id,
                unit_id: 1,
            },
            pdu: Response::ReadCoils(vec![true]).into(),
        }
    }

    #[test]
    fn keyed_waiters_match_by_transaction_id() {
        let mut waiters = Waiters::new(false);
        let (tx5, mut rx5) = oneshot::channel();
        let (tx6, mut rx6) = oneshot::channel();
        waiters.register(5, tx5);
        waiters.register(6, tx6);

        // Spurious id finds no waiter.
        assert!(waiters.take(7).is_none());

        waiters.take(6).unwrap().send(adu(6)).unwrap();
        assert_eq!(rx6.try_recv().unwrap().hdr.transaction_id, 6);
        assert!(rx5.try_recv().is_err());

        waiters.take(5).unwrap().send(adu(5)).unwrap();
        assert!(waiters.take(5).is_none());
    }

    #[test]
    fn fifo_waiters_deliver_in_send_order() {
        let mut waiters = Waiters::new(true);
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        waiters.register(1, tx1);
        waiters.register(2, tx2);

        // The response id is ignored, the oldest waiter wins.
        waiters.take(99).unwrap().send(adu(99)).unwrap();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        waiters.take(98).unwrap().send(adu(98)).unwrap();
        assert!(rx2.try_recv().is_ok());
        assert!(waiters.take(97).is_none());
    }

    #[test]
    fn cancelled_fifo_waiters_are_skipped() {
        let mut waiters = Waiters::new(true);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        waiters.register(1, tx1);
        waiters.register(2, tx2);
        waiters.remove(1);

        waiters.take(0).unwrap().send(adu(0)).unwrap();
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn failing_all_waiters_drops_the_senders() {
        let mut waiters = Waiters::new(false);
        let (tx, mut rx) = oneshot::channel();
        waiters.register(5, tx);
        waiters.fail_all();
        assert!(rx.try_recv().is_err());
        assert!(waiters.take(5).is_none());
    }

    #[test]
    fn transaction_ids_wrap_around() {
        let client = TcpClient::new(TcpClientOptions::new("localhost"));
        client
            .inner
            .next_transaction_id
            .store(u16::MAX, Ordering::Relaxed);
        assert_eq!(
            client.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed),
            u16::MAX
        );
        assert_eq!(
            client.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed),
            0
        );
    }
}
