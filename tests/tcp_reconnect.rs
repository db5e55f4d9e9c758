// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconnect and cancellation behavior of the TCP client, exercised
//! against a hand-rolled peer so connection drops happen on cue.

#![cfg(feature = "tcp")]

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpListener,
    sync::{broadcast, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use modbus_bridge::{
    client::{
        tcp::{TcpClient, TcpClientOptions},
        Client as _, ClientEvent,
    },
    slave::Slave,
    Error, Request, Response,
};

async fn wait_for(events: &mut broadcast::Receiver<ClientEvent>, needle: ClientEvent) {
    timeout(Duration::from_secs(5), async {
        loop {
            if events.recv().await.unwrap() == needle {
                break;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn reconnect_continues_the_transaction_id_sequence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_ids, mut ids) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First connection: swallow one request, then slam the door.
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frame = [0u8; 12];
        stream.read_exact(&mut frame).await.unwrap();
        seen_ids
            .send(u16::from_be_bytes([frame[0], frame[1]]))
            .unwrap();
        drop(stream);

        // Second connection: answer properly.
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frame = [0u8; 12];
        stream.read_exact(&mut frame).await.unwrap();
        seen_ids
            .send(u16::from_be_bytes([frame[0], frame[1]]))
            .unwrap();
        let response = [
            frame[0], frame[1], 0x00, 0x00, 0x00, 0x05, frame[6], 0x03, 0x02, 0x00, 0x07,
        ];
        stream.write_all(&response).await.unwrap();
        // Leave the connection up until the test is done.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = TcpClient::new(TcpClientOptions::new("127.0.0.1").with_port(addr.port()));
    let mut events = client.subscribe();
    client.connect().await.unwrap();
    wait_for(&mut events, ClientEvent::Connected).await;

    // The server drops the connection mid-request: the waiter fails and
    // never completes against the later connection.
    let err = client
        .call(Slave(1), Request::ReadHoldingRegisters(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected | Error::Timeout));

    wait_for(&mut events, ClientEvent::Disconnected).await;
    wait_for(&mut events, ClientEvent::Connected).await;

    let response = client
        .call(Slave(1), Request::ReadHoldingRegisters(0, 1))
        .await
        .unwrap();
    assert_eq!(response, Response::ReadHoldingRegisters(vec![0x0007]));

    // The id sequence continued across the reconnect.
    assert_eq!(ids.recv().await.unwrap(), 0);
    assert_eq!(ids.recv().await.unwrap(), 1);
}

#[tokio::test]
async fn cancellation_fails_the_call_but_keeps_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Read the request and never answer.
        let mut frame = [0u8; 12];
        let _ = stream.read_exact(&mut frame).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut options = TcpClientOptions::new("127.0.0.1").with_port(addr.port());
    options.receive_timeout = Duration::from_secs(3);
    let client = TcpClient::new(options);
    let mut events = client.subscribe();
    client.connect().await.unwrap();
    wait_for(&mut events, ClientEvent::Connected).await;

    let cancel = CancellationToken::new();
    let call = client.call_with_cancel(
        Slave(1),
        Request::ReadHoldingRegisters(0, 1),
        cancel.clone(),
    );
    let (result, ()) = tokio::join!(call, async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    assert!(matches!(result.unwrap_err(), Error::Cancelled));

    // Cancellation must not drop the connection.
    let disconnected = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(disconnected.is_err());
}

#[tokio::test]
async fn receive_timeout_surfaces_and_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Swallow requests without ever answering.
                let mut buf = [0u8; 256];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });

    let mut options = TcpClientOptions::new("127.0.0.1").with_port(addr.port());
    options.receive_timeout = Duration::from_millis(200);
    let client = TcpClient::new(options);
    let mut events = client.subscribe();
    client.connect().await.unwrap();
    wait_for(&mut events, ClientEvent::Connected).await;

    let err = client
        .call(Slave(1), Request::ReadHoldingRegisters(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // The timed-out connection is replaced by a fresh one.
    wait_for(&mut events, ClientEvent::Disconnected).await;
    wait_for(&mut events, ClientEvent::Connected).await;
}

#[tokio::test]
async fn calls_without_a_connection_fail_fast() {
    let client = TcpClient::new(TcpClientOptions::new("127.0.0.1").with_port(1));
    let err = client
        .call(Slave(1), Request::ReadHoldingRegisters(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected));
}
