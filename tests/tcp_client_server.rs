// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Socket-level tests of the TCP client and server endpoints.

#![cfg(feature = "tcp-server")]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    time::timeout,
};

use modbus_bridge::{
    client::{
        tcp::{connect, TcpClientOptions},
        Reader as _, Writer as _,
    },
    server::{tcp::Server, DeviceStore, StoreEvent, StoreService},
    slave::Slave,
    DeviceInfoCategory, Error,
};

async fn spawn_server(devices: &[u8]) -> (SocketAddr, Arc<DeviceStore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(DeviceStore::new());
    for id in devices {
        store.add_device(*id).unwrap();
    }
    let service = Arc::new(StoreService::new(Arc::clone(&store)));
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(service).await;
    });
    (addr, store)
}

fn client_options(addr: SocketAddr) -> TcpClientOptions {
    TcpClientOptions::new("127.0.0.1").with_port(addr.port())
}

#[tokio::test]
async fn write_multiple_registers_round_trip() -> anyhow::Result<()> {
    let (addr, _store) = spawn_server(&[1]).await;
    let ctx = connect(client_options(addr)).await?;

    // The echo is verified inside the writer.
    ctx.write_multiple_registers(Slave(1), 0x0010, &[0x0001, 0x0002])
        .await?;

    let registers = ctx.read_holding_registers(Slave(1), 0x0010, 2).await?;
    assert_eq!(registers, vec![0x0001, 0x0002]);

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn read_coils_returns_exactly_the_requested_span() {
    let (addr, store) = spawn_server(&[1]).await;
    for coil in [1, 3, 4, 7, 10] {
        store.set_coil(1, coil, true).unwrap();
    }
    let ctx = connect(client_options(addr)).await.unwrap();

    let coils = ctx.read_coils(Slave(1), 0, 11).await.unwrap();
    assert_eq!(coils.len(), 11);
    let expected: Vec<bool> = (0..11u16).map(|i| [1, 3, 4, 7, 10].contains(&i)).collect();
    assert_eq!(coils, expected);

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn single_coil_and_register_writes() {
    let (addr, store) = spawn_server(&[1]).await;
    let ctx = connect(client_options(addr)).await.unwrap();

    ctx.write_single_coil(Slave(1), 0x00AC, true).await.unwrap();
    assert!(store.coil(1, 0x00AC).unwrap());

    ctx.write_single_register(Slave(1), 0x00AC, 0x1234)
        .await
        .unwrap();
    assert_eq!(store.holding_register(1, 0x00AC).unwrap(), 0x1234);

    // Input registers are readable but not writable through the wire.
    store.set_input_register(1, 5, 0x4242).unwrap();
    let inputs = ctx.read_input_registers(Slave(1), 5, 1).await.unwrap();
    assert_eq!(inputs, vec![0x4242]);

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_wire() {
    let (addr, _store) = spawn_server(&[1]).await;
    let ctx = connect(client_options(addr)).await.unwrap();

    let err = ctx.read_coils(Slave(1), 0, 0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = ctx
        .read_holding_registers(Slave(1), 0xFFFF, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = ctx
        .write_multiple_registers(Slave(1), 0, &[0; 124])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn device_information() {
    let (addr, _store) = spawn_server(&[1]).await;
    let ctx = connect(client_options(addr)).await.unwrap();

    let objects = ctx
        .read_device_information(Slave(1), DeviceInfoCategory::Basic, None)
        .await
        .unwrap();
    assert_eq!(objects.get(&0x00).unwrap(), "modbus-bridge");
    assert!(objects.contains_key(&0x01));
    assert!(objects.contains_key(&0x02));

    let individual = ctx
        .read_device_information(Slave(1), DeviceInfoCategory::Individual, Some(0x02))
        .await
        .unwrap();
    assert_eq!(individual.len(), 1);
    assert_eq!(individual.get(&0x02).unwrap(), env!("CARGO_PKG_VERSION"));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn store_events_fire_for_remote_writes() {
    let (addr, store) = spawn_server(&[1]).await;
    let mut events = store.subscribe();
    let ctx = connect(client_options(addr)).await.unwrap();

    ctx.write_single_coil(Slave(1), 2, true).await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let StoreEvent::InputWritten { slave, coils } = event else {
        panic!("unexpected event");
    };
    assert_eq!(slave, 1);
    assert_eq!(coils, vec![(2, true)]);

    ctx.write_multiple_registers(Slave(1), 7, &[1, 2]).await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let StoreEvent::RegisterWritten { slave, registers } = event else {
        panic!("unexpected event");
    };
    assert_eq!(slave, 1);
    assert_eq!(registers, vec![(7, 1), (8, 2)]);

    ctx.disconnect().await.unwrap();
}

/// Raw frames let the tests pin the exact wire behavior.
async fn exchange_raw(stream: &mut TcpStream, request: &[u8], response_len: usize) -> Vec<u8> {
    stream.write_all(request).await.unwrap();
    let mut response = vec![0; response_len];
    timeout(Duration::from_secs(2), stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn write_single_coil_frame_is_echoed() {
    let (addr, store) = spawn_server(&[1]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0xAC, 0xFF, 0x00,
    ];
    let response = exchange_raw(&mut stream, &request, request.len()).await;
    assert_eq!(response, request);
    assert!(store.coil(1, 0x00AC).unwrap());
}

#[tokio::test]
async fn zero_count_yields_illegal_data_value() {
    let (addr, _store) = spawn_server(&[1]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = [
        0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00,
    ];
    let response = exchange_raw(&mut stream, &request, 9).await;
    assert_eq!(
        response,
        vec![0x00, 0x2A, 0x00, 0x00, 0x00, 0x03, 0x01, 0x81, 0x03]
    );
}

#[tokio::test]
async fn address_overflow_yields_illegal_data_address() {
    let (addr, _store) = spawn_server(&[1]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = [
        0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0xFF, 0xFF, 0x00, 0x02,
    ];
    let response = exchange_raw(&mut stream, &request, 9).await;
    assert_eq!(
        response,
        vec![0x00, 0x05, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
    );
}

#[tokio::test]
async fn invalid_coil_sentinel_yields_illegal_data_value() {
    let (addr, _store) = spawn_server(&[1]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = [
        0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0xAC, 0x12, 0x34,
    ];
    let response = exchange_raw(&mut stream, &request, 9).await;
    assert_eq!(
        response,
        vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0x85, 0x03]
    );
}

#[tokio::test]
async fn unknown_function_yields_illegal_function() {
    let (addr, _store) = spawn_server(&[1]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = [0x00, 0x09, 0x00, 0x00, 0x00, 0x04, 0x01, 0x55, 0x01, 0x02];
    let response = exchange_raw(&mut stream, &request, 9).await;
    assert_eq!(
        response,
        vec![0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x01, 0xD5, 0x01]
    );
}

#[tokio::test]
async fn unknown_unit_is_dropped_but_the_connection_survives() {
    let (addr, _store) = spawn_server(&[1]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Device 9 is not served: no response may be produced.
    let ignored = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x03, 0x00, 0x00, 0x00, 0x01,
    ];
    stream.write_all(&ignored).await.unwrap();

    // The next request on the same connection is answered normally, and
    // nothing arrives for the dropped one.
    let request = [
        0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
    ];
    let response = exchange_raw(&mut stream, &request, 11).await;
    assert_eq!(
        response,
        vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00]
    );
}

#[tokio::test]
async fn connection_events_are_emitted() {
    let store = Arc::new(DeviceStore::new());
    store.add_device(1).unwrap();
    let service = Arc::new(StoreService::new(Arc::clone(&store)));
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let mut events = server.subscribe();
    tokio::spawn(async move {
        let _ = server.serve(service).await;
    });

    let ctx = connect(client_options(addr)).await.unwrap();
    let connected = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        connected,
        modbus_bridge::server::tcp::ConnectionEvent::ClientConnected(_)
    ));

    ctx.disconnect().await.unwrap();
    let disconnected = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        disconnected,
        modbus_bridge::server::tcp::ConnectionEvent::ClientDisconnected(_)
    ));
}
