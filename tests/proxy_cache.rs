// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests of the caching proxy: a real back-end server, the
//! proxy in the middle, and a front-end client driving it.

#![cfg(feature = "proxy")]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use modbus_bridge::{
    client::{
        tcp::{connect, TcpClientOptions},
        Reader as _, Writer as _,
    },
    proxy::{Proxy, ProxyDestination, ProxySettings},
    server::{tcp::Server, DeviceStore, StoreService},
    slave::Slave,
    DeviceInfoCategory, Error, ExceptionCode,
};

const FRESHNESS: Duration = Duration::from_millis(300);

async fn spawn_backend(devices: &[u8]) -> (SocketAddr, Arc<DeviceStore>) {
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

async fn spawn_proxy(backend: SocketAddr) -> Proxy {
    let mut settings = ProxySettings::new(ProxyDestination::Tcp(
        TcpClientOptions::new("127.0.0.1").with_port(backend.port()),
    ));
    settings.listen_address = "127.0.0.1".parse().unwrap();
    settings.listen_port = 0;
    settings.freshness_window = FRESHNESS;
    Proxy::start(settings).await.unwrap()
}

fn front_options(proxy: &Proxy) -> TcpClientOptions {
    let mut options = TcpClientOptions::new("127.0.0.1").with_port(proxy.local_addr().port());
    // Give the proxy room to time out against the back-end first.
    options.receive_timeout = Duration::from_secs(3);
    options
}

#[tokio::test]
async fn reads_are_cached_within_the_freshness_window() {
    let (backend_addr, store) = spawn_backend(&[1]).await;
    store.set_holding_register(1, 42, 100).unwrap();
    let proxy = spawn_proxy(backend_addr).await;
    let ctx = connect(front_options(&proxy)).await.unwrap();

    // First read populates the cache.
    let registers = ctx.read_holding_registers(Slave(1), 42, 1).await.unwrap();
    assert_eq!(registers, vec![100]);

    // The back-end changes, but the cache is still fresh.
    store.set_holding_register(1, 42, 200).unwrap();
    let registers = ctx.read_holding_registers(Slave(1), 42, 1).await.unwrap();
    assert_eq!(registers, vec![100]);

    // Past the freshness window the value is refetched.
    tokio::time::sleep(FRESHNESS + Duration::from_millis(100)).await;
    let registers = ctx.read_holding_registers(Slave(1), 42, 1).await.unwrap();
    assert_eq!(registers, vec![200]);

    ctx.disconnect().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn coil_reads_are_cached_per_address() {
    let (backend_addr, store) = spawn_backend(&[1]).await;
    store.set_coil(1, 3, true).unwrap();
    let proxy = spawn_proxy(backend_addr).await;
    let ctx = connect(front_options(&proxy)).await.unwrap();

    let coils = ctx.read_coils(Slave(1), 0, 8).await.unwrap();
    assert!(coils[3]);

    // A wider span contains uncached addresses and must refetch.
    store.set_coil(1, 9, true).unwrap();
    let coils = ctx.read_coils(Slave(1), 0, 10).await.unwrap();
    assert!(coils[9]);

    ctx.disconnect().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn writes_pass_through_and_refresh_the_cache() {
    let (backend_addr, store) = spawn_backend(&[1]).await;
    let proxy = spawn_proxy(backend_addr).await;
    let ctx = connect(front_options(&proxy)).await.unwrap();

    ctx.write_single_register(Slave(1), 42, 300).await.unwrap();
    assert_eq!(store.holding_register(1, 42).unwrap(), 300);

    // The write primed the cache: a direct back-end mutation stays
    // invisible until the entry expires.
    store.set_holding_register(1, 42, 999).unwrap();
    let registers = ctx.read_holding_registers(Slave(1), 42, 1).await.unwrap();
    assert_eq!(registers, vec![300]);

    tokio::time::sleep(FRESHNESS + Duration::from_millis(100)).await;
    let registers = ctx.read_holding_registers(Slave(1), 42, 1).await.unwrap();
    assert_eq!(registers, vec![999]);

    ctx.write_multiple_registers(Slave(1), 10, &[1, 2, 3])
        .await
        .unwrap();
    assert_eq!(store.holding_register(1, 12).unwrap(), 3);
    let registers = ctx.read_holding_registers(Slave(1), 10, 3).await.unwrap();
    assert_eq!(registers, vec![1, 2, 3]);

    ctx.disconnect().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn device_information_is_forwarded_uncached() {
    let (backend_addr, _store) = spawn_backend(&[1]).await;
    let proxy = spawn_proxy(backend_addr).await;
    let ctx = connect(front_options(&proxy)).await.unwrap();

    let objects = ctx
        .read_device_information(Slave(1), DeviceInfoCategory::Basic, None)
        .await
        .unwrap();
    assert_eq!(objects.get(&0x00).unwrap(), "modbus-bridge");

    ctx.disconnect().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn back_end_silence_maps_to_slave_device_failure() {
    // Device 9 is unknown to the back-end, which therefore never answers;
    // the proxy turns that into an exception instead of staying silent.
    let (backend_addr, _store) = spawn_backend(&[1]).await;
    let proxy = spawn_proxy(backend_addr).await;
    let ctx = connect(front_options(&proxy)).await.unwrap();

    let err = ctx
        .read_holding_registers(Slave(9), 0, 1)
        .await
        .unwrap_err();
    let Error::Exception(exception) = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(exception.exception, ExceptionCode::SlaveDeviceFailure);

    ctx.disconnect().await.unwrap();
    proxy.stop().await.unwrap();
}
