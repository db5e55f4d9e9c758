// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The freshness-windowed response cache of the proxy.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    frame::{Address, Coil, Word},
    server::RegisterClass,
    slave::SlaveId,
};

/// Shorter windows would make the cache pure overhead, so they are
/// clamped up to this minimum.
pub(crate) const MIN_FRESHNESS_WINDOW: Duration = Duration::from_millis(200);

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Entry<T> {
    at: Instant,
    value: T,
}

/// Cached values of one device, one map per register class.
///
/// Entries are never evicted; stale ones are simply ignored and
/// eventually overwritten by the next fill.
#[derive(Debug, Default)]
pub(crate) struct DeviceCache {
    coils: RwLock<HashMap<Address, Entry<Coil>>>,
    discrete_inputs: RwLock<HashMap<Address, Entry<Coil>>>,
    holding_registers: RwLock<HashMap<Address, Entry<Word>>>,
    input_registers: RwLock<HashMap<Address, Entry<Word>>>,
    fill: Mutex<()>,
}

impl DeviceCache {
    /// Serializes back-end fills of this device so that concurrent cache
    /// misses do not stampede the destination (double-checked
    /// read-through).
    pub(crate) async fn fill_lock(&self) -> MutexGuard<'_, ()> {
        self.fill.lock().await
    }

    fn bits(&self, class: RegisterClass) -> &RwLock<HashMap<Address, Entry<Coil>>> {
        match class {
            RegisterClass::Coil => &self.coils,
            RegisterClass::DiscreteInput => &self.discrete_inputs,
            _ => unreachable!("not a bit class"),
        }
    }

    fn words(&self, class: RegisterClass) -> &RwLock<HashMap<Address, Entry<Word>>> {
        match class {
            RegisterClass::HoldingRegister => &self.holding_registers,
            RegisterClass::InputRegister => &self.input_registers,
            _ => unreachable!("not a word class"),
        }
    }
}

/// Cache keyed by `(device id, register class, address)`.
#[derive(Debug)]
pub(crate) struct ProxyCache {
    devices: RwLock<HashMap<SlaveId, Arc<DeviceCache>>>,
    freshness_window: Duration,
}

impl ProxyCache {
    pub(crate) fn new(freshness_window: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            freshness_window: freshness_window.max(MIN_FRESHNESS_WINDOW),
        }
    }

    pub(crate) fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// The cache of one device, created on first use.
    pub(crate) fn device(&self, slave: SlaveId) -> Arc<DeviceCache> {
        if let Some(device) = self.devices.read().get(&slave) {
            return Arc::clone(device);
        }
        Arc::clone(self.devices.write().entry(slave).or_default())
    }

    fn lookup_device(&self, slave: SlaveId) -> Option<Arc<DeviceCache>> {
        self.devices.read().get(&slave).cloned()
    }

    /// All requested bits, provided every single one is still fresh.
    pub(crate) fn lookup_bits(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        count: u16,
    ) -> Option<Vec<Coil>> {
        let device = self.lookup_device(slave)?;
        let map = device.bits(class).try_read_for(LOCK_TIMEOUT)?;
        self.collect_fresh(&map, start, count)
    }

    /// All requested words, provided every single one is still fresh.
    pub(crate) fn lookup_words(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        count: u16,
    ) -> Option<Vec<Word>> {
        let device = self.lookup_device(slave)?;
        let map = device.words(class).try_read_for(LOCK_TIMEOUT)?;
        self.collect_fresh(&map, start, count)
    }

    fn collect_fresh<T: Copy>(
        &self,
        map: &HashMap<Address, Entry<T>>,
        start: Address,
        count: u16,
    ) -> Option<Vec<T>> {
        let now = Instant::now();
        let mut values = Vec::with_capacity(count.into());
        for i in 0..count {
            let entry = map.get(&start.wrapping_add(i))?;
            if now.duration_since(entry.at) > self.freshness_window {
                return None;
            }
            values.push(entry.value);
        }
        Some(values)
    }

    pub(crate) fn store_bits(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        values: &[Coil],
    ) {
        let device = self.device(slave);
        let Some(mut map) = device.bits(class).try_write_for(LOCK_TIMEOUT) else {
            log::warn!("Skipped caching values for device {slave}, lock is contended");
            return;
        };
        let at = Instant::now();
        for (i, value) in values.iter().enumerate() {
            map.insert(start.wrapping_add(i as u16), Entry { at, value: *value });
        }
    }

    pub(crate) fn store_words(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        values: &[Word],
    ) {
        let device = self.device(slave);
        let Some(mut map) = device.words(class).try_write_for(LOCK_TIMEOUT) else {
            log::warn!("Skipped caching values for device {slave}, lock is contended");
            return;
        };
        let at = Instant::now();
        for (i, value) in values.iter().enumerate() {
            map.insert(start.wrapping_add(i as u16), Entry { at, value: *value });
        }
    }
}
