// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory register store shared by all server sessions.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{
    frame::{Address, Coil, Word},
    slave::SlaveId,
    Error, Result,
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The four register classes of a Modbus data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    /// Single-bit, read/write.
    Coil,
    /// Single-bit, read-only.
    DiscreteInput,
    /// 16-bit word, read/write.
    HoldingRegister,
    /// 16-bit word, read-only.
    InputRegister,
}

/// Notification about a successful write through the server.
///
/// Events are delivered on a best-effort basis: subscribers that lag
/// behind lose events instead of stalling any session loop.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// One or more coils were written.
    InputWritten {
        slave: SlaveId,
        coils: Vec<(Address, Coil)>,
    },
    /// One or more holding registers were written.
    RegisterWritten {
        slave: SlaveId,
        registers: Vec<(Address, Word)>,
    },
}

#[derive(Debug, Default)]
struct DeviceRegisters {
    coils: RwLock<HashMap<Address, Coil>>,
    discrete_inputs: RwLock<HashMap<Address, Coil>>,
    holding_registers: RwLock<HashMap<Address, Word>>,
    input_registers: RwLock<HashMap<Address, Word>>,
}

/// Per-device register maps for every served device id.
///
/// All register classes live only in process memory. A missing address
/// reads as zero/`false`. Each class is guarded by its own reader/writer
/// lock; lock acquisition is bounded and fails with [`Error::Timeout`]
/// instead of blocking a session indefinitely.
#[derive(Debug)]
pub struct DeviceStore {
    devices: RwLock<HashMap<SlaveId, Arc<DeviceRegisters>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read_locked<T>(lock: &RwLock<T>) -> Result<parking_lot::RwLockReadGuard<'_, T>> {
    lock.try_read_for(LOCK_TIMEOUT).ok_or(Error::Timeout)
}

fn write_locked<T>(lock: &RwLock<T>) -> Result<parking_lot::RwLockWriteGuard<'_, T>> {
    lock.try_write_for(LOCK_TIMEOUT).ok_or(Error::Timeout)
}

impl DeviceStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to write notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Register a device id to be served.
    ///
    /// Returns `false` if the device already existed; its registers are
    /// left untouched in that case.
    pub fn add_device(&self, slave: SlaveId) -> Result<bool> {
        let mut devices = write_locked(&self.devices)?;
        if devices.contains_key(&slave) {
            return Ok(false);
        }
        devices.insert(slave, Arc::new(DeviceRegisters::default()));
        Ok(true)
    }

    /// Remove a device id and drop all its registers.
    pub fn remove_device(&self, slave: SlaveId) -> Result<bool> {
        Ok(write_locked(&self.devices)?.remove(&slave).is_some())
    }

    /// All currently served device ids, in ascending order.
    pub fn device_ids(&self) -> Result<Vec<SlaveId>> {
        let mut ids: Vec<_> = read_locked(&self.devices)?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Check whether the device id is served.
    pub fn contains_device(&self, slave: SlaveId) -> Result<bool> {
        Ok(read_locked(&self.devices)?.contains_key(&slave))
    }

    fn device(&self, slave: SlaveId) -> Result<Arc<DeviceRegisters>> {
        read_locked(&self.devices)?
            .get(&slave)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown device id: {slave}")))
    }

    fn bits(
        device: &DeviceRegisters,
        class: RegisterClass,
    ) -> &RwLock<HashMap<Address, Coil>> {
        match class {
            RegisterClass::Coil => &device.coils,
            RegisterClass::DiscreteInput => &device.discrete_inputs,
            _ => unreachable!("not a bit class"),
        }
    }

    fn words(
        device: &DeviceRegisters,
        class: RegisterClass,
    ) -> &RwLock<HashMap<Address, Word>> {
        match class {
            RegisterClass::HoldingRegister => &device.holding_registers,
            RegisterClass::InputRegister => &device.input_registers,
            _ => unreachable!("not a word class"),
        }
    }

    pub(crate) fn read_bits(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        count: u16,
    ) -> Result<Vec<Coil>> {
        let device = self.device(slave)?;
        let map = read_locked(Self::bits(&device, class))?;
        Ok(address_span(start, count)
            .map(|addr| map.get(&addr).copied().unwrap_or_default())
            .collect())
    }

    pub(crate) fn read_words(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        count: u16,
    ) -> Result<Vec<Word>> {
        let device = self.device(slave)?;
        let map = read_locked(Self::words(&device, class))?;
        Ok(address_span(start, count)
            .map(|addr| map.get(&addr).copied().unwrap_or_default())
            .collect())
    }

    pub(crate) fn write_bits(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        values: &[Coil],
    ) -> Result<()> {
        let device = self.device(slave)?;
        {
            let mut map = write_locked(Self::bits(&device, class))?;
            for (addr, value) in address_values(start, values) {
                map.insert(addr, value);
            }
        }
        if class == RegisterClass::Coil {
            // Best effort, nobody listening is fine.
            let _ = self.events.send(StoreEvent::InputWritten {
                slave,
                coils: address_values(start, values).collect(),
            });
        }
        Ok(())
    }

    pub(crate) fn write_words(
        &self,
        slave: SlaveId,
        class: RegisterClass,
        start: Address,
        values: &[Word],
    ) -> Result<()> {
        let device = self.device(slave)?;
        {
            let mut map = write_locked(Self::words(&device, class))?;
            for (addr, value) in address_values(start, values) {
                map.insert(addr, value);
            }
        }
        if class == RegisterClass::HoldingRegister {
            let _ = self.events.send(StoreEvent::RegisterWritten {
                slave,
                registers: address_values(start, values).collect(),
            });
        }
        Ok(())
    }

    /// Read a single coil; a missing address reads as `false`.
    pub fn coil(&self, slave: SlaveId, address: Address) -> Result<Coil> {
        Ok(self.read_bits(slave, RegisterClass::Coil, address, 1)?[0])
    }

    /// Write a single coil.
    pub fn set_coil(&self, slave: SlaveId, address: Address, value: Coil) -> Result<()> {
        self.write_bits(slave, RegisterClass::Coil, address, &[value])
    }

    /// Write consecutive coils starting at `start`.
    pub fn set_coils(&self, slave: SlaveId, start: Address, values: &[Coil]) -> Result<()> {
        self.write_bits(slave, RegisterClass::Coil, start, values)
    }

    /// Read a single discrete input; a missing address reads as `false`.
    pub fn discrete_input(&self, slave: SlaveId, address: Address) -> Result<Coil> {
        Ok(self.read_bits(slave, RegisterClass::DiscreteInput, address, 1)?[0])
    }

    /// Write a single discrete input (server-local, read-only on the wire).
    pub fn set_discrete_input(
        &self,
        slave: SlaveId,
        address: Address,
        value: Coil,
    ) -> Result<()> {
        self.write_bits(slave, RegisterClass::DiscreteInput, address, &[value])
    }

    /// Write consecutive discrete inputs starting at `start`.
    pub fn set_discrete_inputs(
        &self,
        slave: SlaveId,
        start: Address,
        values: &[Coil],
    ) -> Result<()> {
        self.write_bits(slave, RegisterClass::DiscreteInput, start, values)
    }

    /// Read a single holding register; a missing address reads as `0`.
    pub fn holding_register(&self, slave: SlaveId, address: Address) -> Result<Word> {
        Ok(self.read_words(slave, RegisterClass::HoldingRegister, address, 1)?[0])
    }

    /// Write a single holding register.
    pub fn set_holding_register(
        &self,
        slave: SlaveId,
        address: Address,
        value: Word,
    ) -> Result<()> {
        self.write_words(slave, RegisterClass::HoldingRegister, address, &[value])
    }

    /// Write consecutive holding registers starting at `start`.
    pub fn set_holding_registers(
        &self,
        slave: SlaveId,
        start: Address,
        values: &[Word],
    ) -> Result<()> {
        self.write_words(slave, RegisterClass::HoldingRegister, start, values)
    }

    /// Read a single input register; a missing address reads as `0`.
    pub fn input_register(&self, slave: SlaveId, address: Address) -> Result<Word> {
        Ok(self.read_words(slave, RegisterClass::InputRegister, address, 1)?[0])
    }

    /// Write a single input register (server-local, read-only on the wire).
    pub fn set_input_register(
        &self,
        slave: SlaveId,
        address: Address,
        value: Word,
    ) -> Result<()> {
        self.write_words(slave, RegisterClass::InputRegister, address, &[value])
    }

    /// Write consecutive input registers starting at `start`.
    pub fn set_input_registers(
        &self,
        slave: SlaveId,
        start: Address,
        values: &[Word],
    ) -> Result<()> {
        self.write_words(slave, RegisterClass::InputRegister, start, values)
    }
}

/// Iterate the addresses `start..start + count`.
///
/// Callers have validated that the span does not wrap around the address
/// space.
fn address_span(start: Address, count: u16) -> impl Iterator<Item = Address> {
    (0..count).map(move |i| start.wrapping_add(i))
}

fn address_values<T: Copy>(
    start: Address,
    values: &[T],
) -> impl Iterator<Item = (Address, T)> + '_ {
    values
        .iter()
        .enumerate()
        .map(move |(i, value)| (start.wrapping_add(i as u16), *value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_devices() {
        let store = DeviceStore::new();
        assert!(store.add_device(1).unwrap());
        assert!(!store.add_device(1).unwrap());
        assert!(store.add_device(7).unwrap());
        assert_eq!(store.device_ids().unwrap(), vec![1, 7]);
        assert!(store.remove_device(1).unwrap());
        assert!(!store.remove_device(1).unwrap());
        assert_eq!(store.device_ids().unwrap(), vec![7]);
    }

    #[test]
    fn missing_addresses_read_as_default() {
        let store = DeviceStore::new();
        store.add_device(1).unwrap();
        assert!(!store.coil(1, 42).unwrap());
        assert_eq!(store.holding_register(1, 42).unwrap(), 0);
        assert_eq!(
            store.read_words(1, RegisterClass::InputRegister, 0, 3).unwrap(),
            vec![0, 0, 0]
        );
    }

    #[test]
    fn write_then_read_back() {
        let store = DeviceStore::new();
        store.add_device(1).unwrap();
        store.set_holding_registers(1, 0x10, &[0x0001, 0x0002]).unwrap();
        assert_eq!(
            store
                .read_words(1, RegisterClass::HoldingRegister, 0x10, 2)
                .unwrap(),
            vec![0x0001, 0x0002]
        );
        store.set_coil(1, 3, true).unwrap();
        assert!(store.coil(1, 3).unwrap());
        // Writing zero is allowed and reads back as such.
        store.set_holding_register(1, 0x10, 0).unwrap();
        assert_eq!(store.holding_register(1, 0x10).unwrap(), 0);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let store = DeviceStore::new();
        assert!(store.coil(9, 0).is_err());
        assert!(store.set_holding_register(9, 0, 1).is_err());
    }

    #[test]
    fn register_classes_are_independent() {
        let store = DeviceStore::new();
        store.add_device(1).unwrap();
        store.set_holding_register(1, 5, 0xAAAA).unwrap();
        assert_eq!(store.input_register(1, 5).unwrap(), 0);
        store.set_coil(1, 5, true).unwrap();
        assert!(!store.discrete_input(1, 5).unwrap());
    }

    #[tokio::test]
    async fn events_are_emitted_for_writes() {
        let store = DeviceStore::new();
        store.add_device(1).unwrap();
        let mut events = store.subscribe();

        store.set_coils(1, 2, &[true, false]).unwrap();
        let StoreEvent::InputWritten { slave, coils } = events.recv().await.unwrap() else {
            panic!("unexpected event");
        };
        assert_eq!(slave, 1);
        assert_eq!(coils, vec![(2, true), (3, false)]);

        store.set_holding_register(1, 7, 0x1234).unwrap();
        let StoreEvent::RegisterWritten { slave, registers } = events.recv().await.unwrap()
        else {
            panic!("unexpected event");
        };
        assert_eq!(slave, 1);
        assert_eq!(registers, vec![(7, 0x1234)]);

        // Local seeding of read-only classes is not an external write.
        store.set_input_register(1, 0, 1).unwrap();
        store.set_discrete_input(1, 0, true).unwrap();
        assert!(events.try_recv().is_err());
    }
}
