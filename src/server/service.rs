// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The store-backed request handler.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    frame::{
        mei::{object_id, DeviceInfoCategory, DeviceInfoObject, DeviceInfoObjectId,
            DeviceInfoResponse},
        Address, ExceptionCode, Quantity, Request, Response, MAX_READ_BITS, MAX_READ_WORDS,
        MAX_WRITE_BITS, MAX_WRITE_WORDS,
    },
    server::{
        store::{DeviceStore, RegisterClass},
        Service,
    },
    slave::Slave,
};

/// Conformity level bit for devices that also allow individual access.
const CONFORMITY_INDIVIDUAL: u8 = 0x80;

/// Device-identification objects beyond this total size are deferred to a
/// follow-up request via the more-follows marker.
const OBJECT_BYTE_BUDGET: usize = 245;

/// The static device-identification dictionary served through the
/// encapsulated interface.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub vendor_name: String,
    pub product_code: String,
    pub revision: String,
    pub vendor_url: Option<String>,
    pub product_name: Option<String>,
    pub model_name: Option<String>,
    pub user_application_name: Option<String>,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_name: "modbus-bridge".to_string(),
            product_code: env!("CARGO_PKG_NAME").to_uppercase(),
            revision: env!("CARGO_PKG_VERSION").to_string(),
            vendor_url: None,
            product_name: None,
            model_name: None,
            user_application_name: None,
        }
    }
}

impl DeviceIdentity {
    fn object(&self, id: DeviceInfoObjectId) -> Option<&str> {
        match id {
            object_id::VENDOR_NAME => Some(&self.vendor_name),
            object_id::PRODUCT_CODE => Some(&self.product_code),
            object_id::MAJOR_MINOR_REVISION => Some(&self.revision),
            object_id::VENDOR_URL => self.vendor_url.as_deref(),
            object_id::PRODUCT_NAME => self.product_name.as_deref(),
            object_id::MODEL_NAME => self.model_name.as_deref(),
            object_id::USER_APPLICATION_NAME => self.user_application_name.as_deref(),
            _ => None,
        }
    }

    fn stream_objects(
        &self,
        category: DeviceInfoCategory,
    ) -> impl Iterator<Item = (DeviceInfoObjectId, &str)> {
        let last = match category {
            DeviceInfoCategory::Basic => object_id::MAJOR_MINOR_REVISION,
            _ => object_id::USER_APPLICATION_NAME,
        };
        (object_id::VENDOR_NAME..=last).filter_map(|id| self.object(id).map(|value| (id, value)))
    }
}

/// A [`Service`] answering requests from a shared [`DeviceStore`].
///
/// Only device ids registered in the store are answered; requests for any
/// other id are silently dropped as a bus would.
#[derive(Debug)]
pub struct StoreService {
    store: Arc<DeviceStore>,
    identity: DeviceIdentity,
}

impl StoreService {
    #[must_use]
    pub fn new(store: Arc<DeviceStore>) -> Self {
        Self::with_identity(store, DeviceIdentity::default())
    }

    #[must_use]
    pub fn with_identity(store: Arc<DeviceStore>, identity: DeviceIdentity) -> Self {
        Self { store, identity }
    }

    /// The shared register store backing this service.
    #[must_use]
    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    fn handle(
        &self,
        slave: Slave,
        request: Request,
    ) -> Option<std::result::Result<Response, ExceptionCode>> {
        let slave_id = slave.into();
        match self.store.contains_device(slave_id) {
            Ok(true) => (),
            Ok(false) => return None,
            Err(_) => return Some(Err(ExceptionCode::SlaveDeviceFailure)),
        }
        Some(self.dispatch(slave_id, request))
    }

    fn dispatch(
        &self,
        slave: crate::slave::SlaveId,
        request: Request,
    ) -> std::result::Result<Response, ExceptionCode> {
        use Request::*;
        match request {
            ReadCoils(start, count) => {
                check_count(count, MAX_READ_BITS)?;
                check_span(start, count)?;
                self.store
                    .read_bits(slave, RegisterClass::Coil, start, count)
                    .map(Response::ReadCoils)
                    .map_err(internal_failure)
            }
            ReadDiscreteInputs(start, count) => {
                check_count(count, MAX_READ_BITS)?;
                check_span(start, count)?;
                self.store
                    .read_bits(slave, RegisterClass::DiscreteInput, start, count)
                    .map(Response::ReadDiscreteInputs)
                    .map_err(internal_failure)
            }
            ReadHoldingRegisters(start, count) => {
                check_count(count, MAX_READ_WORDS)?;
                check_span(start, count)?;
                self.store
                    .read_words(slave, RegisterClass::HoldingRegister, start, count)
                    .map(Response::ReadHoldingRegisters)
                    .map_err(internal_failure)
            }
            ReadInputRegisters(start, count) => {
                check_count(count, MAX_READ_WORDS)?;
                check_span(start, count)?;
                self.store
                    .read_words(slave, RegisterClass::InputRegister, start, count)
                    .map(Response::ReadInputRegisters)
                    .map_err(internal_failure)
            }
            WriteSingleCoil(address, value) => {
                self.store
                    .set_coil(slave, address, value)
                    .map_err(internal_failure)?;
                Ok(Response::WriteSingleCoil(address, value))
            }
            WriteSingleRegister(address, value) => {
                self.store
                    .set_holding_register(slave, address, value)
                    .map_err(internal_failure)?;
                Ok(Response::WriteSingleRegister(address, value))
            }
            WriteMultipleCoils(start, values) => {
                let count = quantity_of(&values)?;
                check_count(count, MAX_WRITE_BITS)?;
                check_span(start, count)?;
                self.store
                    .write_bits(slave, RegisterClass::Coil, start, &values)
                    .map_err(internal_failure)?;
                Ok(Response::WriteMultipleCoils(start, count))
            }
            WriteMultipleRegisters(start, values) => {
                let count = quantity_of(&values)?;
                check_count(count, MAX_WRITE_WORDS)?;
                check_span(start, count)?;
                self.store
                    .write_words(slave, RegisterClass::HoldingRegister, start, &values)
                    .map_err(internal_failure)?;
                Ok(Response::WriteMultipleRegisters(start, count))
            }
            ReadDeviceInfo(category, starting_object) => {
                self.device_info(category, starting_object)
            }
        }
    }

    fn device_info(
        &self,
        category: DeviceInfoCategory,
        starting_object: DeviceInfoObjectId,
    ) -> std::result::Result<Response, ExceptionCode> {
        if category == DeviceInfoCategory::Individual {
            let value = self
                .identity
                .object(starting_object)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            return Ok(Response::ReadDeviceInfo(DeviceInfoResponse {
                category,
                conformity_level: CONFORMITY_INDIVIDUAL
                    | DeviceInfoCategory::Extended.value(),
                more_follows: false,
                next_object_id: 0,
                objects: vec![info_object(starting_object, value)],
            }));
        }

        // Stream access: serve from the requested object onwards, or from
        // the first object if the requested id is past the end.
        let mut from = starting_object;
        if !self
            .identity
            .stream_objects(category)
            .any(|(id, _)| id >= from)
        {
            from = object_id::VENDOR_NAME;
        }

        let mut objects = Vec::new();
        let mut more_follows = false;
        let mut next_object_id = 0;
        let mut used = 0;
        for (id, value) in self.identity.stream_objects(category) {
            if id < from {
                continue;
            }
            if !objects.is_empty() && used + 2 + value.len() > OBJECT_BYTE_BUDGET {
                more_follows = true;
                next_object_id = id;
                break;
            }
            used += 2 + value.len();
            objects.push(info_object(id, value));
        }

        Ok(Response::ReadDeviceInfo(DeviceInfoResponse {
            category,
            conformity_level: category.value(),
            more_follows,
            next_object_id,
            objects,
        }))
    }
}

#[async_trait]
impl Service for StoreService {
    async fn call(
        &self,
        slave: Slave,
        request: Request,
    ) -> Option<std::result::Result<Response, ExceptionCode>> {
        self.handle(slave, request)
    }

    fn accepts(&self, slave: Slave) -> bool {
        self.store.contains_device(slave.into()).unwrap_or(false)
    }
}

fn info_object(id: DeviceInfoObjectId, value: &str) -> DeviceInfoObject {
    DeviceInfoObject {
        id,
        value: value.as_bytes().to_vec(),
    }
}

fn internal_failure(err: crate::Error) -> ExceptionCode {
    log::error!("Register store failure: {err}");
    ExceptionCode::SlaveDeviceFailure
}

pub(crate) fn check_count(
    count: Quantity,
    max: Quantity,
) -> std::result::Result<(), ExceptionCode> {
    if count == 0 || count > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

pub(crate) fn check_span(
    start: Address,
    count: Quantity,
) -> std::result::Result<(), ExceptionCode> {
    if u32::from(start) + u32::from(count) > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

fn quantity_of<T>(values: &[T]) -> std::result::Result<Quantity, ExceptionCode> {
    Quantity::try_from(values.len()).map_err(|_| ExceptionCode::IllegalDataValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_device(slave: crate::slave::SlaveId) -> StoreService {
        let store = Arc::new(DeviceStore::new());
        store.add_device(slave).unwrap();
        StoreService::new(store)
    }

    #[tokio::test]
    async fn unknown_device_is_silently_dropped() {
        let service = service_with_device(1);
        let rsp = service.call(Slave(9), Request::ReadCoils(0, 1)).await;
        assert!(rsp.is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let service = service_with_device(1);

        let rsp = service
            .call(
                Slave(1),
                Request::WriteMultipleRegisters(0x0010, vec![0x0001, 0x0002]),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp, Response::WriteMultipleRegisters(0x0010, 2));

        let rsp = service
            .call(Slave(1), Request::ReadHoldingRegisters(0x0010, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rsp, Response::ReadHoldingRegisters(vec![0x0001, 0x0002]));
    }

    #[tokio::test]
    async fn read_returns_exactly_count_elements_in_order() {
        let service = service_with_device(1);
        service.store().set_holding_register(1, 7, 0x0700).unwrap();
        service.store().set_holding_register(1, 9, 0x0900).unwrap();

        let rsp = service
            .call(Slave(1), Request::ReadHoldingRegisters(6, 5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rsp,
            Response::ReadHoldingRegisters(vec![0, 0x0700, 0, 0x0900, 0])
        );
    }

    #[tokio::test]
    async fn scattered_coils_pack_into_expected_bits() {
        let service = service_with_device(1);
        for addr in [1, 3, 4, 7, 10] {
            service.store().set_coil(1, addr, true).unwrap();
        }

        let rsp = service
            .call(Slave(1), Request::ReadCoils(0, 11))
            .await
            .unwrap()
            .unwrap();
        let Response::ReadCoils(coils) = rsp else {
            panic!("unexpected response");
        };
        assert_eq!(crate::codec::pack_coils(&coils), &[0x9A, 0x04]);
    }

    #[tokio::test]
    async fn count_limits() {
        let service = service_with_device(1);
        for (request, expected) in [
            (Request::ReadCoils(0, 0), ExceptionCode::IllegalDataValue),
            (Request::ReadCoils(0, 2001), ExceptionCode::IllegalDataValue),
            (Request::ReadDiscreteInputs(0, 2001), ExceptionCode::IllegalDataValue),
            (Request::ReadHoldingRegisters(0, 126), ExceptionCode::IllegalDataValue),
            (Request::ReadInputRegisters(0, 0), ExceptionCode::IllegalDataValue),
            (
                Request::WriteMultipleCoils(0, vec![false; 1969]),
                ExceptionCode::IllegalDataValue,
            ),
            (
                Request::WriteMultipleRegisters(0, vec![0; 124]),
                ExceptionCode::IllegalDataValue,
            ),
            (Request::WriteMultipleRegisters(0, vec![]), ExceptionCode::IllegalDataValue),
        ] {
            let rsp = service.call(Slave(1), request).await.unwrap();
            assert_eq!(rsp.unwrap_err(), expected);
        }

        // Exactly at the limits is fine.
        assert!(service
            .call(Slave(1), Request::ReadCoils(0, 2000))
            .await
            .unwrap()
            .is_ok());
        assert!(service
            .call(Slave(1), Request::ReadHoldingRegisters(0, 125))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn address_overflow_is_an_address_error() {
        let service = service_with_device(1);
        let rsp = service
            .call(Slave(1), Request::ReadHoldingRegisters(0xFFFF, 2))
            .await
            .unwrap();
        assert_eq!(rsp.unwrap_err(), ExceptionCode::IllegalDataAddress);

        // The last addressable span is fine.
        let rsp = service
            .call(Slave(1), Request::ReadHoldingRegisters(0xFFFF, 1))
            .await
            .unwrap();
        assert!(rsp.is_ok());
    }

    #[tokio::test]
    async fn device_info_basic_category() {
        let store = Arc::new(DeviceStore::new());
        store.add_device(1).unwrap();
        let identity = DeviceIdentity {
            vendor_name: "acme".into(),
            product_code: "MB-1".into(),
            revision: "1.2.3".into(),
            product_name: Some("Bridge".into()),
            ..DeviceIdentity::default()
        };
        let service = StoreService::with_identity(store, identity);

        let rsp = service
            .call(
                Slave(1),
                Request::ReadDeviceInfo(DeviceInfoCategory::Basic, 0),
            )
            .await
            .unwrap()
            .unwrap();
        let Response::ReadDeviceInfo(info) = rsp else {
            panic!("unexpected response");
        };
        assert_eq!(info.conformity_level, 0x01);
        assert!(!info.more_follows);
        assert_eq!(
            info.objects.iter().map(|o| o.id).collect::<Vec<_>>(),
            vec![0x00, 0x01, 0x02]
        );
        assert_eq!(info.objects[0].to_string_lossy(), "acme");
    }

    #[tokio::test]
    async fn device_info_regular_includes_optional_objects() {
        let store = Arc::new(DeviceStore::new());
        store.add_device(1).unwrap();
        let identity = DeviceIdentity {
            product_name: Some("Bridge".into()),
            ..DeviceIdentity::default()
        };
        let service = StoreService::with_identity(store, identity);

        let rsp = service
            .call(
                Slave(1),
                Request::ReadDeviceInfo(DeviceInfoCategory::Regular, 0),
            )
            .await
            .unwrap()
            .unwrap();
        let Response::ReadDeviceInfo(info) = rsp else {
            panic!("unexpected response");
        };
        // Absent optional objects are skipped, present ones are included.
        assert_eq!(
            info.objects.iter().map(|o| o.id).collect::<Vec<_>>(),
            vec![0x00, 0x01, 0x02, 0x04]
        );
    }

    #[tokio::test]
    async fn device_info_individual_access() {
        let service = service_with_device(1);

        let rsp = service
            .call(
                Slave(1),
                Request::ReadDeviceInfo(DeviceInfoCategory::Individual, 0x02),
            )
            .await
            .unwrap()
            .unwrap();
        let Response::ReadDeviceInfo(info) = rsp else {
            panic!("unexpected response");
        };
        assert_eq!(info.conformity_level, 0x83);
        assert_eq!(info.objects.len(), 1);
        assert_eq!(info.objects[0].id, 0x02);

        // Unsupported individual object.
        let rsp = service
            .call(
                Slave(1),
                Request::ReadDeviceInfo(DeviceInfoCategory::Individual, 0x05),
            )
            .await
            .unwrap();
        assert_eq!(rsp.unwrap_err(), ExceptionCode::IllegalDataAddress);
    }

    #[tokio::test]
    async fn device_info_continuation_when_over_budget() {
        let store = Arc::new(DeviceStore::new());
        store.add_device(1).unwrap();
        let identity = DeviceIdentity {
            vendor_name: "v".repeat(120),
            product_code: "p".repeat(120),
            revision: "r".repeat(120),
            ..DeviceIdentity::default()
        };
        let service = StoreService::with_identity(store, identity);

        let rsp = service
            .call(
                Slave(1),
                Request::ReadDeviceInfo(DeviceInfoCategory::Basic, 0),
            )
            .await
            .unwrap()
            .unwrap();
        let Response::ReadDeviceInfo(info) = rsp else {
            panic!("unexpected response");
        };
        assert!(info.more_follows);
        assert_eq!(info.next_object_id, 0x02);
        assert_eq!(info.objects.len(), 2);

        // The follow-up request picks up where the first response stopped.
        let rsp = service
            .call(
                Slave(1),
                Request::ReadDeviceInfo(DeviceInfoCategory::Basic, 0x02),
            )
            .await
            .unwrap()
            .unwrap();
        let Response::ReadDeviceInfo(info) = rsp else {
            panic!("unexpected response");
        };
        assert!(!info.more_follows);
        assert_eq!(info.objects.len(), 1);
        assert_eq!(info.objects[0].id, 0x02);
    }
}
