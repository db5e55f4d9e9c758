// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device identification via the encapsulated interface (function 0x2B).

use std::fmt;

/// MEI type for "Read Device Identification".
pub(crate) const MEI_TYPE_READ_DEVICE_ID: u8 = 0x0E;

/// Identifies one device-identification object.
pub type DeviceInfoObjectId = u8;

/// Well-known device-identification object ids.
pub mod object_id {
    use super::DeviceInfoObjectId;

    pub const VENDOR_NAME: DeviceInfoObjectId = 0x00;
    pub const PRODUCT_CODE: DeviceInfoObjectId = 0x01;
    pub const MAJOR_MINOR_REVISION: DeviceInfoObjectId = 0x02;
    pub const VENDOR_URL: DeviceInfoObjectId = 0x03;
    pub const PRODUCT_NAME: DeviceInfoObjectId = 0x04;
    pub const MODEL_NAME: DeviceInfoObjectId = 0x05;
    pub const USER_APPLICATION_NAME: DeviceInfoObjectId = 0x06;
}

/// Object ids `0x07..=0x7F` are reserved; everything else is either a
/// standard object or lies in the extended (device specific) range.
#[must_use]
pub(crate) const fn is_valid_object_id(id: DeviceInfoObjectId) -> bool {
    id <= object_id::USER_APPLICATION_NAME || id >= 0x80
}

/// Read-device-identification access category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceInfoCategory {
    /// Stream access to the mandatory objects (vendor name, product code,
    /// revision).
    Basic = 0x01,
    /// Stream access to the regular objects.
    Regular = 0x02,
    /// Stream access to the extended objects.
    Extended = 0x03,
    /// Access to one individual object.
    Individual = 0x04,
}

impl DeviceInfoCategory {
    /// Look up the category for a raw code byte.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Basic),
            0x02 => Some(Self::Regular),
            0x03 => Some(Self::Extended),
            0x04 => Some(Self::Individual),
            _ => None,
        }
    }

    /// The raw code byte of the category.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DeviceInfoCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basic => "basic",
            Self::Regular => "regular",
            Self::Extended => "extended",
            Self::Individual => "individual",
        };
        f.write_str(name)
    }
}

/// One device-identification object as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoObject {
    /// The object id.
    pub id: DeviceInfoObjectId,
    /// The raw object value (UTF-8 for the standard string objects).
    pub value: Vec<u8>,
}

impl DeviceInfoObject {
    /// The object value interpreted as UTF-8, with invalid sequences
    /// replaced.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// The payload of a successful read-device-identification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoResponse {
    /// The access category this response answers.
    pub category: DeviceInfoCategory,
    /// Conformity level reported by the device, `0x8x` if individual
    /// access is supported.
    pub conformity_level: u8,
    /// `true` if not all objects fit into this response and another
    /// request starting at [`Self::next_object_id`] is needed.
    pub more_follows: bool,
    /// First object id of the continuation, `0` if none is needed.
    pub next_object_id: DeviceInfoObjectId,
    /// The returned objects, in ascending id order.
    pub objects: Vec<DeviceInfoObject>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trip() {
        for value in 0x01..=0x04 {
            assert_eq!(DeviceInfoCategory::new(value).unwrap().value(), value);
        }
        assert_eq!(DeviceInfoCategory::new(0x00), None);
        assert_eq!(DeviceInfoCategory::new(0x05), None);
    }

    #[test]
    fn object_id_ranges() {
        assert!(is_valid_object_id(0x00));
        assert!(is_valid_object_id(0x06));
        assert!(!is_valid_object_id(0x07));
        assert!(!is_valid_object_id(0x7F));
        assert!(is_valid_object_id(0x80));
        assert!(is_valid_object_id(0xFF));
    }
}
