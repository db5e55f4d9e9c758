// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed access to raw register payloads.
//!
//! Modbus itself only moves 16-bit words; applications routinely spread
//! wider values over consecutive registers. [`DataBuffer`] provides
//! bounds-checked typed accessors over such a byte image with a
//! configurable byte order. The wire is always big-endian, so that is the
//! default.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

use crate::{Error, Result};

/// Byte order applied by the typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Most significant byte first (Modbus wire order).
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

/// A growable byte buffer with typed, bounds-checked accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataBuffer {
    data: Vec<u8>,
    endianness: Endianness,
}

macro_rules! numeric_accessors {
    ($get:ident, $set:ident, $add:ident, $ty:ty, $read:ident, $write:ident, $size:expr) => {
        #[doc = concat!("Read a `", stringify!($ty), "` at the given byte offset.")]
        pub fn $get(&self, index: usize) -> Result<$ty> {
            let bytes = self.slice(index, $size)?;
            Ok(match self.endianness {
                Endianness::Big => BigEndian::$read(bytes),
                Endianness::Little => LittleEndian::$read(bytes),
            })
        }

        #[doc = concat!("Overwrite a `", stringify!($ty), "` at the given byte offset.")]
        pub fn $set(&mut self, index: usize, value: $ty) -> Result<()> {
            let endianness = self.endianness;
            let bytes = self.slice_mut(index, $size)?;
            match endianness {
                Endianness::Big => BigEndian::$write(bytes, value),
                Endianness::Little => LittleEndian::$write(bytes, value),
            }
            Ok(())
        }

        #[doc = concat!("Append a `", stringify!($ty), "` at the end of the buffer.")]
        pub fn $add(&mut self, value: $ty) {
            let mut bytes = [0; $size];
            match self.endianness {
                Endianness::Big => BigEndian::$write(&mut bytes, value),
                Endianness::Little => LittleEndian::$write(&mut bytes, value),
            }
            self.data.extend_from_slice(&bytes);
        }
    };
}

impl DataBuffer {
    /// Create an empty buffer with big-endian (wire order) accessors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with the given byte order.
    #[must_use]
    pub fn with_endianness(endianness: Endianness) -> Self {
        Self {
            data: Vec::new(),
            endianness,
        }
    }

    /// Wrap existing bytes, e.g. the data block of a read response.
    #[must_use]
    pub fn from_bytes(data: impl Into<Vec<u8>>, endianness: Endianness) -> Self {
        Self {
            data: data.into(),
            endianness,
        }
    }

    /// The configured byte order.
    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Number of bytes in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` if the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer and return the raw bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn slice(&self, index: usize, len: usize) -> Result<&[u8]> {
        index
            .checked_add(len)
            .and_then(|end| self.data.get(index..end))
            .ok_or_else(|| out_of_bounds(index, len, self.data.len()))
    }

    fn slice_mut(&mut self, index: usize, len: usize) -> Result<&mut [u8]> {
        let buf_len = self.data.len();
        index
            .checked_add(len)
            .and_then(|end| self.data.get_mut(index..end))
            .ok_or_else(|| out_of_bounds(index, len, buf_len))
    }

    /// Read a `u8` at the given byte offset.
    pub fn get_u8(&self, index: usize) -> Result<u8> {
        Ok(self.slice(index, 1)?[0])
    }

    /// Overwrite a `u8` at the given byte offset.
    pub fn set_u8(&mut self, index: usize, value: u8) -> Result<()> {
        self.slice_mut(index, 1)?[0] = value;
        Ok(())
    }

    /// Append a `u8` at the end of the buffer.
    pub fn add_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Read an `i8` at the given byte offset.
    pub fn get_i8(&self, index: usize) -> Result<i8> {
        Ok(self.get_u8(index)? as i8)
    }

    /// Overwrite an `i8` at the given byte offset.
    pub fn set_i8(&mut self, index: usize, value: i8) -> Result<()> {
        self.set_u8(index, value as u8)
    }

    /// Append an `i8` at the end of the buffer.
    pub fn add_i8(&mut self, value: i8) {
        self.add_u8(value as u8);
    }

    numeric_accessors!(get_u16, set_u16, add_u16, u16, read_u16, write_u16, 2);
    numeric_accessors!(get_u32, set_u32, add_u32, u32, read_u32, write_u32, 4);
    numeric_accessors!(get_u64, set_u64, add_u64, u64, read_u64, write_u64, 8);
    numeric_accessors!(get_i16, set_i16, add_i16, i16, read_i16, write_i16, 2);
    numeric_accessors!(get_i32, set_i32, add_i32, i32, read_i32, write_i32, 4);
    numeric_accessors!(get_i64, set_i64, add_i64, i64, read_i64, write_i64, 8);
    numeric_accessors!(get_f32, set_f32, add_f32, f32, read_f32, write_f32, 4);
    numeric_accessors!(get_f64, set_f64, add_f64, f64, read_f64, write_f64, 8);

    /// Read `len` bytes at the given offset as a UTF-8 string.
    pub fn get_string(&self, index: usize, len: usize) -> Result<String> {
        let bytes = self.slice(index, len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::InvalidArgument(format!("not valid UTF-8: {err}")))
    }

    /// Overwrite bytes at the given offset with a UTF-8 string.
    ///
    /// The string must fit into the existing buffer.
    pub fn set_string(&mut self, index: usize, value: &str) -> Result<()> {
        let bytes = self.slice_mut(index, value.len())?;
        bytes.copy_from_slice(value.as_bytes());
        Ok(())
    }

    /// Append a UTF-8 string at the end of the buffer.
    pub fn add_string(&mut self, value: &str) {
        self.data.extend_from_slice(value.as_bytes());
    }
}

fn out_of_bounds(index: usize, len: usize, buf_len: usize) -> Error {
    Error::InvalidArgument(format!(
        "{len} byte(s) at offset {index} exceed buffer length {buf_len}"
    ))
}
