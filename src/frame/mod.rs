// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

pub(crate) mod mei;

#[cfg(feature = "rtu")]
pub(crate) mod rtu;

#[cfg(feature = "tcp")]
pub(crate) mod tcp;

use std::{error, fmt};

use self::mei::{DeviceInfoCategory, DeviceInfoObjectId, DeviceInfoResponse};

/// A Modbus protocol address is represented by 16 bit from `0` to `65535`.
///
/// This *protocol address* uses 0-based indexing, while the *coil address*
/// or *register address* is often specified with 1-based indexing. Consult
/// the documentation of your devices if 1-based addresses need to be
/// converted by subtracting 1.
pub type Address = u16;

/// A Coil represents a single bit.
///
/// - `true` is equivalent to `ON`, `1` and `0xFF00`.
/// - `false` is equivalent to `OFF`, `0` and `0x0000`.
pub type Coil = bool;

/// Modbus uses 16 bit for its data items (big-endian representation).
pub type Word = u16;

/// Number of items to process (`0` - `65535`).
pub type Quantity = u16;

/// Maximum number of coils or discrete inputs in a single read.
pub const MAX_READ_BITS: Quantity = 2000;

/// Maximum number of registers in a single read.
pub const MAX_READ_WORDS: Quantity = 125;

/// Maximum number of coils in a single multi-write.
pub const MAX_WRITE_BITS: Quantity = 1968;

/// Maximum number of registers in a single multi-write.
pub const MAX_WRITE_WORDS: Quantity = 123;

/// A Modbus function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 0x01
    ReadCoils,
    /// 0x02
    ReadDiscreteInputs,
    /// 0x03
    ReadHoldingRegisters,
    /// 0x04
    ReadInputRegisters,
    /// 0x05
    WriteSingleCoil,
    /// 0x06
    WriteSingleRegister,
    /// 0x0F
    WriteMultipleCoils,
    /// 0x10
    WriteMultipleRegisters,
    /// 0x2B
    EncapsulatedInterface,
}

impl FunctionCode {
    /// Look up the function for a raw code byte.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x2B => Some(Self::EncapsulatedInterface),
            _ => None,
        }
    }

    /// The raw code byte of the function.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::EncapsulatedInterface => 0x2B,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:0>2X}", self.value())
    }
}

/// A request represents a message from the client (master) to the
/// server (slave).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Vec<Coil>),
    WriteMultipleRegisters(Address, Vec<Word>),
    /// Read device-identification objects through the encapsulated
    /// interface (function 0x2B, MEI type 0x0E), starting at the given
    /// object id.
    ReadDeviceInfo(DeviceInfoCategory, DeviceInfoObjectId),
}

impl Request {
    /// The function code of this request.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils(_, _) => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs(_, _) => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters(_, _) => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters(_, _) => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil(_, _) => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister(_, _) => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils(_, _) => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters(_, _) => FunctionCode::WriteMultipleRegisters,
            Self::ReadDeviceInfo(_, _) => FunctionCode::EncapsulatedInterface,
        }
    }
}

/// The data of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The length of the result vector is always a multiple of 8; only the
    /// first bits that have actually been requested are defined and the
    /// remaining padding bits should be ignored.
    ReadCoils(Vec<Coil>),
    /// See [`Response::ReadCoils`] regarding padding bits.
    ReadDiscreteInputs(Vec<Coil>),
    ReadHoldingRegisters(Vec<Word>),
    ReadInputRegisters(Vec<Word>),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Quantity),
    WriteMultipleRegisters(Address, Quantity),
    ReadDeviceInfo(DeviceInfoResponse),
}

impl Response {
    /// The function code of this response.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils(_) => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil(_, _) => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister(_, _) => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils(_, _) => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters(_, _) => FunctionCode::WriteMultipleRegisters,
            Self::ReadDeviceInfo(_) => FunctionCode::EncapsulatedInterface,
        }
    }
}

/// A server (slave) exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl ExceptionCode {
    /// Look up the exception for a raw code byte.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::SlaveDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::SlaveDeviceBusy),
            0x07 => Some(Self::NegativeAcknowledge),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetDevice),
            _ => None,
        }
    }

    /// The raw code byte of the exception.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::SlaveDeviceFailure => "Slave device failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave device busy",
            Self::NegativeAcknowledge => "Negative acknowledge",
            Self::MemoryParityError => "Memory parity error",
            Self::GatewayPathUnavailable => "Gateway path unavailable",
            Self::GatewayTargetDevice => "Gateway target device failed to respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl error::Error for ExceptionCode {}

/// A server (slave) exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// The raw code of the function the exception refers to.
    ///
    /// Kept as a plain byte so that a rejected request with an unknown
    /// function code can still be echoed on the wire.
    pub function: u8,
    /// The reported exception.
    pub exception: ExceptionCode,
}

impl ExceptionResponse {
    pub(crate) const fn new(function: FunctionCode, exception: ExceptionCode) -> Self {
        Self {
            function: function.value(),
            exception,
        }
    }
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Modbus function 0x{:0>2X}: {}",
            self.function, self.exception
        )
    }
}

impl error::Error for ExceptionResponse {}

/// Represents a message from the client (master) to the server (slave).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestPdu(pub(crate) Request);

impl From<Request> for RequestPdu {
    fn from(from: Request) -> Self {
        RequestPdu(from)
    }
}

impl From<RequestPdu> for Request {
    fn from(from: RequestPdu) -> Self {
        from.0
    }
}

/// Represents a message from the server (slave) to the client (master).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponsePdu(pub(crate) Result<Response, ExceptionResponse>);

impl From<Response> for ResponsePdu {
    fn from(from: Response) -> Self {
        ResponsePdu(Ok(from))
    }
}

impl From<ExceptionResponse> for ResponsePdu {
    fn from(from: ExceptionResponse) -> Self {
        ResponsePdu(Err(from))
    }
}

impl From<Result<Response, ExceptionResponse>> for ResponsePdu {
    fn from(from: Result<Response, ExceptionResponse>) -> Self {
        ResponsePdu(from)
    }
}

impl From<ResponsePdu> for Result<Response, ExceptionResponse> {
    fn from(from: ResponsePdu) -> Self {
        from.0
    }
}
