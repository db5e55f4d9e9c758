// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure PDU codecs shared by both transports.
//!
//! Framing (CRC trailer, MBAP header) lives in the transport submodules;
//! everything here converts between typed requests/responses and the
//! function-code-plus-payload bytes of a PDU.

#[cfg(feature = "rtu")]
pub(crate) mod rtu;

#[cfg(feature = "tcp")]
pub(crate) mod tcp;

use std::io::{Cursor, Error, ErrorKind, Read as _, Result};

use byteorder::{BigEndian, ReadBytesExt as _};
use bytes::{BufMut as _, Bytes, BytesMut};

use crate::frame::{
    mei::{
        is_valid_object_id, DeviceInfoCategory, DeviceInfoObject, DeviceInfoResponse,
        MEI_TYPE_READ_DEVICE_ID,
    },
    Coil, ExceptionCode, ExceptionResponse, FunctionCode, Quantity, Request, RequestPdu,
    Response, ResponsePdu,
};

/// Sentinel values of the single-coil write payload.
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

pub(crate) fn bool_to_coil(state: bool) -> u16 {
    if state {
        COIL_ON
    } else {
        COIL_OFF
    }
}

fn coil_to_bool(coil: u16) -> Option<bool> {
    match coil {
        COIL_ON => Some(true),
        COIL_OFF => Some(false),
        _ => None,
    }
}

pub(crate) const fn packed_coils_len(bit_count: usize) -> usize {
    (bit_count + 7) / 8
}

/// Pack coil states LSB-first: element `i` occupies bit `i % 8` of
/// byte `i / 8`.
pub(crate) fn pack_coils(coils: &[Coil]) -> Vec<u8> {
    let mut packed = vec![0; packed_coils_len(coils.len())];
    for (i, coil) in coils.iter().enumerate() {
        if *coil {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

pub(crate) fn unpack_coils(bytes: &[u8], count: Quantity) -> Vec<Coil> {
    let mut coils = Vec::with_capacity(count.into());
    for i in 0..usize::from(count) {
        coils.push((bytes[i / 8] >> (i % 8)) & 0b1 > 0);
    }
    coils
}

fn decode_err(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidData, msg.into())
}

/// Fail if a PDU carries bytes beyond its function-specific layout.
fn ensure_consumed(rdr: &Cursor<&Bytes>) -> Result<()> {
    let len = rdr.get_ref().len() as u64;
    if rdr.position() != len {
        return Err(decode_err(format!(
            "Overlong PDU: {} trailing byte(s)",
            len - rdr.position()
        )));
    }
    Ok(())
}

fn request_byte_count(req: &Request) -> usize {
    use crate::frame::Request::*;
    match *req {
        ReadCoils(_, _)
        | ReadDiscreteInputs(_, _)
        | ReadHoldingRegisters(_, _)
        | ReadInputRegisters(_, _)
        | WriteSingleCoil(_, _)
        | WriteSingleRegister(_, _) => 5,
        WriteMultipleCoils(_, ref coils) => 6 + packed_coils_len(coils.len()),
        WriteMultipleRegisters(_, ref words) => 6 + words.len() * 2,
        ReadDeviceInfo(_, _) => 4,
    }
}

fn response_byte_count(rsp: &Response) -> usize {
    use crate::frame::Response::*;
    match *rsp {
        ReadCoils(ref coils) | ReadDiscreteInputs(ref coils) => {
            2 + packed_coils_len(coils.len())
        }
        ReadHoldingRegisters(ref words) | ReadInputRegisters(ref words) => 2 + words.len() * 2,
        WriteSingleCoil(_, _)
        | WriteSingleRegister(_, _)
        | WriteMultipleCoils(_, _)
        | WriteMultipleRegisters(_, _) => 5,
        ReadDeviceInfo(ref info) => {
            7 + info
                .objects
                .iter()
                .map(|obj| 2 + obj.value.len())
                .sum::<usize>()
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
impl From<Request> for Bytes {
    fn from(req: Request) -> Bytes {
        use crate::frame::Request::*;
        let mut data = BytesMut::with_capacity(request_byte_count(&req));
        data.put_u8(req.function_code().value());
        match req {
            ReadCoils(address, quantity)
            | ReadDiscreteInputs(address, quantity)
            | ReadHoldingRegisters(address, quantity)
            | ReadInputRegisters(address, quantity) => {
                data.put_u16(address);
                data.put_u16(quantity);
            }
            WriteSingleCoil(address, state) => {
                data.put_u16(address);
                data.put_u16(bool_to_coil(state));
            }
            WriteSingleRegister(address, word) => {
                data.put_u16(address);
                data.put_u16(word);
            }
            WriteMultipleCoils(address, coils) => {
                data.put_u16(address);
                data.put_u16(coils.len() as u16);
                let packed = pack_coils(&coils);
                data.put_u8(packed.len() as u8);
                data.put_slice(&packed);
            }
            WriteMultipleRegisters(address, words) => {
                data.put_u16(address);
                data.put_u16(words.len() as u16);
                data.put_u8((words.len() * 2) as u8);
                for word in words {
                    data.put_u16(word);
                }
            }
            ReadDeviceInfo(category, object_id) => {
                data.put_u8(MEI_TYPE_READ_DEVICE_ID);
                data.put_u8(category.value());
                data.put_u8(object_id);
            }
        }
        data.freeze()
    }
}

impl From<RequestPdu> for Bytes {
    fn from(pdu: RequestPdu) -> Bytes {
        pdu.0.into()
    }
}

#[allow(clippy::cast_possible_truncation)]
impl From<Response> for Bytes {
    fn from(rsp: Response) -> Bytes {
        use crate::frame::Response::*;
        let mut data = BytesMut::with_capacity(response_byte_count(&rsp));
        data.put_u8(rsp.function_code().value());
        match rsp {
            ReadCoils(coils) | ReadDiscreteInputs(coils) => {
                let packed = pack_coils(&coils);
                data.put_u8(packed.len() as u8);
                data.put_slice(&packed);
            }
            ReadHoldingRegisters(words) | ReadInputRegisters(words) => {
                data.put_u8((words.len() * 2) as u8);
                for word in words {
                    data.put_u16(word);
                }
            }
            WriteSingleCoil(address, state) => {
                data.put_u16(address);
                data.put_u16(bool_to_coil(state));
            }
            WriteSingleRegister(address, word) => {
                data.put_u16(address);
                data.put_u16(word);
            }
            WriteMultipleCoils(address, quantity) | WriteMultipleRegisters(address, quantity) => {
                data.put_u16(address);
                data.put_u16(quantity);
            }
            ReadDeviceInfo(info) => {
                data.put_u8(MEI_TYPE_READ_DEVICE_ID);
                data.put_u8(info.category.value());
                data.put_u8(info.conformity_level);
                data.put_u8(if info.more_follows { 0xFF } else { 0x00 });
                data.put_u8(info.next_object_id);
                data.put_u8(info.objects.len() as u8);
                for obj in info.objects {
                    data.put_u8(obj.id);
                    data.put_u8(obj.value.len() as u8);
                    data.put_slice(&obj.value);
                }
            }
        }
        data.freeze()
    }
}

impl From<ExceptionResponse> for Bytes {
    fn from(ex: ExceptionResponse) -> Bytes {
        let mut data = BytesMut::with_capacity(2);
        debug_assert!(ex.function < 0x80);
        data.put_u8(ex.function | 0x80);
        data.put_u8(ex.exception.value());
        data.freeze()
    }
}

impl From<ResponsePdu> for Bytes {
    fn from(pdu: ResponsePdu) -> Bytes {
        pdu.0.map_or_else(Into::into, Into::into)
    }
}

/// Decode a request PDU, separating framing from semantics.
///
/// A structurally broken PDU is an error. A well-framed request carrying a
/// semantically invalid field (unknown function, bad coil sentinel, a
/// byte count that contradicts the element count, an invalid MEI field)
/// decodes to the exception a server has to answer with.
pub(crate) fn decode_request(bytes: &Bytes) -> Result<std::result::Result<Request, ExceptionResponse>> {
    use crate::frame::Request::*;

    let mut rdr = Cursor::new(bytes);
    let fn_code = rdr.read_u8()?;
    let req = match fn_code {
        0x01..=0x04 => {
            let address = rdr.read_u16::<BigEndian>()?;
            let quantity = rdr.read_u16::<BigEndian>()?;
            ensure_consumed(&rdr)?;
            match fn_code {
                0x01 => ReadCoils(address, quantity),
                0x02 => ReadDiscreteInputs(address, quantity),
                0x03 => ReadHoldingRegisters(address, quantity),
                0x04 => ReadInputRegisters(address, quantity),
                _ => unreachable!(),
            }
        }
        0x05 => {
            let address = rdr.read_u16::<BigEndian>()?;
            let raw = rdr.read_u16::<BigEndian>()?;
            ensure_consumed(&rdr)?;
            let Some(state) = coil_to_bool(raw) else {
                return Ok(Err(ExceptionResponse::new(
                    FunctionCode::WriteSingleCoil,
                    ExceptionCode::IllegalDataValue,
                )));
            };
            WriteSingleCoil(address, state)
        }
        0x06 => {
            let address = rdr.read_u16::<BigEndian>()?;
            let word = rdr.read_u16::<BigEndian>()?;
            ensure_consumed(&rdr)?;
            WriteSingleRegister(address, word)
        }
        0x0F => {
            let address = rdr.read_u16::<BigEndian>()?;
            let quantity = rdr.read_u16::<BigEndian>()?;
            let byte_count = rdr.read_u8()?;
            let mut data = vec![0; byte_count.into()];
            rdr.read_exact(&mut data)
                .map_err(|_| decode_err("Truncated coil data"))?;
            ensure_consumed(&rdr)?;
            if usize::from(byte_count) != packed_coils_len(quantity.into()) {
                return Ok(Err(ExceptionResponse::new(
                    FunctionCode::WriteMultipleCoils,
                    ExceptionCode::IllegalDataValue,
                )));
            }
            WriteMultipleCoils(address, unpack_coils(&data, quantity))
        }
        0x10 => {
            let address = rdr.read_u16::<BigEndian>()?;
            let quantity = rdr.read_u16::<BigEndian>()?;
            let byte_count = rdr.read_u8()?;
            if bytes.len() < 6 + usize::from(byte_count) {
                return Err(decode_err("Truncated register data"));
            }
            if usize::from(byte_count) != usize::from(quantity) * 2 {
                return Ok(Err(ExceptionResponse::new(
                    FunctionCode::WriteMultipleRegisters,
                    ExceptionCode::IllegalDataValue,
                )));
            }
            let mut words = Vec::with_capacity(quantity.into());
            for _ in 0..quantity {
                words.push(rdr.read_u16::<BigEndian>()?);
            }
            ensure_consumed(&rdr)?;
            WriteMultipleRegisters(address, words)
        }
        0x2B => {
            let mei_type = rdr.read_u8()?;
            let category_raw = rdr.read_u8()?;
            let object_id = rdr.read_u8()?;
            ensure_consumed(&rdr)?;
            if mei_type != MEI_TYPE_READ_DEVICE_ID {
                return Ok(Err(ExceptionResponse::new(
                    FunctionCode::EncapsulatedInterface,
                    ExceptionCode::IllegalFunction,
                )));
            }
            let Some(category) = DeviceInfoCategory::new(category_raw) else {
                return Ok(Err(ExceptionResponse::new(
                    FunctionCode::EncapsulatedInterface,
                    ExceptionCode::IllegalDataValue,
                )));
            };
            if !is_valid_object_id(object_id) {
                return Ok(Err(ExceptionResponse::new(
                    FunctionCode::EncapsulatedInterface,
                    ExceptionCode::IllegalDataAddress,
                )));
            }
            ReadDeviceInfo(category, object_id)
        }
        fn_code if fn_code < 0x80 => {
            return Ok(Err(ExceptionResponse {
                function: fn_code,
                exception: ExceptionCode::IllegalFunction,
            }));
        }
        fn_code => {
            return Err(decode_err(format!(
                "Invalid function code: 0x{fn_code:0>2X}"
            )));
        }
    };
    Ok(Ok(req))
}

impl TryFrom<Bytes> for Request {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self> {
        decode_request(&bytes)?
            .map_err(|ex| decode_err(format!("Unexpected request PDU: {ex}")))
    }
}

impl TryFrom<Bytes> for RequestPdu {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self> {
        Ok(Request::try_from(bytes)?.into())
    }
}

impl TryFrom<Bytes> for Response {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self> {
        use crate::frame::Response::*;

        let mut rdr = Cursor::new(&bytes);
        let fn_code = rdr.read_u8()?;
        let rsp = match fn_code {
            0x01 | 0x02 => {
                let byte_count = rdr.read_u8()?;
                let mut data = vec![0; byte_count.into()];
                rdr.read_exact(&mut data)
                    .map_err(|_| decode_err("Truncated coil data"))?;
                ensure_consumed(&rdr)?;
                // The requested quantity is unknown here, so all padding
                // bits are unpacked as well.
                let quantity = u16::from(byte_count) * 8;
                if fn_code == 0x01 {
                    ReadCoils(unpack_coils(&data, quantity))
                } else {
                    ReadDiscreteInputs(unpack_coils(&data, quantity))
                }
            }
            0x03 | 0x04 => {
                let byte_count = rdr.read_u8()?;
                if byte_count % 2 != 0 {
                    return Err(decode_err(format!("Odd register byte count: {byte_count}")));
                }
                let mut words = Vec::with_capacity(usize::from(byte_count) / 2);
                for _ in 0..byte_count / 2 {
                    words.push(rdr.read_u16::<BigEndian>()?);
                }
                ensure_consumed(&rdr)?;
                if fn_code == 0x03 {
                    ReadHoldingRegisters(words)
                } else {
                    ReadInputRegisters(words)
                }
            }
            0x05 => {
                let address = rdr.read_u16::<BigEndian>()?;
                let raw = rdr.read_u16::<BigEndian>()?;
                ensure_consumed(&rdr)?;
                let state = coil_to_bool(raw)
                    .ok_or_else(|| decode_err(format!("Invalid coil value: 0x{raw:0>4X}")))?;
                WriteSingleCoil(address, state)
            }
            0x06 => {
                let address = rdr.read_u16::<BigEndian>()?;
                let word = rdr.read_u16::<BigEndian>()?;
                ensure_consumed(&rdr)?;
                WriteSingleRegister(address, word)
            }
            0x0F | 0x10 => {
                let address = rdr.read_u16::<BigEndian>()?;
                let quantity = rdr.read_u16::<BigEndian>()?;
                ensure_consumed(&rdr)?;
                if fn_code == 0x0F {
                    WriteMultipleCoils(address, quantity)
                } else {
                    WriteMultipleRegisters(address, quantity)
                }
            }
            0x2B => ReadDeviceInfo(decode_device_info(&mut rdr)?),
            fn_code => {
                return Err(decode_err(format!(
                    "Invalid function code: 0x{fn_code:0>2X}"
                )));
            }
        };
        Ok(rsp)
    }
}

fn decode_device_info(rdr: &mut Cursor<&Bytes>) -> Result<DeviceInfoResponse> {
    let mei_type = rdr.read_u8()?;
    if mei_type != MEI_TYPE_READ_DEVICE_ID {
        return Err(decode_err(format!("Invalid MEI type: 0x{mei_type:0>2X}")));
    }
    let category_raw = rdr.read_u8()?;
    let category = DeviceInfoCategory::new(category_raw)
        .ok_or_else(|| decode_err(format!("Invalid device id code: 0x{category_raw:0>2X}")))?;
    let conformity_level = rdr.read_u8()?;
    let more_follows = match rdr.read_u8()? {
        0x00 => false,
        0xFF => true,
        raw => {
            return Err(decode_err(format!(
                "Invalid more-follows marker: 0x{raw:0>2X}"
            )));
        }
    };
    let next_object_id = rdr.read_u8()?;
    let object_count = rdr.read_u8()?;
    let mut objects = Vec::with_capacity(object_count.into());
    for _ in 0..object_count {
        let id = rdr.read_u8()?;
        let len = rdr.read_u8()?;
        let mut value = vec![0; len.into()];
        rdr.read_exact(&mut value)
            .map_err(|_| decode_err("Truncated device identification object"))?;
        objects.push(DeviceInfoObject { id, value });
    }
    ensure_consumed(rdr)?;
    Ok(DeviceInfoResponse {
        category,
        conformity_level,
        more_follows,
        next_object_id,
        objects,
    })
}

impl TryFrom<Bytes> for ExceptionResponse {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self> {
        let mut rdr = Cursor::new(&bytes);
        let fn_err_code = rdr.read_u8()?;
        if fn_err_code < 0x80 {
            return Err(decode_err("Invalid exception function code"));
        }
        let code = rdr.read_u8()?;
        let exception = ExceptionCode::new(code)
            .ok_or_else(|| decode_err(format!("Invalid exception code: 0x{code:0>2X}")))?;
        ensure_consumed(&rdr)?;
        Ok(ExceptionResponse {
            function: fn_err_code - 0x80,
            exception,
        })
    }
}

impl TryFrom<Bytes> for ResponsePdu {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self> {
        let fn_code = Cursor::new(&bytes).read_u8()?;
        let pdu = if fn_code < 0x80 {
            Response::try_from(bytes)?.into()
        } else {
            ExceptionResponse::try_from(bytes)?.into()
        };
        Ok(pdu)
    }
}
