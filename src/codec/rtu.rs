// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Error, ErrorKind, Result};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::decode_request,
    frame::{rtu::*, RequestPdu, ResponsePdu},
    slave::SlaveId,
};

// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
// "The maximum size of a Modbus RTU frame is 256 bytes."
const MAX_FRAME_LEN: usize = 256;

const CRC_BYTE_COUNT: usize = 2;

/// CRC-16 (Modbus): polynomial `0xA001`, initial value `0xFFFF`, no final
/// XOR. The result is emitted low-byte-first on the wire.
pub(crate) fn calc_crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

fn check_crc(adu_data: &[u8], crc_lo: u8, crc_hi: u8) -> Result<()> {
    let expected_crc = u16::from_le_bytes([crc_lo, crc_hi]);
    let actual_crc = calc_crc(adu_data);
    if expected_crc != actual_crc {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid CRC: expected = 0x{expected_crc:0>4X}, actual = 0x{actual_crc:0>4X}"),
        ));
    }
    Ok(())
}

/// Splits complete, CRC-verified frames off the receive buffer and resyncs
/// byte-wise after transmission errors.
#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct FrameDecoder {
    dropped_bytes: usize,
}

impl FrameDecoder {
    fn decode(&mut self, buf: &mut BytesMut, pdu_len: usize) -> Result<Option<(SlaveId, Bytes)>> {
        let adu_len = 1 + pdu_len;
        if buf.len() < adu_len + CRC_BYTE_COUNT {
            // Incomplete frame
            return Ok(None);
        }

        check_crc(&buf[..adu_len], buf[adu_len], buf[adu_len + 1])?;

        if self.dropped_bytes > 0 {
            log::warn!(
                "Successfully decoded frame after dropping {} byte(s)",
                self.dropped_bytes
            );
            self.dropped_bytes = 0;
        }
        let mut adu_buf = buf.split_to(adu_len);
        buf.advance(CRC_BYTE_COUNT);
        let slave_id = adu_buf.split_to(1)[0];
        Ok(Some((slave_id, adu_buf.freeze())))
    }

    fn recover_on_error(&mut self, buf: &mut BytesMut) {
        // If decoding failed the buffer cannot be empty
        debug_assert!(!buf.is_empty());
        log::debug!("Dropped first byte: {:X?}", buf.first().unwrap());
        if self.dropped_bytes >= MAX_FRAME_LEN {
            log::error!(
                "Giving up to decode frame after dropping {} byte(s)",
                self.dropped_bytes
            );
            self.dropped_bytes = 0;
        }
        self.dropped_bytes += 1;
        buf.advance(1);
    }
}

fn get_request_pdu_len(adu_buf: &BytesMut) -> Result<Option<usize>> {
    let Some(fn_code) = adu_buf.get(1) else {
        return Ok(None);
    };
    let len = match fn_code {
        0x01..=0x06 => 5,
        0x0F | 0x10 => {
            return Ok(adu_buf
                .get(6)
                .map(|&byte_count| 6 + usize::from(byte_count)));
        }
        0x2B => 4,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid function code: 0x{fn_code:0>2X}"),
            ));
        }
    };
    Ok(Some(len))
}

fn get_response_pdu_len(adu_buf: &BytesMut) -> Result<Option<usize>> {
    let Some(fn_code) = adu_buf.get(1) else {
        return Ok(None);
    };
    let len = match fn_code {
        0x01..=0x04 => {
            return Ok(adu_buf
                .get(2)
                .map(|&byte_count| 2 + usize::from(byte_count)));
        }
        0x05 | 0x06 | 0x0F | 0x10 => 5,
        0x2B => return get_device_info_response_pdu_len(adu_buf),
        0x81..=0xAB => 2,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid function code: 0x{fn_code:0>2X}"),
            ));
        }
    };
    Ok(Some(len))
}

/// A device-identification response has no single byte-count field; the
/// object list is walked as far as it has been buffered.
///
/// PDU layout: `[fn][mei][category][conformity][more][next][count]`
/// followed by `count` × `[id][len][len bytes]`.
fn get_device_info_response_pdu_len(adu_buf: &BytesMut) -> Result<Option<usize>> {
    // adu_buf[0] is the slave id, the PDU starts at index 1.
    let Some(&object_count) = adu_buf.get(7) else {
        return Ok(None);
    };
    let mut pdu_len = 7;
    let mut pos = 8;
    for _ in 0..object_count {
        let Some(&object_len) = adu_buf.get(pos + 1) else {
            return Ok(None);
        };
        pdu_len += 2 + usize::from(object_len);
        pos += 2 + usize::from(object_len);
    }
    Ok(Some(pdu_len))
}

fn decode<F>(
    pdu_type: &str,
    frame_decoder: &mut FrameDecoder,
    get_pdu_len: F,
    buf: &mut BytesMut,
) -> Result<Option<(SlaveId, Bytes)>>
where
    F: Fn(&BytesMut) -> Result<Option<usize>>,
{
    const MAX_RETRIES: usize = 20;

    for _ in 0..MAX_RETRIES {
        let result = get_pdu_len(buf).and_then(|pdu_len| {
            let Some(pdu_len) = pdu_len else {
                // Incomplete frame
                return Ok(None);
            };
            frame_decoder.decode(buf, pdu_len)
        });

        if let Err(err) = result {
            log::warn!("Failed to decode {pdu_type} frame: {err}");
            frame_decoder.recover_on_error(buf);
            continue;
        }

        return result;
    }

    log::error!("Giving up to decode frame after {MAX_RETRIES} retries");
    Err(Error::new(ErrorKind::InvalidData, "Too many retries"))
}

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct ClientCodec {
    frame_decoder: FrameDecoder,
}

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct ServerCodec {
    frame_decoder: FrameDecoder,
}

impl Decoder for ClientCodec {
    type Item = ResponseAdu;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseAdu>> {
        let Some((slave_id, pdu_data)) =
            decode("response", &mut self.frame_decoder, get_response_pdu_len, buf)?
        else {
            return Ok(None);
        };

        let hdr = Header { slave_id };

        // Decoding of the PDU is unlikely to fail due to transmission
        // errors, because the frame's bytes have already been verified
        // with the CRC.
        ResponsePdu::try_from(pdu_data)
            .map(|pdu| Some(ResponseAdu { hdr, pdu }))
            .map_err(|err| {
                log::error!("Failed to decode response PDU: {err}");
                err
            })
    }
}

impl Decoder for ServerCodec {
    type Item = RequestFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>> {
        let Some((slave_id, pdu_data)) =
            decode("request", &mut self.frame_decoder, get_request_pdu_len, buf)?
        else {
            return Ok(None);
        };

        let hdr = Header { slave_id };
        let pdu = decode_request(&pdu_data)
            .map_err(|err| {
                log::error!("Failed to decode request PDU: {err}");
                err
            })?
            .map(RequestPdu);
        Ok(Some(RequestFrame { hdr, pdu }))
    }
}

impl Encoder<RequestAdu> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, adu: RequestAdu, buf: &mut BytesMut) -> Result<()> {
        let RequestAdu { hdr, pdu } = adu;
        let pdu_data: Bytes = pdu.into();
        buf.reserve(pdu_data.len() + 3);
        let start = buf.len();
        buf.put_u8(hdr.slave_id);
        buf.put_slice(&pdu_data);
        let crc = calc_crc(&buf[start..]);
        buf.put_u16_le(crc);
        Ok(())
    }
}

impl Encoder<ResponseAdu> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, adu: ResponseAdu, buf: &mut BytesMut) -> Result<()> {
        let ResponseAdu { hdr, pdu } = adu;
        let pdu_data: Bytes = pdu.into();
        buf.reserve(pdu_data.len() + 3);
        let start = buf.len();
        buf.put_u8(hdr.slave_id);
        buf.put_slice(&pdu_data);
        let crc = calc_crc(&buf[start..]);
        buf.put_u16_le(crc);
        Ok(())
    }
}
