// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::decode_request,
    frame::{tcp::*, RequestPdu, ResponsePdu},
};

/// `[trx hi][trx lo][0x00][0x00][len hi][len lo][unit id]`
const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000;

/// Splits one MBAP-framed ADU off the receive buffer.
fn decode_adu(buf: &mut BytesMut) -> Result<Option<(Header, Bytes)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    // The length field counts the unit id plus the PDU.
    let len = usize::from(BigEndian::read_u16(&buf[4..6]));
    let Some(pdu_len) = len.checked_sub(1) else {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid data length: {len}"),
        ));
    };
    if buf.len() < HEADER_LEN + pdu_len {
        return Ok(None);
    }

    let header_data = buf.split_to(HEADER_LEN);

    let protocol_id = BigEndian::read_u16(&header_data[2..4]);
    if protocol_id != PROTOCOL_ID {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid protocol identifier: expected = {PROTOCOL_ID}, actual = {protocol_id}"),
        ));
    }

    let header = Header {
        transaction_id: BigEndian::read_u16(&header_data[0..2]),
        unit_id: header_data[6],
    };
    let pdu_data = buf.split_to(pdu_len).freeze();
    Ok(Some((header, pdu_data)))
}

fn encode_adu(hdr: Header, pdu_data: &Bytes, buf: &mut BytesMut) -> Result<()> {
    let len = pdu_data.len() + 1;
    let len = u16::try_from(len)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("Frame too long: {len}")))?;
    buf.reserve(pdu_data.len() + HEADER_LEN);
    buf.put_u16(hdr.transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(len);
    buf.put_u8(hdr.unit_id);
    buf.put_slice(pdu_data);
    Ok(())
}

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct ClientCodec;

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct ServerCodec;

impl Decoder for ClientCodec {
    type Item = ResponseAdu;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseAdu>> {
        let Some((hdr, pdu_data)) = decode_adu(buf)? else {
            return Ok(None);
        };
        let pdu = ResponsePdu::try_from(pdu_data)?;
        Ok(Some(ResponseAdu { hdr, pdu }))
    }
}

impl Decoder for ServerCodec {
    type Item = RequestFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>> {
        let Some((hdr, pdu_data)) = decode_adu(buf)? else {
            return Ok(None);
        };
        let pdu = decode_request(&pdu_data)?.map(RequestPdu);
        Ok(Some(RequestFrame { hdr, pdu }))
    }
}

impl Encoder<RequestAdu> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, adu: RequestAdu, buf: &mut BytesMut) -> Result<()> {
        let RequestAdu { hdr, pdu } = adu;
        let pdu_data: Bytes = pdu.into();
        encode_adu(hdr, &pdu_data, buf)
    }
}

impl Encoder<ResponseAdu> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, adu: ResponseAdu, buf: &mut BytesMut) -> Result<()> {
        let ResponseAdu { hdr, pdu } = adu;
        let pdu_data: Bytes = pdu.into();
        encode_adu(hdr, &pdu_data, buf)
    }
}
