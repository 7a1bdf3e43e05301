//! TCP (MBAP) and RTU (CRC16) frame wrapping/unwrapping around PDUs.

use std::sync::atomic::{AtomicU16, Ordering};

use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{MAX_RTU_ADU_SIZE, MAX_TCP_ADU_SIZE, MBAP_HEADER_LEN};
use crate::error::{ExceptionCode, ModbusError, ModbusException, Result};
use crate::pdu::{decode_response_pdu, Request, Response};

static MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

static TRANSACTION_ID: AtomicU16 = AtomicU16::new(1);

/// Generate the next non-zero transaction id. Process-wide, matching the teacher's
/// random-nonzero-tid convention but realised as a wrapping atomic counter rather than a
/// fresh PRNG draw per request — simpler and still collision-avoiding within a process.
pub fn next_transaction_id() -> u16 {
    loop {
        let id = TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// The 7-byte MBAP header preceding every TCP PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn encode(self) -> [u8; MBAP_HEADER_LEN] {
        let mut out = [0u8; MBAP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&0u16.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::DataTooShort { got: bytes.len(), need: MBAP_HEADER_LEN });
        }
        let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::NonZeroProtocolId(protocol_id));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

/// Compute the Modbus RTU CRC16 (reflected poly 0xA001, init 0xFFFF) over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Result of a look-ahead scan over an incrementally-accumulated buffer: not enough bytes
/// yet to tell, definitely not a valid frame of this kind, or a complete frame of length N.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLookahead {
    TooShort,
    NotAFrame,
    Complete(usize),
}

/// Build a complete TCP ADU (MBAP header + PDU) for `request`, returning the transaction id
/// used so the caller can match the response.
pub fn encode_tcp_request(request: &Request, unit_id: u8) -> Result<(Vec<u8>, u16)> {
    let pdu = request.encode_pdu()?;
    let transaction_id = next_transaction_id();
    let header = MbapHeader {
        transaction_id,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    let mut adu = header.encode().to_vec();
    adu.extend_from_slice(&pdu);
    if adu.len() > MAX_TCP_ADU_SIZE {
        return Err(ModbusError::PacketTooLong { got: adu.len(), max: MAX_TCP_ADU_SIZE });
    }
    Ok((adu, transaction_id))
}

/// Build a complete RTU ADU (unit id + PDU + CRC16) for `request`.
pub fn encode_rtu_request(request: &Request, unit_id: u8) -> Result<Vec<u8>> {
    let pdu = request.encode_pdu()?;
    let mut adu = Vec::with_capacity(1 + pdu.len() + 2);
    adu.push(unit_id);
    adu.extend_from_slice(&pdu);
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    if adu.len() > MAX_RTU_ADU_SIZE {
        return Err(ModbusError::PacketTooLong { got: adu.len(), max: MAX_RTU_ADU_SIZE });
    }
    Ok(adu)
}

/// Decode a complete TCP ADU, verifying header and transaction id match, and parse the PDU
/// in the context of `request`.
pub fn decode_tcp_response(bytes: &[u8], request: &Request, expected_transaction_id: u16) -> Result<Response> {
    let header = MbapHeader::decode(bytes)?;
    let declared_total = MBAP_HEADER_LEN + header.length.saturating_sub(1) as usize;
    if bytes.len() < declared_total {
        return Err(ModbusError::DataTooShort { got: bytes.len(), need: declared_total });
    }
    // Transaction id mismatch is tolerated: "clients verify the match but still accept the
    // response" per the wire-format contract.
    let _ = header.transaction_id == expected_transaction_id;
    let pdu = &bytes[MBAP_HEADER_LEN..declared_total];
    decode_response_pdu(request, pdu, header.unit_id)
}

/// Decode a complete RTU ADU, verifying the trailing CRC, and parse the PDU in the context
/// of `request`.
pub fn decode_rtu_response(bytes: &[u8], request: &Request) -> Result<Response> {
    if bytes.len() < 5 {
        return Err(ModbusError::DataTooShort { got: bytes.len(), need: 5 });
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 2);
    let expected_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let actual_crc = crc16(body);
    if expected_crc != actual_crc {
        return Err(ModbusError::CrcMismatch { expected: expected_crc, actual: actual_crc });
    }
    let unit_id = body[0];
    let pdu = &body[1..];
    decode_response_pdu(request, pdu, unit_id)
}

/// Pure predicate: does `buffer` look like a complete, in-progress, or malformed TCP ADU?
pub fn looks_like_tcp(buffer: &[u8]) -> FrameLookahead {
    if buffer.len() < MBAP_HEADER_LEN {
        return FrameLookahead::TooShort;
    }
    let protocol_id = u16::from_be_bytes([buffer[2], buffer[3]]);
    if protocol_id != 0 {
        return FrameLookahead::NotAFrame;
    }
    let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
    if length == 0 {
        return FrameLookahead::NotAFrame;
    }
    let total = MBAP_HEADER_LEN + length - 1;
    if total > MAX_TCP_ADU_SIZE {
        return FrameLookahead::NotAFrame;
    }
    if buffer.len() < total {
        FrameLookahead::TooShort
    } else {
        FrameLookahead::Complete(total)
    }
}

/// Pure predicate: does `buffer` look like a complete, in-progress, or malformed RTU ADU,
/// given the expected full-response PDU length from the originating request?
pub fn looks_like_rtu(buffer: &[u8], expected_pdu_len: usize) -> FrameLookahead {
    if buffer.len() < 3 {
        return FrameLookahead::TooShort;
    }
    // An exception frame is always exactly unit + fc|0x80 + code + 2-byte CRC = 5 bytes.
    if buffer[1] & 0x80 != 0 {
        return if buffer.len() < 5 {
            FrameLookahead::TooShort
        } else {
            FrameLookahead::Complete(5)
        };
    }
    let total = 1 + expected_pdu_len + 2;
    if total > MAX_RTU_ADU_SIZE {
        return FrameLookahead::NotAFrame;
    }
    if buffer.len() < total {
        FrameLookahead::TooShort
    } else {
        FrameLookahead::Complete(total)
    }
}

/// Exception short-circuit for TCP: returns Some(exception) iff `buffer` already holds a
/// complete MBAP exception frame (length field == 3), regardless of the normal-response
/// expected length.
pub fn as_tcp_exception_frame(buffer: &[u8]) -> Option<ModbusException> {
    if buffer.len() < MBAP_HEADER_LEN + 2 {
        return None;
    }
    let length = u16::from_be_bytes([buffer[4], buffer[5]]);
    if length != 3 {
        return None;
    }
    let unit_id = buffer[6];
    let fc_byte = buffer[7];
    if fc_byte & 0x80 == 0 {
        return None;
    }
    let code = buffer[8];
    Some(ModbusException {
        unit_id,
        function_code: fc_byte & 0x7F,
        code: ExceptionCode::from_byte(code),
    })
}

/// Exception short-circuit for RTU: returns Some(exception) iff `buffer` already holds a
/// complete 5-byte RTU exception frame with a verified CRC.
pub fn as_rtu_exception_frame(buffer: &[u8]) -> Option<ModbusException> {
    if buffer.len() < 5 {
        return None;
    }
    if buffer[1] & 0x80 == 0 {
        return None;
    }
    let (body, crc_bytes) = buffer[..5].split_at(3);
    let expected_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if crc16(body) != expected_crc {
        return None;
    }
    Some(ModbusException {
        unit_id: buffer[0],
        function_code: buffer[1] & 0x7F,
        code: ExceptionCode::from_byte(buffer[2]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Request;

    #[test]
    fn crc16_known_vector() {
        // 01 03 00 00 00 0A -> CRC 0xC5CD (low byte first on the wire: CD C5)
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&data), 0xC5CD);
    }

    #[test]
    fn tcp_round_trip_scenario_1() {
        let req = Request::ReadHoldingRegisters { start_address: 18, quantity: 4 };
        let (adu, tid) = encode_tcp_request(&req, 1).unwrap();
        assert_eq!(&adu[2..4], &[0, 0]); // protocol id
        assert_eq!(&adu[4..6], &[0, 6]); // length
        assert_eq!(adu[6], 1); // unit id
        assert_eq!(&adu[7..], &[0x03, 0x00, 18, 0x00, 0x04]);

        let response_bytes = {
            let mut b = adu[0..2].to_vec(); // echo tid
            b.extend_from_slice(&[0, 0, 0, 11, 1, 0x03, 8]);
            b.extend_from_slice(&[0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
            b
        };
        let resp = decode_tcp_response(&response_bytes, &req, tid).unwrap();
        if let Response::HoldingRegisters { registers, .. } = resp {
            assert_eq!(registers, vec![1, 0xFFFF, 0xFFFF, 0xFFFF]);
        } else {
            panic!("unexpected response");
        }
    }

    #[test]
    fn rtu_fc1_matches_known_vector() {
        let req = Request::ReadCoils { start_address: 10, quantity: 1 };
        let adu = encode_rtu_request(&req, 1).unwrap();
        assert_eq!(adu, vec![0x01, 0x01, 0x00, 0x0A, 0x00, 0x01, 0xDD, 0xC8]);
    }

    #[test]
    fn exception_short_circuit_tcp() {
        let buffer = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let ex = as_tcp_exception_frame(&buffer).unwrap();
        assert_eq!(ex.function_code, 0x03);
        assert_eq!(ex.code.to_byte(), 0x02);
    }

    #[test]
    fn exception_short_circuit_rtu() {
        let req = Request::ReadCoils { start_address: 0, quantity: 1 };
        let adu = encode_rtu_request(&req, 1).unwrap();
        let _ = adu; // unused, just establishing crc baseline elsewhere
        let body = [0x01, 0x83, 0x02];
        let crc = crc16(&body);
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc.to_le_bytes());
        let ex = as_rtu_exception_frame(&frame).unwrap();
        assert_eq!(ex.function_code, 0x03);
    }

    #[test]
    fn looks_like_tcp_detects_partial_and_complete() {
        let req = Request::ReadHoldingRegisters { start_address: 0, quantity: 1 };
        let (adu, _) = encode_tcp_request(&req, 1).unwrap();
        assert_eq!(looks_like_tcp(&adu[..4]), FrameLookahead::TooShort);
        assert_eq!(looks_like_tcp(&adu), FrameLookahead::Complete(adu.len()));
    }

    #[test]
    fn looks_like_rtu_detects_exception_before_full_length() {
        let body = [0x01, 0x83, 0x02];
        let crc = crc16(&body);
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc.to_le_bytes());
        // A normal FC3 response for a large quantity would be much longer; the exception
        // frame is recognised as complete regardless of that expected length.
        assert_eq!(looks_like_rtu(&frame, 250), FrameLookahead::Complete(5));
    }

    #[test]
    fn transaction_ids_are_never_zero() {
        for _ in 0..10 {
            assert_ne!(next_transaction_id(), 0);
        }
    }
}
