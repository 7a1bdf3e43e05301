//! Protocol-data-unit encoding and decoding for the ten supported function codes.
//!
//! Only the declarative struct form (`Request`/`Response`) is public; there is no fluent
//! setter chain in this crate's surface (see design note on builder deprecation).

use crate::constants::{MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use crate::error::{ExceptionCode, ModbusError, ModbusException, Result};

/// One-byte function-code selector. Bit 0x80 (set on responses) flags an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    ReadServerId,
    ReadWriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::ReadServerId => 0x11,
            Self::ReadWriteMultipleRegisters => 0x17,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x11 => Some(Self::ReadServerId),
            0x17 => Some(Self::ReadWriteMultipleRegisters),
            _ => None,
        }
    }

    /// Whether this function reads/writes coils (bit-addressed) rather than registers.
    pub fn is_coil_function(self) -> bool {
        matches!(
            self,
            Self::ReadCoils | Self::ReadDiscreteInputs | Self::WriteSingleCoil | Self::WriteMultipleCoils
        )
    }
}

/// Pack a slice of booleans into Modbus coil-encoding bytes (LSB-first within each byte).
pub fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &v) in values.iter().enumerate() {
        if v {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `quantity` coil bits from Modbus coil-encoding bytes.
pub fn unpack_coils(bytes: &[u8], quantity: usize) -> Vec<bool> {
    (0..quantity)
        .map(|i| (bytes[i / 8] >> (i % 8)) & 0x01 != 0)
        .collect()
}

fn check_read_quantity(quantity: u16, cap: u16) -> Result<()> {
    if quantity == 0 || quantity > cap {
        return Err(ModbusError::Validation(format!(
            "quantity {quantity} out of range 1..={cap}"
        )));
    }
    Ok(())
}

/// A request PDU in declarative struct form. Writes through this surface are raw-packet
/// level only — the field/splitter path never constructs write requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadCoils { start_address: u16, quantity: u16 },
    ReadDiscreteInputs { start_address: u16, quantity: u16 },
    ReadHoldingRegisters { start_address: u16, quantity: u16 },
    ReadInputRegisters { start_address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { start_address: u16, values: Vec<bool> },
    WriteMultipleRegisters { start_address: u16, values: Vec<u16> },
    ReadServerId,
    ReadWriteMultipleRegisters {
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        write_values: Vec<u16>,
    },
}

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Self::ReadServerId => FunctionCode::ReadServerId,
            Self::ReadWriteMultipleRegisters { .. } => FunctionCode::ReadWriteMultipleRegisters,
        }
    }

    /// Encode the PDU body (function code plus payload). Validates quantity bounds.
    pub fn encode_pdu(&self) -> Result<Vec<u8>> {
        let mut pdu = vec![self.function_code().code()];
        match self {
            Self::ReadCoils { start_address, quantity } | Self::ReadDiscreteInputs { start_address, quantity } => {
                check_read_quantity(*quantity, MAX_READ_COILS)?;
                pdu.extend_from_slice(&start_address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
            },
            Self::ReadHoldingRegisters { start_address, quantity } | Self::ReadInputRegisters { start_address, quantity } => {
                check_read_quantity(*quantity, MAX_READ_REGISTERS)?;
                pdu.extend_from_slice(&start_address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
            },
            Self::WriteSingleCoil { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(if *value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            },
            Self::WriteSingleRegister { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            },
            Self::WriteMultipleCoils { start_address, values } => {
                let quantity = values.len() as u16;
                check_read_quantity(quantity, MAX_WRITE_COILS)?;
                let packed = pack_coils(values);
                pdu.extend_from_slice(&start_address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
            },
            Self::WriteMultipleRegisters { start_address, values } => {
                let quantity = values.len() as u16;
                check_read_quantity(quantity, MAX_WRITE_REGISTERS)?;
                pdu.extend_from_slice(&start_address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu.push((values.len() * 2) as u8);
                for v in values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
            },
            Self::ReadServerId => {},
            Self::ReadWriteMultipleRegisters { read_start, read_quantity, write_start, write_values } => {
                check_read_quantity(*read_quantity, MAX_READ_REGISTERS)?;
                let write_quantity = write_values.len() as u16;
                check_read_quantity(write_quantity, MAX_WRITE_REGISTERS)?;
                pdu.extend_from_slice(&read_start.to_be_bytes());
                pdu.extend_from_slice(&read_quantity.to_be_bytes());
                pdu.extend_from_slice(&write_start.to_be_bytes());
                pdu.extend_from_slice(&write_quantity.to_be_bytes());
                pdu.push((write_values.len() * 2) as u8);
                for v in write_values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
            },
        }
        if pdu.len() > MAX_PDU_SIZE {
            return Err(ModbusError::PacketTooLong { got: pdu.len(), max: MAX_PDU_SIZE });
        }
        Ok(pdu)
    }

    /// Expected full response PDU length (function code byte included), used by transports
    /// to know when an incrementally-read response is complete.
    pub fn expected_response_pdu_len(&self) -> usize {
        match self {
            Self::ReadCoils { quantity, .. } | Self::ReadDiscreteInputs { quantity, .. } => {
                2 + (*quantity as usize).div_ceil(8)
            },
            Self::ReadHoldingRegisters { quantity, .. } | Self::ReadInputRegisters { quantity, .. } => {
                2 + (*quantity as usize) * 2
            },
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => 5,
            Self::WriteMultipleCoils { .. } | Self::WriteMultipleRegisters { .. } => 5,
            // Server id response length varies by device; callers must rely on the
            // look-ahead predicate rather than a fixed length for FC17.
            Self::ReadServerId => 3,
            Self::ReadWriteMultipleRegisters { read_quantity, .. } => 2 + (*read_quantity as usize) * 2,
        }
    }
}

/// A parsed, successful response PDU in declarative struct form.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Coils { values: Vec<bool> },
    DiscreteInputs { values: Vec<bool> },
    HoldingRegisters { registers: Vec<u16>, raw: Vec<u8> },
    InputRegisters { registers: Vec<u16>, raw: Vec<u8> },
    WriteSingleCoilAck { address: u16, value: bool },
    WriteSingleRegisterAck { address: u16, value: u16 },
    WriteMultipleCoilsAck { start_address: u16, quantity: u16 },
    WriteMultipleRegistersAck { start_address: u16, quantity: u16 },
    ServerId { id: Vec<u8>, run_indicator_on: bool },
    ReadWriteRegisters { registers: Vec<u16>, raw: Vec<u8> },
}

/// Capability: any response that exposes a register payload (FC3/4/23).
pub trait RegisterResponse {
    fn as_registers(&self) -> Option<&[u16]>;
}

/// Capability: any response that exposes a coil/discrete-input bitset (FC1/2).
pub trait CoilResponse {
    fn as_coil_set(&self) -> Option<&[bool]>;
}

impl RegisterResponse for Response {
    fn as_registers(&self) -> Option<&[u16]> {
        match self {
            Self::HoldingRegisters { registers, .. }
            | Self::InputRegisters { registers, .. }
            | Self::ReadWriteRegisters { registers, .. } => Some(registers),
            _ => None,
        }
    }
}

impl CoilResponse for Response {
    fn as_coil_set(&self) -> Option<&[bool]> {
        match self {
            Self::Coils { values } | Self::DiscreteInputs { values } => Some(values),
            _ => None,
        }
    }
}

fn registers_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
}

/// Decode a response PDU (function code byte included) in the context of the request that
/// produced it — some responses (coil bit count, register quantity) need that context to be
/// parsed unambiguously.
pub fn decode_response_pdu(request: &Request, pdu: &[u8], unit_id: u8) -> Result<Response> {
    if pdu.is_empty() {
        return Err(ModbusError::DataTooShort { got: 0, need: 1 });
    }
    let fc_byte = pdu[0];
    if fc_byte & 0x80 != 0 {
        if pdu.len() < 2 {
            return Err(ModbusError::DataTooShort { got: pdu.len(), need: 2 });
        }
        return Err(ModbusError::Exception(ModbusException {
            unit_id,
            function_code: fc_byte & 0x7F,
            code: ExceptionCode::from_byte(pdu[1]),
        }));
    }
    let expected_fc = request.function_code().code();
    if fc_byte != expected_fc {
        return Err(ModbusError::NotModbusFrame);
    }
    let body = &pdu[1..];

    match request {
        Request::ReadCoils { quantity, .. } => {
            let byte_count = *body.first().ok_or(ModbusError::DataTooShort { got: 0, need: 1 })? as usize;
            let data = body.get(1..1 + byte_count).ok_or(ModbusError::DataTooShort {
                got: body.len(),
                need: 1 + byte_count,
            })?;
            Ok(Response::Coils { values: unpack_coils(data, *quantity as usize) })
        },
        Request::ReadDiscreteInputs { quantity, .. } => {
            let byte_count = *body.first().ok_or(ModbusError::DataTooShort { got: 0, need: 1 })? as usize;
            let data = body.get(1..1 + byte_count).ok_or(ModbusError::DataTooShort {
                got: body.len(),
                need: 1 + byte_count,
            })?;
            Ok(Response::DiscreteInputs { values: unpack_coils(data, *quantity as usize) })
        },
        Request::ReadHoldingRegisters { quantity, .. } => {
            let byte_count = *body.first().ok_or(ModbusError::DataTooShort { got: 0, need: 1 })? as usize;
            let data = body.get(1..1 + byte_count).ok_or(ModbusError::DataTooShort {
                got: body.len(),
                need: 1 + byte_count,
            })?;
            if byte_count != *quantity as usize * 2 {
                return Err(ModbusError::ReceivedTooShort { got: byte_count, expected: *quantity as usize * 2 });
            }
            Ok(Response::HoldingRegisters { registers: registers_from_bytes(data), raw: data.to_vec() })
        },
        Request::ReadInputRegisters { quantity, .. } => {
            let byte_count = *body.first().ok_or(ModbusError::DataTooShort { got: 0, need: 1 })? as usize;
            let data = body.get(1..1 + byte_count).ok_or(ModbusError::DataTooShort {
                got: body.len(),
                need: 1 + byte_count,
            })?;
            if byte_count != *quantity as usize * 2 {
                return Err(ModbusError::ReceivedTooShort { got: byte_count, expected: *quantity as usize * 2 });
            }
            Ok(Response::InputRegisters { registers: registers_from_bytes(data), raw: data.to_vec() })
        },
        Request::WriteSingleCoil { .. } => {
            if body.len() < 4 {
                return Err(ModbusError::DataTooShort { got: body.len(), need: 4 });
            }
            let address = u16::from_be_bytes([body[0], body[1]]);
            let value = u16::from_be_bytes([body[2], body[3]]) == 0xFF00;
            Ok(Response::WriteSingleCoilAck { address, value })
        },
        Request::WriteSingleRegister { .. } => {
            if body.len() < 4 {
                return Err(ModbusError::DataTooShort { got: body.len(), need: 4 });
            }
            let address = u16::from_be_bytes([body[0], body[1]]);
            let value = u16::from_be_bytes([body[2], body[3]]);
            Ok(Response::WriteSingleRegisterAck { address, value })
        },
        Request::WriteMultipleCoils { .. } => {
            if body.len() < 4 {
                return Err(ModbusError::DataTooShort { got: body.len(), need: 4 });
            }
            let start_address = u16::from_be_bytes([body[0], body[1]]);
            let quantity = u16::from_be_bytes([body[2], body[3]]);
            Ok(Response::WriteMultipleCoilsAck { start_address, quantity })
        },
        Request::WriteMultipleRegisters { .. } => {
            if body.len() < 4 {
                return Err(ModbusError::DataTooShort { got: body.len(), need: 4 });
            }
            let start_address = u16::from_be_bytes([body[0], body[1]]);
            let quantity = u16::from_be_bytes([body[2], body[3]]);
            Ok(Response::WriteMultipleRegistersAck { start_address, quantity })
        },
        Request::ReadServerId => {
            let byte_count = *body.first().ok_or(ModbusError::DataTooShort { got: 0, need: 1 })? as usize;
            let id = body.get(1..1 + byte_count).ok_or(ModbusError::DataTooShort {
                got: body.len(),
                need: 1 + byte_count,
            })?;
            let run_indicator_on = body.get(1 + byte_count).copied().unwrap_or(0) == 0xFF;
            Ok(Response::ServerId { id: id.to_vec(), run_indicator_on })
        },
        Request::ReadWriteMultipleRegisters { read_quantity, .. } => {
            let byte_count = *body.first().ok_or(ModbusError::DataTooShort { got: 0, need: 1 })? as usize;
            let data = body.get(1..1 + byte_count).ok_or(ModbusError::DataTooShort {
                got: body.len(),
                need: 1 + byte_count,
            })?;
            if byte_count != *read_quantity as usize * 2 {
                return Err(ModbusError::ReceivedTooShort { got: byte_count, expected: *read_quantity as usize * 2 });
            }
            Ok(Response::ReadWriteRegisters { registers: registers_from_bytes(data), raw: data.to_vec() })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_read_holding_registers() {
        let req = Request::ReadHoldingRegisters { start_address: 18, quantity: 4 };
        let pdu = req.encode_pdu().unwrap();
        assert_eq!(pdu, vec![0x03, 0x00, 18, 0x00, 0x04]);
    }

    #[test]
    fn encode_rejects_out_of_range_quantity() {
        let req = Request::ReadHoldingRegisters { start_address: 0, quantity: 126 };
        assert!(req.encode_pdu().is_err());
    }

    #[test]
    fn coil_pack_unpack_roundtrip() {
        let values = vec![true, false, true, true, false, false, false, false, true];
        let packed = pack_coils(&values);
        let unpacked = unpack_coils(&packed, values.len());
        assert_eq!(values, unpacked);
    }

    #[test]
    fn decode_holding_registers_response() {
        let req = Request::ReadHoldingRegisters { start_address: 18, quantity: 2 };
        let pdu = vec![0x03, 0x04, 0x00, 0x01, 0xFF, 0xFF];
        let resp = decode_response_pdu(&req, &pdu, 1).unwrap();
        match resp {
            Response::HoldingRegisters { registers, .. } => assert_eq!(registers, vec![1, 0xFFFF]),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn decode_exception_response() {
        let req = Request::ReadHoldingRegisters { start_address: 18, quantity: 2 };
        let pdu = vec![0x83, 0x02];
        let err = decode_response_pdu(&req, &pdu, 1).unwrap_err();
        match err {
            ModbusError::Exception(ex) => {
                assert_eq!(ex.function_code, 0x03);
                assert_eq!(ex.code.to_byte(), 0x02);
            },
            other => panic!("expected exception, got {other:?}"),
        }
    }

    #[test]
    fn fc1_rtu_request_matches_known_vector() {
        // Scenario 2 from the testable-properties catalogue.
        let req = Request::ReadCoils { start_address: 10, quantity: 1 };
        let pdu = req.encode_pdu().unwrap();
        assert_eq!(pdu, vec![0x01, 0x00, 0x0A, 0x00, 0x01]);
    }
}
