//! Declarative field model: one logical value, its endpoint, its location in the register
//! space, and its extraction/marshalling semantics.

use std::time::Duration;

use crate::byte_order::ByteOrder;
use crate::error::{ModbusError, Result};
use crate::pdu::FunctionCode;
use crate::register_view::RegisterView;

/// Transport protocol a field may be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Any,
    Tcp,
    Rtu,
}

impl Protocol {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "" => Ok(Self::Any),
            "tcp" => Ok(Self::Tcp),
            "rtu" => Ok(Self::Rtu),
            other => Err(ModbusError::UnknownProtocol(other.to_string())),
        }
    }
}

/// The closed set of field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bit,
    Byte,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
    String,
    Coil,
    RawBytes,
}

impl FieldType {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bit" => Ok(Self::Bit),
            "byte" => Ok(Self::Byte),
            "uint8" => Ok(Self::Uint8),
            "int8" => Ok(Self::Int8),
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "uint32" => Ok(Self::Uint32),
            "int32" => Ok(Self::Int32),
            "uint64" => Ok(Self::Uint64),
            "int64" => Ok(Self::Int64),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            "string" => Ok(Self::String),
            "coil" => Ok(Self::Coil),
            "raw-bytes" | "rawbytes" => Ok(Self::RawBytes),
            other => Err(ModbusError::InvalidFieldTypeString(other.to_string())),
        }
    }

    pub fn is_coil(self) -> bool {
        matches!(self, Self::Coil)
    }
}

/// The extracted value: a closed sum type over field types plus bytes/string catch-alls.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bit(bool),
    Byte(u8),
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Uint64(u64),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    /// The extracted raw bytes matched the field's declared `invalid` pattern.
    Invalid,
}

/// A declarative field description. Read-only once handed to a splitter.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub server_url: String,
    pub unit_id: u8,
    /// 0 means "adopt the batch's forced function code".
    pub function_code: u8,
    pub protocol: Protocol,
    pub request_interval: Duration,
    pub address: u16,
    pub field_type: FieldType,
    pub bit: Option<u8>,
    pub from_high_byte: bool,
    pub length: Option<usize>,
    pub byte_order: ByteOrder,
    pub invalid: Option<Vec<u8>>,
}

impl Field {
    /// `validate` rules per the data model: server URL non-empty, type within the closed
    /// set (guaranteed by construction here), bit <= 15, string/raw-bytes require length > 0,
    /// coil type permits only function codes in {0, 1, 2}, protocol within {any, tcp, rtu}
    /// (guaranteed by construction).
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(ModbusError::Validation("server url must not be empty".into()));
        }
        if let Some(bit) = self.bit {
            if bit > 15 {
                return Err(ModbusError::BitIndexOutOfRange(bit));
            }
        }
        if matches!(self.field_type, FieldType::String | FieldType::RawBytes) {
            match self.length {
                Some(len) if len > 0 => {},
                _ => {
                    return Err(ModbusError::Validation(format!(
                        "field {} of type string/raw-bytes requires length > 0",
                        self.name
                    )))
                },
            }
        }
        if self.field_type.is_coil() && !matches!(self.function_code, 0 | 1 | 2) {
            return Err(ModbusError::Validation(format!(
                "coil field {} may only use function code 0, 1 or 2, got {}",
                self.name, self.function_code
            )));
        }
        Ok(())
    }

    /// Register footprint: 4 for 64-bit scalars, 2 for 32-bit scalars, 1 for <=16-bit
    /// scalars/bits, ceil(length/2) for string/raw-bytes, 1 for coil.
    pub fn register_size(&self) -> usize {
        match self.field_type {
            FieldType::Uint64 | FieldType::Int64 | FieldType::Float64 => 4,
            FieldType::Uint32 | FieldType::Int32 | FieldType::Float32 => 2,
            FieldType::Bit | FieldType::Byte | FieldType::Uint8 | FieldType::Int8 | FieldType::Uint16 | FieldType::Int16 => 1,
            FieldType::Coil => 1,
            FieldType::String | FieldType::RawBytes => self.length.unwrap_or(1).div_ceil(2),
        }
    }

    /// True iff the field declares an `invalid` byte pattern and the raw bytes at its
    /// address match it exactly.
    pub fn check_invalid(&self, view: &RegisterView<'_>) -> Result<bool> {
        let Some(pattern) = &self.invalid else { return Ok(false) };
        view.equal_bytes(self.address, pattern.len(), pattern)
    }

    /// Dispatch on type to the corresponding Register View operation. Coil extraction is an
    /// error here (coils are extracted via the bit-response path, not a register view).
    pub fn extract_from(&self, view: &RegisterView<'_>) -> Result<FieldValue> {
        if self.check_invalid(view)? {
            return Ok(FieldValue::Invalid);
        }
        match self.field_type {
            FieldType::Bit => {
                let n = self.bit.ok_or_else(|| ModbusError::Validation("bit field missing bit index".into()))?;
                Ok(FieldValue::Bit(view.bit(self.address, n)?))
            },
            FieldType::Byte => Ok(FieldValue::Byte(view.byte(self.address, self.from_high_byte)?)),
            FieldType::Uint8 => Ok(FieldValue::Uint8(view.uint8(self.address, self.from_high_byte)?)),
            FieldType::Int8 => Ok(FieldValue::Int8(view.int8(self.address, self.from_high_byte)?)),
            FieldType::Uint16 => Ok(FieldValue::Uint16(view.uint16(self.address)?)),
            FieldType::Int16 => Ok(FieldValue::Int16(view.int16(self.address)?)),
            FieldType::Uint32 => Ok(FieldValue::Uint32(view.uint32(self.address, self.byte_order)?)),
            FieldType::Int32 => Ok(FieldValue::Int32(view.int32(self.address, self.byte_order)?)),
            FieldType::Uint64 => Ok(FieldValue::Uint64(view.uint64(self.address, self.byte_order)?)),
            FieldType::Int64 => Ok(FieldValue::Int64(view.int64(self.address, self.byte_order)?)),
            FieldType::Float32 => Ok(FieldValue::Float32(view.float32(self.address, self.byte_order)?)),
            FieldType::Float64 => Ok(FieldValue::Float64(view.float64(self.address, self.byte_order)?)),
            FieldType::String => {
                let len = self.length.unwrap_or(0);
                Ok(FieldValue::String(view.string(self.address, len, self.byte_order)?))
            },
            FieldType::RawBytes => {
                let len = self.length.unwrap_or(0);
                Ok(FieldValue::Bytes(view.raw_bytes(self.address, len, self.byte_order)?))
            },
            FieldType::Coil => Err(ModbusError::UnsupportedFieldType(
                "coil fields are extracted from a coil response, not a register view".into(),
            )),
        }
    }

    pub fn function_code_hint(&self) -> Option<FunctionCode> {
        FunctionCode::from_code(self.function_code)
    }
}

fn clamp_round(value: f64, min: f64, max: f64) -> f64 {
    let clamped = value.clamp(min, max);
    // round halves away from zero
    if clamped >= 0.0 {
        (clamped + 0.5).floor().min(max)
    } else {
        (clamped - 0.5).ceil().max(min)
    }
}

/// A pure value that may be marshalled into a field's on-wire byte layout.
#[derive(Debug, Clone)]
pub enum MarshalInput {
    Number(f64),
    Text(String),
    Raw(Vec<u8>),
}

/// Map `input` to the exact byte layout `field` expects on the wire, per the marshalling
/// rules in the frame-codec design: saturating numeric clamps, round-half-away-from-zero for
/// float-to-integer, zero-pad/truncate for strings, low-word-first swap applied after
/// encoding. Coil fields cannot be marshalled through this path.
pub fn marshal_bytes(field: &Field, input: &MarshalInput) -> Result<Vec<u8>> {
    if field.field_type.is_coil() {
        return Err(ModbusError::UnsupportedFieldType("writing to a coil field is not supported".into()));
    }

    let order = field.byte_order;
    let apply_order = |mut regs: Vec<[u8; 2]>| -> Vec<u8> {
        if order.low_byte_first() {
            for r in &mut regs {
                r.swap(0, 1);
            }
        }
        if order.low_word_first() && regs.len() > 1 {
            regs.reverse();
        }
        regs.into_iter().flatten().collect()
    };
    let split_regs = |bytes: &[u8]| -> Vec<[u8; 2]> { bytes.chunks_exact(2).map(|c| [c[0], c[1]]).collect() };

    let number = |input: &MarshalInput| -> Result<f64> {
        match input {
            MarshalInput::Number(n) => Ok(*n),
            _ => Err(ModbusError::Validation("expected numeric input for this field type".into())),
        }
    };

    match field.field_type {
        FieldType::Byte | FieldType::Uint8 => {
            let v = clamp_round(number(input)?, 0.0, u8::MAX as f64) as u8;
            Ok(vec![v])
        },
        FieldType::Int8 => {
            let v = clamp_round(number(input)?, i8::MIN as f64, i8::MAX as f64) as i8;
            Ok(vec![v as u8])
        },
        FieldType::Uint16 => {
            let v = clamp_round(number(input)?, 0.0, u16::MAX as f64) as u16;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Int16 => {
            let v = clamp_round(number(input)?, i16::MIN as f64, i16::MAX as f64) as i16;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Uint32 => {
            let v = clamp_round(number(input)?, 0.0, u32::MAX as f64) as u32;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Int32 => {
            let v = clamp_round(number(input)?, i32::MIN as f64, i32::MAX as f64) as i32;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Uint64 => {
            let v = clamp_round(number(input)?, 0.0, u64::MAX as f64) as u64;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Int64 => {
            let v = clamp_round(number(input)?, i64::MIN as f64, i64::MAX as f64) as i64;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Float32 => {
            let v = number(input)? as f32;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Float64 => {
            let v = number(input)?;
            Ok(apply_order(split_regs(&v.to_be_bytes())))
        },
        FieldType::Bit => {
            let v = number(input)? != 0.0;
            Ok(vec![v as u8])
        },
        FieldType::String => {
            let text = match input {
                MarshalInput::Text(s) => s.clone(),
                _ => return Err(ModbusError::Validation("expected text input for string field".into())),
            };
            let length = field.length.unwrap_or(0);
            let mut bytes = text.into_bytes();
            bytes.truncate(length);
            bytes.resize(length, 0);
            if bytes.len() % 2 != 0 {
                bytes.push(0);
            }
            Ok(apply_order(split_regs(&bytes)))
        },
        FieldType::RawBytes => {
            let raw = match input {
                MarshalInput::Raw(b) => b.clone(),
                _ => return Err(ModbusError::Validation("expected raw bytes input for raw-bytes field".into())),
            };
            let length = field.length.unwrap_or(0);
            let mut bytes = raw;
            bytes.truncate(length);
            bytes.resize(length, 0);
            if bytes.len() % 2 != 0 {
                bytes.push(0);
            }
            Ok(apply_order(split_regs(&bytes)))
        },
        FieldType::Coil => unreachable!("checked above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_field(field_type: FieldType) -> Field {
        Field {
            name: "f".into(),
            server_url: "tcp://127.0.0.1:502".into(),
            unit_id: 1,
            function_code: 0,
            protocol: Protocol::Any,
            request_interval: Duration::from_secs(1),
            address: 0,
            field_type,
            bit: None,
            from_high_byte: false,
            length: None,
            byte_order: ByteOrder::BigEndian,
            invalid: None,
        }
    }

    #[test]
    fn validate_rejects_empty_url() {
        let mut f = base_field(FieldType::Uint16);
        f.server_url.clear();
        assert!(f.validate().is_err());
    }

    #[test]
    fn validate_rejects_coil_with_wrong_function_code() {
        let mut f = base_field(FieldType::Coil);
        f.function_code = 3;
        assert!(f.validate().is_err());
    }

    #[test]
    fn validate_requires_length_for_string() {
        let f = base_field(FieldType::String);
        assert!(f.validate().is_err());
    }

    #[test]
    fn register_size_matches_type_width() {
        assert_eq!(base_field(FieldType::Int64).register_size(), 4);
        assert_eq!(base_field(FieldType::Float32).register_size(), 2);
        assert_eq!(base_field(FieldType::Uint16).register_size(), 1);
        let mut f = base_field(FieldType::String);
        f.length = Some(5);
        assert_eq!(f.register_size(), 3);
    }

    #[test]
    fn extract_from_respects_invalid_pattern() {
        let mut f = base_field(FieldType::Uint16);
        f.invalid = Some(vec![0xFF, 0xFF]);
        let data = [0xFFu8, 0xFF];
        let view = RegisterView::new(&data, 0);
        assert_eq!(f.extract_from(&view).unwrap(), FieldValue::Invalid);
    }

    #[test]
    fn marshal_roundtrip_uint32() {
        let f = base_field(FieldType::Uint32);
        let bytes = marshal_bytes(&f, &MarshalInput::Number(305_419_896.0)).unwrap();
        let view = RegisterView::new(&bytes, 0);
        assert_eq!(view.uint32(0, ByteOrder::BigEndian).unwrap(), 0x1234_5678);
    }

    #[test]
    fn marshal_clamps_out_of_range() {
        let f = base_field(FieldType::Uint8);
        let bytes = marshal_bytes(&f, &MarshalInput::Number(1000.0)).unwrap();
        assert_eq!(bytes, vec![255]);
    }

    #[test]
    fn marshal_rejects_coil() {
        let f = base_field(FieldType::Coil);
        assert!(marshal_bytes(&f, &MarshalInput::Number(1.0)).is_err());
    }

    #[test]
    fn marshal_string_pads_and_truncates() {
        let mut f = base_field(FieldType::String);
        f.length = Some(4);
        let bytes = marshal_bytes(&f, &MarshalInput::Text("hi".into())).unwrap();
        assert_eq!(bytes, vec![b'h', b'i', 0, 0]);

        let bytes = marshal_bytes(&f, &MarshalInput::Text("toolong".into())).unwrap();
        assert_eq!(bytes.len(), 4);
    }
}
