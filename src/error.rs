//! Crate-wide error taxonomy.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ModbusError>;

/// The named set of standard Modbus exception codes, plus a verbatim passthrough for
/// anything else (including the non-standard negative-acknowledge 0x07 some devices emit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Other(u8),
}

impl ExceptionCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Other(b) => b,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailedToRespond => "gateway target failed to respond",
            Self::Other(b) => return write!(f, "unknown exception code 0x{b:02X}"),
        };
        write!(f, "{name}")
    }
}

/// A typed, inspectable Modbus exception response.
#[derive(Debug, Clone, Copy, Error)]
#[error("modbus exception from unit {unit_id}, function 0x{function_code:02X}: {code}")]
pub struct ModbusException {
    pub unit_id: u8,
    pub function_code: u8,
    pub code: ExceptionCode,
}

#[derive(Debug, Error)]
pub enum ModbusError {
    // -- Framing errors --
    #[error("data too short: got {got} bytes, need at least {need}")]
    DataTooShort { got: usize, need: usize },
    #[error("does not look like a modbus frame")]
    NotModbusFrame,
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },
    #[error("non-zero protocol id: {0}")]
    NonZeroProtocolId(u16),
    #[error("packet too long: {got} bytes exceeds max {max}")]
    PacketTooLong { got: usize, max: usize },

    // -- Protocol exceptions --
    #[error(transparent)]
    Exception(#[from] ModbusException),

    // -- Client / transport errors --
    #[error("not connected")]
    NotConnected,
    #[error("nil request")]
    NilRequest,
    #[error("serial port not set")]
    SerialPortNotSet,
    #[error("total read timeout exceeded")]
    TotalReadTimeoutExceeded,
    #[error("no bytes received")]
    NoBytesReceived,
    #[error("received too short: got {got}, expected {expected}")]
    ReceivedTooShort { got: usize, expected: usize },
    #[error("operation cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(String),

    // -- Decode errors --
    #[error("address out of bounds: {0}")]
    AddressOutOfBounds(String),
    #[error("invalid value")]
    InvalidValue,
    #[error("unsupported field type: {0}")]
    UnsupportedFieldType(String),
    #[error("bit index out of range: {0}")]
    BitIndexOutOfRange(u8),

    // -- Configuration / field validation errors --
    #[error("url parse error: {0}")]
    UrlParse(String),
    #[error("invalid address range syntax: {0}")]
    InvalidAddressRange(String),
    #[error("invalid field type string: {0}")]
    InvalidFieldTypeString(String),
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("field validation failed: {0}")]
    Validation(String),
    #[error("field overlaps invalid address range: {0}")]
    OverlapsInvalidRange(String),
    #[error("no requests produced by splitter")]
    NoRequests,
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
}

impl ModbusError {
    /// Matches the teacher's `needs_reconnect`/"client-error" grouping: errors that
    /// should be classified as client errors for statistics and retry purposes.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::NilRequest
                | Self::SerialPortNotSet
                | Self::TotalReadTimeoutExceeded
                | Self::NoBytesReceived
                | Self::ReceivedTooShort { .. }
                | Self::Cancelled
                | Self::Io(_)
        )
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception(_))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Self::TotalReadTimeoutExceeded
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl From<url::ParseError> for ModbusError {
    fn from(err: url::ParseError) -> Self {
        Self::UrlParse(err.to_string())
    }
}
