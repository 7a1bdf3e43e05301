//! Wire-format and protocol size limits.
//!
//! Values are the standard Modbus application-protocol limits (Modbus_Application_Protocol_V1_1b3):
//! a PDU never exceeds 253 bytes, a TCP ADU never exceeds 260 (7-byte MBAP header + 253-byte
//! PDU), and an RTU ADU never exceeds 256 (1-byte unit id + 253-byte PDU + 2-byte CRC).

/// Maximum Modbus protocol-data-unit size, function code included.
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header length: 2-byte transaction id, 2-byte protocol id, 2-byte length, 1-byte unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum TCP application-data-unit size.
pub const MAX_TCP_ADU_SIZE: usize = MBAP_HEADER_LEN + MAX_PDU_SIZE;

/// Maximum RTU application-data-unit size (unit id + PDU + 2-byte CRC).
pub const MAX_RTU_ADU_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Hard cap on the `quantity` field of FC1/FC2 read requests.
pub const MAX_READ_COILS: u16 = 2000;

/// Hard cap on the `quantity` field of FC3/FC4 read requests.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Hard cap on the `quantity` field of FC15 write-multiple-coils requests.
pub const MAX_WRITE_COILS: u16 = 1968;

/// Hard cap on the `quantity` field of FC16 write-multiple-registers requests.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus RTU CRC16 polynomial (reflected 0x8005), used with `init = 0xFFFF`.
pub const CRC16_MODBUS_POLY: u16 = 0xA001;
pub const CRC16_MODBUS_INIT: u16 = 0xFFFF;

/// Default timeouts, per the concurrency & resource model.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2_000;
pub const SHORT_POLL_QUANTUM_US: u64 = 500;
pub const JOB_HEALTH_LOG_TICK_SECS: u64 = 60;

/// Serial-specific turnaround delay after a write, before the first read.
pub const SERIAL_POST_WRITE_DELAY_MS: u64 = 30;

/// Poller backoff bounds.
pub const BACKOFF_INITIAL_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 60_000;
pub const BACKOFF_RESET_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Duration-string upper bound: values beyond this are rejected as a guard against
/// misparsed nanosecond integers being interpreted as huge durations.
pub const MAX_DURATION_HOURS: i64 = 8_640;
