//! Indexed view over a contiguous register payload, decoding scalars with configurable
//! byte/word order.

use crate::byte_order::ByteOrder;
use crate::error::{ModbusError, Result};

/// A byte buffer paired with the logical address of its first register. Borrows from a
/// parsed response payload; never outlives it.
#[derive(Debug, Clone, Copy)]
pub struct RegisterView<'a> {
    bytes: &'a [u8],
    base_address: u16,
}

impl<'a> RegisterView<'a> {
    /// `bytes` must hold a whole number of 2-byte registers.
    pub fn new(bytes: &'a [u8], base_address: u16) -> Self {
        Self { bytes, base_address }
    }

    pub fn base_address(&self) -> u16 {
        self.base_address
    }

    pub fn register_count(&self) -> usize {
        self.bytes.len() / 2
    }

    fn byte_offset(&self, addr: u16, byte_len: usize) -> Result<usize> {
        if addr < self.base_address {
            return Err(ModbusError::AddressOutOfBounds(format!(
                "address {addr} before base {base}",
                base = self.base_address
            )));
        }
        let offset = (addr - self.base_address) as usize * 2;
        if offset + byte_len > self.bytes.len() {
            return Err(ModbusError::AddressOutOfBounds(format!(
                "address {addr} + size {byte_len} past end (have {have} bytes from base {base})",
                have = self.bytes.len(),
                base = self.base_address
            )));
        }
        Ok(offset)
    }

    /// Raw 2 bytes of the register at `addr`.
    pub fn register(&self, addr: u16) -> Result<[u8; 2]> {
        let offset = self.byte_offset(addr, 2)?;
        Ok([self.bytes[offset], self.bytes[offset + 1]])
    }

    /// Bit `n` (0..15) of the register at `addr`: 0..7 low byte LSB-first, 8..15 high byte
    /// LSB-first.
    pub fn bit(&self, addr: u16, n: u8) -> Result<bool> {
        if n > 15 {
            return Err(ModbusError::BitIndexOutOfRange(n));
        }
        let reg = self.register(addr)?;
        let (byte, bit) = if n < 8 { (reg[1], n) } else { (reg[0], n - 8) };
        Ok((byte >> bit) & 0x01 != 0)
    }

    pub fn byte(&self, addr: u16, from_high: bool) -> Result<u8> {
        let reg = self.register(addr)?;
        Ok(if from_high { reg[0] } else { reg[1] })
    }

    pub fn uint8(&self, addr: u16, from_high: bool) -> Result<u8> {
        self.byte(addr, from_high)
    }

    pub fn int8(&self, addr: u16, from_high: bool) -> Result<i8> {
        Ok(self.byte(addr, from_high)? as i8)
    }

    pub fn uint16(&self, addr: u16) -> Result<u16> {
        let reg = self.register(addr)?;
        Ok(u16::from_be_bytes(reg))
    }

    pub fn int16(&self, addr: u16) -> Result<i16> {
        Ok(self.uint16(addr)? as i16)
    }

    /// Select `size` bytes starting at `addr`, applying word-swap then byte-swap per the
    /// configured byte order, leaving the result big-endian for final numeric interpretation.
    fn ordered_bytes(&self, addr: u16, size: usize, order: ByteOrder) -> Result<Vec<u8>> {
        let offset = self.byte_offset(addr, size)?;
        let raw = &self.bytes[offset..offset + size];
        let mut registers: Vec<[u8; 2]> = raw.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
        if order.low_word_first() && registers.len() > 1 {
            registers.reverse();
        }
        if order.low_byte_first() {
            for reg in &mut registers {
                reg.swap(0, 1);
            }
        }
        Ok(registers.into_iter().flatten().collect())
    }

    pub fn uint32(&self, addr: u16, order: ByteOrder) -> Result<u32> {
        let bytes = self.ordered_bytes(addr, 4, order)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn int32(&self, addr: u16, order: ByteOrder) -> Result<i32> {
        Ok(self.uint32(addr, order)? as i32)
    }

    pub fn uint64(&self, addr: u16, order: ByteOrder) -> Result<u64> {
        let bytes = self.ordered_bytes(addr, 8, order)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn int64(&self, addr: u16, order: ByteOrder) -> Result<i64> {
        Ok(self.uint64(addr, order)? as i64)
    }

    pub fn float32(&self, addr: u16, order: ByteOrder) -> Result<f32> {
        let bytes = self.ordered_bytes(addr, 4, order)?;
        Ok(f32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn float64(&self, addr: u16, order: ByteOrder) -> Result<f64> {
        let bytes = self.ordered_bytes(addr, 8, order)?;
        Ok(f64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// String at `addr` spanning `ceil(length/2)` registers; trims trailing zero bytes after
    /// applying byte-order swap, then truncates to `length` bytes (odd lengths drop the last
    /// padding byte of the final register).
    pub fn string(&self, addr: u16, length: usize, order: ByteOrder) -> Result<String> {
        let reg_count = length.div_ceil(2);
        let byte_len = reg_count * 2;
        let bytes = self.ordered_bytes(addr, byte_len, order)?;
        let truncated = &bytes[..length];
        let trimmed_end = truncated.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Ok(String::from_utf8_lossy(&truncated[..trimmed_end]).into_owned())
    }

    /// Raw bytes at `addr` spanning `ceil(length/2)` registers, truncated to `length` bytes.
    pub fn raw_bytes(&self, addr: u16, length: usize, order: ByteOrder) -> Result<Vec<u8>> {
        let reg_count = length.div_ceil(2);
        let byte_len = reg_count * 2;
        let bytes = self.ordered_bytes(addr, byte_len, order)?;
        Ok(bytes[..length].to_vec())
    }

    /// True iff the `byte_count` raw bytes at `addr` equal `pattern` exactly (no byte-order
    /// transform applied — this compares the wire bytes, matching how `invalid` patterns are
    /// declared).
    pub fn equal_bytes(&self, addr: u16, byte_count: usize, pattern: &[u8]) -> Result<bool> {
        let offset = self.byte_offset(addr, byte_count)?;
        Ok(&self.bytes[offset..offset + byte_count] == pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_fc3_decode() {
        // Registers 18-21: 00 01 FF FF FF FF FF FF.
        let data = [0x00u8, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let view = RegisterView::new(&data, 18);
        assert_eq!(view.int64(18, ByteOrder::BigEndian).unwrap(), 0x0001_FFFF_FFFF_FFFFi64);
        assert_eq!(view.uint16(19).unwrap(), 0xFFFF);
    }

    #[test]
    fn address_before_base_errors() {
        let data = [0u8; 4];
        let view = RegisterView::new(&data, 10);
        assert!(view.register(5).is_err());
    }

    #[test]
    fn address_past_end_errors() {
        let data = [0u8; 4];
        let view = RegisterView::new(&data, 0);
        assert!(view.register(2).is_err());
    }

    #[test]
    fn bit_index_out_of_range() {
        let data = [0u8; 2];
        let view = RegisterView::new(&data, 0);
        assert!(view.bit(0, 16).is_err());
    }

    #[test]
    fn bit_indexing_matches_low_high_byte_convention() {
        // register = [high=0b0000_0010, low=0b0000_0001]
        let data = [0b0000_0010u8, 0b0000_0001];
        let view = RegisterView::new(&data, 0);
        assert!(view.bit(0, 0).unwrap());
        assert!(!view.bit(0, 1).unwrap());
        assert!(view.bit(0, 9).unwrap());
        assert!(!view.bit(0, 8).unwrap());
    }

    #[test]
    fn byte_order_round_trip_all_variants() {
        // 32-bit value 0x12345678 laid out per each order, decoded back.
        let cases = [
            (ByteOrder::BigEndian, [0x12, 0x34, 0x56, 0x78]),
            (ByteOrder::LittleEndian, [0x78, 0x56, 0x34, 0x12]),
            (ByteOrder::BigEndianSwap, [0x56, 0x78, 0x12, 0x34]),
            (ByteOrder::LittleEndianSwap, [0x34, 0x12, 0x78, 0x56]),
        ];
        for (order, bytes) in cases {
            let view = RegisterView::new(&bytes, 0);
            assert_eq!(view.uint32(0, order).unwrap(), 0x1234_5678, "{order}");
        }
    }

    #[test]
    fn string_trims_trailing_zero_and_truncates_odd_length() {
        let data = [b'h', b'i', 0x00, 0x00];
        let view = RegisterView::new(&data, 0);
        assert_eq!(view.string(0, 3, ByteOrder::BigEndian).unwrap(), "hi");
    }

    #[test]
    fn equal_bytes_matches_invalid_pattern() {
        let data = [0xFFu8, 0xFF];
        let view = RegisterView::new(&data, 0);
        assert!(view.equal_bytes(0, 2, &[0xFF, 0xFF]).unwrap());
        assert!(!view.equal_bytes(0, 2, &[0x00, 0x00]).unwrap());
    }
}
