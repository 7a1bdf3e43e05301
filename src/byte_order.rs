//! Byte/word order for multi-register scalar decoding.
//!
//! Registers are always 2 bytes, big-endian within the register, on the wire.
//! `ByteOrder` controls how a value spanning multiple registers is reassembled.

/// Four-way combination of within-register endianness and across-register word order,
/// plus two 16-bit-only variants for single-register fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// ABCD: high word first, big-endian within each register.
    #[default]
    BigEndian,
    /// DCBA: low word first, little-endian within each register.
    LittleEndian,
    /// CDAB: low word first, big-endian within each register.
    BigEndianSwap,
    /// BADC: high word first, little-endian within each register.
    LittleEndianSwap,
    /// AB: big-endian, 16-bit values only.
    BigEndian16,
    /// BA: little-endian, 16-bit values only.
    LittleEndian16,
}

impl ByteOrder {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized = s.to_uppercase().replace('-', "").replace('_', "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIGENDIAN" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLEENDIAN" => Some(Self::LittleEndian),
            "CDAB" | "BIGENDIANSWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLEENDIANSWAP" => Some(Self::LittleEndianSwap),
            "AB" => Some(Self::BigEndian16),
            "BA" => Some(Self::LittleEndian16),
            _ => None,
        }
    }

    /// Low-word-first flag: true for orders that put the least-significant
    /// register first on the wire.
    pub fn low_word_first(self) -> bool {
        matches!(self, Self::LittleEndian | Self::BigEndianSwap)
    }

    /// Low-byte-first flag: true for orders that are little-endian within
    /// each individual register.
    pub fn low_byte_first(self) -> bool {
        matches!(
            self,
            Self::LittleEndian | Self::LittleEndianSwap | Self::LittleEndian16
        )
    }

    pub fn is_16bit_only(self) -> bool {
        matches!(self, Self::BigEndian16 | Self::LittleEndian16)
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
            Self::BigEndian16 => "AB",
            Self::LittleEndian16 => "BA",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_recognises_all_variants() {
        assert_eq!(ByteOrder::from_str("ABCD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("dcba"), Some(ByteOrder::LittleEndian));
        assert_eq!(ByteOrder::from_str("CD-AB"), Some(ByteOrder::BigEndianSwap));
        assert_eq!(
            ByteOrder::from_str("BA_DC"),
            Some(ByteOrder::LittleEndianSwap)
        );
        assert_eq!(ByteOrder::from_str("AB"), Some(ByteOrder::BigEndian16));
        assert_eq!(ByteOrder::from_str("nonsense"), None);
    }

    #[test]
    fn flags_match_naming_convention() {
        assert!(!ByteOrder::BigEndian.low_word_first());
        assert!(!ByteOrder::BigEndian.low_byte_first());
        assert!(ByteOrder::LittleEndian.low_word_first());
        assert!(ByteOrder::LittleEndian.low_byte_first());
        assert!(ByteOrder::BigEndianSwap.low_word_first());
        assert!(!ByteOrder::BigEndianSwap.low_byte_first());
        assert!(!ByteOrder::LittleEndianSwap.low_word_first());
        assert!(ByteOrder::LittleEndianSwap.low_byte_first());
    }

    #[test]
    fn default_is_big_endian() {
        assert_eq!(ByteOrder::default(), ByteOrder::BigEndian);
    }
}
