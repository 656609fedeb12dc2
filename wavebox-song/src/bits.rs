//! Bit-stream codec over 6-bit base64 digits
//!
//! The binary song format packs values at bit granularity, then groups the
//! flat bit array into 6-bit symbols mapped to a URL-safe base64 alphabet.
//! Fixed-width fields use [`BitWriter::write`] / [`BitReader::read`];
//! unbounded small-biased fields (note durations, pin counts, pitch deltas)
//! use the unary-prefixed "long tail" code.

use crate::SongError;

/// URL-safe base64 alphabet used by the song format
pub const BASE64_ALPHABET: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_";

/// Reverse lookup from byte to 6-bit digit value (255 = invalid)
const BASE64_VALUES: [u8; 256] = {
    let mut table = [255u8; 256];
    let mut i = 0;
    while i < 64 {
        table[BASE64_ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Map a 6-bit digit value to its alphabet character
#[inline]
pub fn base64_char(digit: u8) -> u8 {
    BASE64_ALPHABET[(digit & 0x3F) as usize]
}

/// Map an alphabet character back to its 6-bit digit value
#[inline]
pub fn base64_value(c: u8) -> Result<u8, SongError> {
    match BASE64_VALUES[c as usize] {
        255 => Err(SongError::InvalidCharacter(c as char)),
        v => Ok(v),
    }
}

/// Writes bits big-endian into a growing sequence of 6-bit digits
#[derive(Debug, Default)]
pub struct BitWriter {
    digits: Vec<u8>,
    /// Pending bits, most significant first
    acc: u64,
    acc_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the low `bit_count` bits of `value`, most significant first
    pub fn write(&mut self, bit_count: u32, value: u32) {
        debug_assert!(bit_count <= 32);
        let masked = if bit_count >= 32 {
            value as u64
        } else {
            (value as u64) & ((1u64 << bit_count) - 1)
        };
        self.acc = (self.acc << bit_count) | masked;
        self.acc_bits += bit_count;
        while self.acc_bits >= 6 {
            self.acc_bits -= 6;
            self.digits.push(((self.acc >> self.acc_bits) & 0x3F) as u8);
        }
        // Keep only the remaining low bits so the accumulator never overflows
        if self.acc_bits == 0 {
            self.acc = 0;
        } else {
            self.acc &= (1u64 << self.acc_bits) - 1;
        }
    }

    /// Append a value using the unary-prefixed variable-length code
    ///
    /// While the remainder does not fit in the current bit width (starting at
    /// `min_bits`), a `1` bit is emitted and one width's worth subtracted;
    /// a `0` bit terminates the prefix and the remainder follows verbatim.
    /// Values below `min_value` indicate a logic error upstream and abort.
    pub fn write_long_tail(&mut self, min_value: u32, min_bits: u32, value: u32) {
        assert!(
            value >= min_value,
            "long-tail value {value} below minimum {min_value}"
        );
        let mut remainder = (value - min_value) as u64;
        let mut bits = min_bits;
        while remainder >= (1u64 << bits) {
            self.write(1, 1);
            remainder -= 1u64 << bits;
            bits += 1;
        }
        self.write(1, 0);
        self.write(bits, remainder as u32);
    }

    /// Number of 6-bit digits written so far, counting a partial digit
    pub fn digit_len(&self) -> usize {
        self.digits.len() + if self.acc_bits > 0 { 1 } else { 0 }
    }

    /// Flush, zero-padding the final partial digit, and return the digits
    pub fn finish(mut self) -> Vec<u8> {
        if self.acc_bits > 0 {
            let pad = 6 - self.acc_bits;
            self.digits
                .push(((self.acc << pad) & 0x3F) as u8);
            self.acc = 0;
            self.acc_bits = 0;
        }
        self.digits
    }
}

/// Reads bits big-endian from a sequence of 6-bit digits
#[derive(Debug)]
pub struct BitReader<'a> {
    digits: &'a [u8],
    /// Absolute bit position
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(digits: &'a [u8]) -> Self {
        Self { digits, pos: 0 }
    }

    /// Total bits consumed so far
    pub fn bits_read(&self) -> usize {
        self.pos
    }

    /// Read `bit_count` bits, most significant first
    pub fn read(&mut self, bit_count: u32) -> Result<u32, SongError> {
        debug_assert!(bit_count <= 32);
        let mut value: u64 = 0;
        let mut remaining = bit_count;
        while remaining > 0 {
            let digit_index = self.pos / 6;
            let bit_index = (self.pos % 6) as u32;
            let digit = *self
                .digits
                .get(digit_index)
                .ok_or(SongError::UnexpectedEnd)? as u64;
            let available = 6 - bit_index;
            let take = available.min(remaining);
            let shifted = (digit >> (available - take)) & ((1u64 << take) - 1);
            value = (value << take) | shifted;
            self.pos += take as usize;
            remaining -= take;
        }
        Ok(value as u32)
    }

    /// Read a value written by [`BitWriter::write_long_tail`]
    pub fn read_long_tail(&mut self, min_value: u32, min_bits: u32) -> Result<u32, SongError> {
        let mut result = min_value as u64;
        let mut bits = min_bits;
        while self.read(1)? != 0 {
            result += 1u64 << bits;
            bits += 1;
            if bits > 32 {
                return Err(SongError::BitStreamOverrun);
            }
        }
        result += self.read(bits)? as u64;
        if result > u32::MAX as u64 {
            return Err(SongError::BitStreamOverrun);
        }
        Ok(result as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_fixed(values: &[(u32, u32)]) {
        let mut writer = BitWriter::new();
        for &(bits, value) in values {
            writer.write(bits, value);
        }
        let digits = writer.finish();
        let mut reader = BitReader::new(&digits);
        for &(bits, value) in values {
            assert_eq!(reader.read(bits).unwrap(), value, "width {bits}");
        }
    }

    #[test]
    fn test_fixed_width_roundtrip() {
        roundtrip_fixed(&[
            (1, 0),
            (1, 1),
            (3, 5),
            (6, 63),
            (7, 100),
            (12, 4095),
            (16, 0xBEEF),
            (32, u32::MAX),
            (32, 0),
        ]);
    }

    #[test]
    fn test_fixed_width_masks_high_bits() {
        let mut writer = BitWriter::new();
        writer.write(4, 0xFF);
        let digits = writer.finish();
        let mut reader = BitReader::new(&digits);
        assert_eq!(reader.read(4).unwrap(), 0xF);
    }

    #[test]
    fn test_long_tail_roundtrip() {
        for min_value in [0u32, 1, 5] {
            for min_bits in [1u32, 2, 4] {
                for offset in [0u32, 1, 2, 3, 7, 8, 15, 16, 100, 1000, 65535] {
                    let value = min_value + offset;
                    let mut writer = BitWriter::new();
                    writer.write_long_tail(min_value, min_bits, value);
                    let digits = writer.finish();
                    let mut reader = BitReader::new(&digits);
                    assert_eq!(reader.read_long_tail(min_value, min_bits).unwrap(), value);
                }
            }
        }
    }

    #[test]
    fn test_long_tail_consumes_exactly_what_was_written() {
        let mut writer = BitWriter::new();
        writer.write_long_tail(1, 2, 77);
        writer.write(5, 19);
        let digits = writer.finish();
        let mut reader = BitReader::new(&digits);
        assert_eq!(reader.read_long_tail(1, 2).unwrap(), 77);
        assert_eq!(reader.read(5).unwrap(), 19);
    }

    #[test]
    fn test_long_tail_length_grows_with_value() {
        let mut last_bits = 0;
        for value in [0u32, 1, 3, 4, 11, 12, 27, 28, 1000, 100_000] {
            let mut writer = BitWriter::new();
            writer.write_long_tail(0, 2, value);
            let bits_estimate = {
                // Count bits by reading back until the terminator
                let digits = writer.finish();
                let mut reader = BitReader::new(&digits);
                reader.read_long_tail(0, 2).unwrap();
                reader.bits_read()
            };
            assert!(
                bits_estimate >= last_bits,
                "encoding shrank at value {value}"
            );
            last_bits = bits_estimate;
        }
    }

    #[test]
    #[should_panic(expected = "below minimum")]
    fn test_long_tail_rejects_value_below_minimum() {
        let mut writer = BitWriter::new();
        writer.write_long_tail(5, 2, 4);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let mut writer = BitWriter::new();
        writer.write(6, 42);
        let digits = writer.finish();
        let mut reader = BitReader::new(&digits);
        assert_eq!(reader.read(6).unwrap(), 42);
        assert!(reader.read(6).is_err());
    }

    #[test]
    fn test_base64_alphabet_is_invertible() {
        for digit in 0..64u8 {
            let c = base64_char(digit);
            assert_eq!(base64_value(c).unwrap(), digit);
        }
        assert!(base64_value(b'~').is_err());
        assert!(base64_value(b' ').is_err());
    }
}
