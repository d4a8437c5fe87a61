//! QuickXOR content hashing
//!
//! The remote store reports a 160-bit QuickXOR digest for file content.
//! Each input byte is XORed into a 160-bit circular register at a position
//! that advances 11 bits per byte; the total input length is then folded
//! into the low 64 bits of the register. The engine treats digests as
//! opaque bytes; equality is the only operation that matters.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Digest width in bytes.
pub const DIGEST_SIZE: usize = 20;

const WIDTH_BITS: usize = DIGEST_SIZE * 8; // 160
const CELLS: usize = (WIDTH_BITS - 1) / 64 + 1; // 3
const SHIFT: usize = 11;

/// Streaming QuickXOR hasher.
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    data: [u64; CELLS],
    length_so_far: u64,
    shift_so_far: usize,
}

impl QuickXorHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0; CELLS],
            length_so_far: 0,
            shift_so_far: 0,
        }
    }

    /// Fold `buf` into the register.
    pub fn update(&mut self, buf: &[u8]) {
        let mut vector_array_index = self.shift_so_far / 64;
        let mut vector_offset = self.shift_so_far % 64;
        let iterations = buf.len().min(WIDTH_BITS);

        for i in 0..iterations {
            let is_last_cell = vector_array_index == CELLS - 1;
            let bits_in_cell = if is_last_cell { WIDTH_BITS % 64 } else { 64 };

            if vector_offset + 8 <= bits_in_cell {
                // Byte fits within the current cell.
                let mut j = i;
                while j < buf.len() {
                    self.data[vector_array_index] ^= u64::from(buf[j]) << vector_offset;
                    j += WIDTH_BITS;
                }
            } else {
                // Byte straddles the cell boundary; the last cell wraps to
                // the first.
                let index1 = vector_array_index;
                let index2 = if is_last_cell {
                    0
                } else {
                    vector_array_index + 1
                };
                let low = bits_in_cell - vector_offset;

                let mut xored: u8 = 0;
                let mut j = i;
                while j < buf.len() {
                    xored ^= buf[j];
                    j += WIDTH_BITS;
                }
                self.data[index1] ^= u64::from(xored) << vector_offset;
                self.data[index2] ^= u64::from(xored) >> low;
            }

            vector_offset += SHIFT;
            while vector_offset >= bits_in_cell {
                vector_array_index = if is_last_cell {
                    0
                } else {
                    vector_array_index + 1
                };
                vector_offset -= bits_in_cell;
            }
        }

        self.shift_so_far = (self.shift_so_far + SHIFT * (buf.len() % WIDTH_BITS)) % WIDTH_BITS;
        self.length_so_far += buf.len() as u64;
    }

    /// Finish hashing and return the digest.
    #[must_use]
    pub fn finalize(&self) -> ContentHash {
        let mut out = [0u8; DIGEST_SIZE];

        // Register as little-endian bytes: two full cells plus the 32-bit
        // remainder of the last cell.
        let mut pos = 0;
        for cell in &self.data[..CELLS - 1] {
            out[pos..pos + 8].copy_from_slice(&cell.to_le_bytes());
            pos += 8;
        }
        out[pos..pos + 4].copy_from_slice(&self.data[CELLS - 1].to_le_bytes()[..4]);

        // Fold the length into the trailing 8 bytes.
        for (i, b) in self.length_so_far.to_le_bytes().iter().enumerate() {
            out[DIGEST_SIZE - 8 + i] ^= b;
        }

        ContentHash(out)
    }

    /// Hash a complete buffer in one call.
    #[must_use]
    pub fn digest(buf: &[u8]) -> ContentHash {
        let mut hasher = Self::new();
        hasher.update(buf);
        hasher.finalize()
    }
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A finished 160-bit QuickXOR digest.
///
/// Rendered as lowercase hex for storage and logs; compared as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; DIGEST_SIZE]);

impl ContentHash {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Parse the lowercase-hex rendering.
    pub fn parse_hex(s: &str) -> Result<Self, CoreError> {
        if s.len() != DIGEST_SIZE * 2 {
            return Err(CoreError::Validation(format!(
                "content hash must be {} hex chars, got {}",
                DIGEST_SIZE * 2,
                s.len()
            )));
        }
        let mut out = [0u8; DIGEST_SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

fn hex_val(c: u8) -> Result<u8, CoreError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(CoreError::Validation(format!(
            "invalid hex character: {}",
            c as char
        ))),
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse_hex(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_all_zeros() {
        let digest = QuickXorHasher::digest(b"");
        assert_eq!(digest.as_bytes(), &[0u8; DIGEST_SIZE]);
        assert_eq!(digest.to_string(), "0".repeat(40));
    }

    #[test]
    fn test_single_byte_vector() {
        // One byte 0xff lands at bit 0 of the register; length 1 folds into
        // byte 12 of the little-endian output.
        let digest = QuickXorHasher::digest(&[0xff]);
        let mut expected = [0u8; DIGEST_SIZE];
        expected[0] = 0xff;
        expected[12] = 0x01;
        assert_eq!(digest.as_bytes(), &expected);
    }

    #[test]
    fn test_two_byte_vector() {
        // 0x01 at bit 0, 0x02 at bit 11, length 2 at byte 12.
        let digest = QuickXorHasher::digest(&[0x01, 0x02]);
        let mut expected = [0u8; DIGEST_SIZE];
        expected[0] = 0x01;
        expected[1] = 0x10;
        expected[12] = 0x02;
        assert_eq!(digest.as_bytes(), &expected);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let one_shot = QuickXorHasher::digest(&data);

        let mut hasher = QuickXorHasher::new();
        for chunk in data.chunks(37) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), one_shot);
    }

    #[test]
    fn test_different_content_differs() {
        assert_ne!(
            QuickXorHasher::digest(b"hello"),
            QuickXorHasher::digest(b"HELLO")
        );
    }

    #[test]
    fn test_length_is_significant() {
        // Same register contribution, different length fold.
        assert_ne!(
            QuickXorHasher::digest(&[0x00]),
            QuickXorHasher::digest(&[0x00, 0x00])
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = QuickXorHasher::digest(b"roundtrip me");
        let rendered = digest.to_string();
        assert_eq!(ContentHash::parse_hex(&rendered).unwrap(), digest);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ContentHash::parse_hex("abc").is_err());
        assert!(ContentHash::parse_hex(&"zz".repeat(20)).is_err());
    }
}
