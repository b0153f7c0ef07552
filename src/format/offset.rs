// Fixed-width signed integers used by BLCKDIFF control triples.
//
// Eight bytes, little-endian, sign-magnitude: bytes 0..7 plus the low seven
// bits of byte 7 hold the magnitude, bit 7 of byte 7 holds the sign. This is
// the classic bsdiff `offtin` layout and is NOT two's complement.

/// Encoded width of one integer.
pub const OFFSET_LEN: usize = 8;

const SIGN_BIT: u64 = 1 << 63;

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one integer from the first eight bytes of `buf`.
///
/// Fails only when fewer than eight bytes are available. A set sign bit with
/// a zero magnitude decodes to `0`.
#[inline]
pub fn decode(buf: &[u8]) -> Result<i64, ShortRead> {
    let bytes: [u8; OFFSET_LEN] = buf
        .get(..OFFSET_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(ShortRead {
            available: buf.len(),
        })?;
    let raw = u64::from_le_bytes(bytes);
    let magnitude = (raw & !SIGN_BIT) as i64;
    if raw & SIGN_BIT != 0 {
        Ok(-magnitude)
    } else {
        Ok(magnitude)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `value` in sign-magnitude form.
///
/// `i64::MIN` has no sign-magnitude representation and encodes as `-0`.
#[inline]
pub fn encode(value: i64) -> [u8; OFFSET_LEN] {
    let mut raw = value.unsigned_abs() & !SIGN_BIT;
    if value < 0 {
        raw |= SIGN_BIT;
    }
    raw.to_le_bytes()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Fewer than [`OFFSET_LEN`] bytes were left to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("short integer: need {OFFSET_LEN} bytes, have {available}")]
pub struct ShortRead {
    pub available: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
