// Bounded in-memory decompression of one BLCKDIFF section.
//
// Sections are written by the patch generator with gzip, but zlib-wrapped
// and raw DEFLATE streams are accepted too. The container is sniffed from
// the leading bytes and decoded with the matching flate2 reader, bounded by
// `Read::take`. A section must end exactly where its stream ends.

use std::io::{self, Read};

use flate2::bufread::{DeflateDecoder, GzDecoder, ZlibDecoder};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecompressError {
    /// Input ended before the compressed stream terminated.
    #[error("compressed stream is truncated")]
    Truncated,
    /// Malformed container or DEFLATE data.
    #[error("compressed stream is corrupt: {0}")]
    Corrupt(String),
    /// Output would exceed the caller's bound.
    #[error("decompressed data exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl From<io::Error> for DecompressError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            _ => Self::Corrupt(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Container detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Gzip,
    Zlib,
    Raw,
}

impl Container {
    fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            return Self::Gzip;
        }
        match data {
            [cmf, flg, ..] if is_zlib_header(*cmf, *flg) => Self::Zlib,
            _ => Self::Raw,
        }
    }
}

/// RFC 1950: method 8, window <= 32 KiB, header check multiple of 31.
fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf & 0x0F == 8 && cmf >> 4 <= 7 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Decompress `compressed`, failing if the output would exceed `max_size`.
///
/// An empty input is an empty section and yields an empty output.
pub fn inflate(compressed: &[u8], max_size: usize) -> Result<Vec<u8>, DecompressError> {
    let mut out = Vec::new();
    inflate_into(compressed, max_size, &mut out)?;
    Ok(out)
}

/// Like [`inflate`], but decompresses into a reusable buffer.
///
/// `out` is cleared first. Returns the decompressed length.
pub fn inflate_into(
    compressed: &[u8],
    max_size: usize,
    out: &mut Vec<u8>,
) -> Result<usize, DecompressError> {
    out.clear();
    if compressed.is_empty() {
        return Ok(0);
    }

    let rest = match Container::detect(compressed) {
        Container::Gzip => {
            let decoder = read_bounded(GzDecoder::new(compressed), max_size, out)?;
            decoder.into_inner()
        }
        Container::Zlib => {
            let decoder = read_bounded(ZlibDecoder::new(compressed), max_size, out)?;
            decoder.into_inner()
        }
        Container::Raw => {
            let decoder = read_bounded(DeflateDecoder::new(compressed), max_size, out)?;
            decoder.into_inner()
        }
    };
    if !rest.is_empty() {
        return Err(DecompressError::Corrupt(format!(
            "{} trailing bytes after end of stream",
            rest.len()
        )));
    }

    Ok(out.len())
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Read `decoder` to its end, allowing at most `max_size` output bytes.
/// Returns the decoder so the caller can inspect the unconsumed input.
fn read_bounded<D: Read>(
    decoder: D,
    max_size: usize,
    out: &mut Vec<u8>,
) -> Result<D, DecompressError> {
    let limit = (max_size as u64).saturating_add(1);
    let mut bounded = decoder.take(limit);
    bounded.read_to_end(out)?;
    if out.len() > max_size {
        return Err(DecompressError::TooLarge { limit: max_size });
    }
    Ok(bounded.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
