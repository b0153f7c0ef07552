// Block patch application.
//
// Reconstructs one new-image block from its (already decompressed) delta
// sections and the corresponding old-image block, then verifies the result
// against the CRC32 carried in the block header. The Modify path is the
// bsdiff reconstruction loop restricted to a single block: the diff section
// holds byte-wise arithmetic deltas against the old block, the extra section
// holds literal bytes, and control triples drive both.

use std::io;

use crate::format::header::{BlockDeltaHeader, Token};
use crate::format::offset::{self, OFFSET_LEN};
use crate::io::SourceImage;

/// Encoded size of one control triple.
pub const CONTROL_TRIPLE_LEN: usize = 3 * OFFSET_LEN;

// ---------------------------------------------------------------------------
// Control triple
// ---------------------------------------------------------------------------

/// One bsdiff step: add `copy_len` diff bytes, copy `extra_len` literal
/// bytes, then move the old-block cursor by `old_seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTriple {
    pub copy_len: u64,
    pub extra_len: u64,
    pub old_seek: i64,
}

impl ControlTriple {
    /// Decode a triple from the first [`CONTROL_TRIPLE_LEN`] bytes of `buf`.
    ///
    /// Returns `None` on short input or a negative length.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let copy_len = offset::decode(buf).ok()?;
        let extra_len = offset::decode(buf.get(OFFSET_LEN..)?).ok()?;
        let old_seek = offset::decode(buf.get(2 * OFFSET_LEN..)?).ok()?;
        Some(Self {
            copy_len: u64::try_from(copy_len).ok()?,
            extra_len: u64::try_from(extra_len).ok()?,
            old_seek,
        })
    }

    /// Encode the triple. Returns `None` if a length does not fit the
    /// 63-bit magnitude of the wire integer.
    pub fn encode(&self) -> Option<[u8; CONTROL_TRIPLE_LEN]> {
        let copy_len = i64::try_from(self.copy_len).ok()?;
        let extra_len = i64::try_from(self.extra_len).ok()?;
        let mut out = [0u8; CONTROL_TRIPLE_LEN];
        out[..8].copy_from_slice(&offset::encode(copy_len));
        out[8..16].copy_from_slice(&offset::encode(extra_len));
        out[16..].copy_from_slice(&offset::encode(self.old_seek));
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// A block delta whose sections have been decompressed.
#[derive(Debug, Clone, Copy)]
pub struct DecodedBlock<'a> {
    pub header: &'a BlockDeltaHeader,
    pub ctrl: &'a [u8],
    pub diff: &'a [u8],
    pub extra: &'a [u8],
}

/// Result of applying one block delta.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutput<'a> {
    /// Verified bytes of the new block.
    Data(&'a [u8]),
    /// The new image ends before this block.
    Truncate,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("block {block}: corrupt patch: {reason}")]
    CorruptPatch { block: u32, reason: String },
    #[error("block {block}: CRC32 mismatch: expected {expected:#010X}, got {actual:#010X}")]
    CrcMismatch {
        block: u32,
        expected: u32,
        actual: u32,
    },
    #[error("block {block}: reading old image: {source}")]
    Io {
        block: u32,
        #[source]
        source: io::Error,
    },
}

fn corrupt(block: u32, reason: impl Into<String>) -> PatchError {
    PatchError::CorruptPatch {
        block,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// BlockPatcher
// ---------------------------------------------------------------------------

/// Applies block deltas against one old image.
///
/// Holds the old-image geometry plus two block-sized buffers that are reused
/// for every block, so memory stays bounded by the block size.
#[derive(Debug)]
pub struct BlockPatcher {
    block_size: usize,
    old_base: u64,
    old_payload_len: u64,
    old_buf: Vec<u8>,
    new_buf: Vec<u8>,
}

impl BlockPatcher {
    /// `old_base` is where block 0 starts in the old image and
    /// `old_payload_len` the number of block bytes after it.
    pub fn new(block_size: usize, old_base: u64, old_payload_len: u64) -> Self {
        Self {
            block_size,
            old_base,
            old_payload_len,
            old_buf: Vec::with_capacity(block_size),
            new_buf: Vec::with_capacity(block_size),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Length of old block `block`: a full block, the remainder for the last
    /// block, or zero past the end of the old image.
    pub fn old_block_len(&self, block: u32) -> usize {
        let start = u64::from(block) * self.block_size as u64;
        self.old_payload_len
            .saturating_sub(start)
            .min(self.block_size as u64) as usize
    }

    /// Reconstruct and verify one block.
    pub fn apply<S: SourceImage + ?Sized>(
        &mut self,
        block: &DecodedBlock<'_>,
        old: &mut S,
    ) -> Result<BlockOutput<'_>, PatchError> {
        let header = block.header;
        let index = header.block_number;

        if header.token == Token::Remove {
            return Ok(BlockOutput::Truncate);
        }
        if header.new_block_size > self.block_size as u64 {
            return Err(corrupt(
                index,
                format!(
                    "new block size {} exceeds block size {}",
                    header.new_block_size, self.block_size
                ),
            ));
        }
        let new_size = header.new_block_size as usize;

        match header.token {
            Token::Skip => {
                self.load_old(index, old)?;
                if self.old_buf.len() != new_size {
                    return Err(corrupt(
                        index,
                        format!(
                            "skip of {} old bytes declares {new_size} new bytes",
                            self.old_buf.len()
                        ),
                    ));
                }
                verify_crc(index, &self.old_buf, header.new_block_crc)?;
                Ok(BlockOutput::Data(&self.old_buf))
            }
            Token::Modify => {
                self.load_old(index, old)?;
                self.reconstruct(index, new_size, block)?;
                verify_crc(index, &self.new_buf, header.new_block_crc)?;
                Ok(BlockOutput::Data(&self.new_buf))
            }
            Token::Add => {
                if block.extra.len() != new_size {
                    return Err(corrupt(
                        index,
                        format!(
                            "added block has {} bytes, header declares {new_size}",
                            block.extra.len()
                        ),
                    ));
                }
                self.new_buf.clear();
                self.new_buf.extend_from_slice(block.extra);
                verify_crc(index, &self.new_buf, header.new_block_crc)?;
                Ok(BlockOutput::Data(&self.new_buf))
            }
            Token::Remove => Ok(BlockOutput::Truncate),
        }
    }

    fn load_old<S: SourceImage + ?Sized>(
        &mut self,
        index: u32,
        old: &mut S,
    ) -> Result<(), PatchError> {
        let len = self.old_block_len(index);
        let offset = self.old_base + u64::from(index) * self.block_size as u64;
        self.old_buf.clear();
        self.old_buf.resize(len, 0);
        old.read_at(offset, &mut self.old_buf)
            .map_err(|source| PatchError::Io {
                block: index,
                source,
            })
    }

    /// bsdiff reconstruction of `new_size` bytes into `new_buf`.
    fn reconstruct(
        &mut self,
        index: u32,
        new_size: usize,
        block: &DecodedBlock<'_>,
    ) -> Result<(), PatchError> {
        let old = &self.old_buf;
        let new = &mut self.new_buf;
        new.clear();
        new.resize(new_size, 0);

        let mut ctrl = block.ctrl;
        let mut diff = block.diff;
        let mut extra = block.extra;
        let mut new_pos = 0usize;
        let mut old_pos = 0i64;

        while new_pos < new_size {
            let triple = ControlTriple::parse(ctrl)
                .ok_or_else(|| corrupt(index, "control section exhausted or negative length"))?;
            ctrl = &ctrl[CONTROL_TRIPLE_LEN..];
            log::trace!("block {index}: {triple:?} at new {new_pos} old {old_pos}");

            // Diff bytes are added to the old bytes they line up with.
            let copy_len = checked_len(index, new_pos, triple.copy_len, new_size)?;
            if diff.len() < copy_len {
                return Err(corrupt(index, "diff section exhausted"));
            }
            let (delta, rest) = diff.split_at(copy_len);
            diff = rest;
            let target = &mut new[new_pos..new_pos + copy_len];
            for (i, (&d, out)) in delta.iter().zip(target).enumerate() {
                *out = d;
                let old_byte = old_pos
                    .checked_add(i as i64)
                    .and_then(|p| usize::try_from(p).ok())
                    .and_then(|p| old.get(p));
                if let Some(&o) = old_byte {
                    *out = d.wrapping_add(o);
                }
            }
            new_pos += copy_len;
            old_pos = old_pos
                .checked_add(copy_len as i64)
                .ok_or_else(|| corrupt(index, "old position overflow"))?;

            // Extra bytes are literal.
            let extra_len = checked_len(index, new_pos, triple.extra_len, new_size)?;
            if extra.len() < extra_len {
                return Err(corrupt(index, "extra section exhausted"));
            }
            let (literal, rest) = extra.split_at(extra_len);
            extra = rest;
            new[new_pos..new_pos + extra_len].copy_from_slice(literal);
            new_pos += extra_len;
            old_pos = old_pos
                .checked_add(triple.old_seek)
                .ok_or_else(|| corrupt(index, "old position overflow"))?;
        }

        Ok(())
    }
}

/// Validate that `len` more bytes at `pos` stay within `bound`.
fn checked_len(index: u32, pos: usize, len: u64, bound: usize) -> Result<usize, PatchError> {
    match usize::try_from(len).ok().and_then(|l| pos.checked_add(l).map(|end| (l, end))) {
        Some((l, end)) if end <= bound => Ok(l),
        _ => Err(corrupt(
            index,
            format!("control length {len} at offset {pos} overruns block of {bound} bytes"),
        )),
    }
}

fn verify_crc(index: u32, data: &[u8], expected: u32) -> Result<(), PatchError> {
    let actual = crc32fast::hash(data);
    if actual != expected {
        return Err(PatchError::CrcMismatch {
            block: index,
            expected,
            actual,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
