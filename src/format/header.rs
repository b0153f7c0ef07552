// BLCKDIFF patch header and per-block delta header.
//
// Layout (all integers little-endian):
//
//   PatchHeader       signature[8] | old_block_count u32 | new_block_count u32
//   BlockDeltaHeader  token u32 | block_number u32 | ctrl_size u32 |
//                     diff_size u32 | extra_size u32 |
//                     new_block_compressed_size u64 | new_block_size u64 |
//                     new_block_crc u32

use std::fmt;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic bytes opening every patch stream.
pub const PATCH_SIGNATURE: [u8; 8] = *b"BLCKDIFF";

/// Encoded size of [`PatchHeader`].
pub const PATCH_HEADER_LEN: usize = 16;

/// Encoded size of [`BlockDeltaHeader`].
pub const BLOCK_HEADER_LEN: usize = 40;

/// Size of the image checksum that opens a preamble.
pub const PREAMBLE_CHECKSUM_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Per-block operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// New block is identical to the old block.
    Skip,
    /// New block is reconstructed from the old block and a bsdiff delta.
    Modify,
    /// New block has no old counterpart; its bytes are the extra section.
    Add,
    /// Old block has no new counterpart; the image ends here.
    Remove,
}

impl Token {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Skip),
            1 => Some(Self::Modify),
            2 => Some(Self::Add),
            3 => Some(Self::Remove),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Skip => 0,
            Self::Modify => 1,
            Self::Add => 2,
            Self::Remove => 3,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Skip => "skip",
            Self::Modify => "modify",
            Self::Add => "add",
            Self::Remove => "remove",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Patch header
// ---------------------------------------------------------------------------

/// Stream-level header, parsed once from the first bytes of the patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub signature: [u8; 8],
    pub old_block_count: u32,
    pub new_block_count: u32,
}

impl PatchHeader {
    pub fn new(old_block_count: u32, new_block_count: u32) -> Self {
        Self {
            signature: PATCH_SIGNATURE,
            old_block_count,
            new_block_count,
        }
    }

    /// Parse the header from the first [`PATCH_HEADER_LEN`] bytes of `buf`.
    ///
    /// The signature is not checked here; see [`PatchHeader::has_valid_signature`].
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let buf = buf.get(..PATCH_HEADER_LEN).ok_or(FormatError::Short {
            what: "patch header",
            need: PATCH_HEADER_LEN,
            have: buf.len(),
        })?;
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[..8]);
        Ok(Self {
            signature,
            old_block_count: le_u32(&buf[8..]),
            new_block_count: le_u32(&buf[12..]),
        })
    }

    pub fn encode(&self) -> [u8; PATCH_HEADER_LEN] {
        let mut out = [0u8; PATCH_HEADER_LEN];
        out[..8].copy_from_slice(&self.signature);
        out[8..12].copy_from_slice(&self.old_block_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.new_block_count.to_le_bytes());
        out
    }

    pub fn has_valid_signature(&self) -> bool {
        self.signature == PATCH_SIGNATURE
    }

    /// Number of blocks present in both images.
    pub fn common_blocks(&self) -> u32 {
        self.old_block_count.min(self.new_block_count)
    }
}

// ---------------------------------------------------------------------------
// Block delta header
// ---------------------------------------------------------------------------

/// Header preceding the three compressed sections of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDeltaHeader {
    pub token: Token,
    pub block_number: u32,
    pub ctrl_size: u32,
    pub diff_size: u32,
    pub extra_size: u32,
    /// Carried on the wire but unused when patching uncompressed images.
    pub new_block_compressed_size: u64,
    pub new_block_size: u64,
    pub new_block_crc: u32,
}

impl BlockDeltaHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let buf = buf.get(..BLOCK_HEADER_LEN).ok_or(FormatError::Short {
            what: "block header",
            need: BLOCK_HEADER_LEN,
            have: buf.len(),
        })?;
        let raw_token = le_u32(&buf[0..]);
        let block_number = le_u32(&buf[4..]);
        let token = Token::from_u32(raw_token).ok_or(FormatError::UnknownToken {
            block: block_number,
            token: raw_token,
        })?;
        Ok(Self {
            token,
            block_number,
            ctrl_size: le_u32(&buf[8..]),
            diff_size: le_u32(&buf[12..]),
            extra_size: le_u32(&buf[16..]),
            new_block_compressed_size: le_u64(&buf[20..]),
            new_block_size: le_u64(&buf[28..]),
            new_block_crc: le_u32(&buf[36..]),
        })
    }

    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut out = [0u8; BLOCK_HEADER_LEN];
        out[0..4].copy_from_slice(&self.token.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&self.block_number.to_le_bytes());
        out[8..12].copy_from_slice(&self.ctrl_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.diff_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.extra_size.to_le_bytes());
        out[20..28].copy_from_slice(&self.new_block_compressed_size.to_le_bytes());
        out[28..36].copy_from_slice(&self.new_block_size.to_le_bytes());
        out[36..40].copy_from_slice(&self.new_block_crc.to_le_bytes());
        out
    }

    /// Total compressed bytes following this header.
    pub fn delta_len(&self) -> u64 {
        u64::from(self.ctrl_size) + u64::from(self.diff_size) + u64::from(self.extra_size)
    }
}

#[inline]
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while framing the patch stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("{what} needs {need} bytes, have {have}")]
    Short {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("block {block}: unknown token {token}")]
    UnknownToken { block: u32, token: u32 },
    #[error("block {block}: record of {size} bytes exceeds limit of {limit}")]
    RecordTooLarge { block: u32, size: u64, limit: u64 },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
