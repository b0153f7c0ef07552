// BLCKDIFF container format.
//
// - `header` — patch header, per-block delta header, tokens
// - `offset` — sign-magnitude 8-byte integers used by control triples

pub mod header;
pub mod offset;

pub use header::{
    BLOCK_HEADER_LEN, BlockDeltaHeader, FormatError, PATCH_HEADER_LEN, PATCH_SIGNATURE,
    PREAMBLE_CHECKSUM_LEN, PatchHeader, Token,
};
