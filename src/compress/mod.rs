// Section decompression.
//
// - `inflate` — bounded gzip/zlib/raw DEFLATE decoding of one section

pub mod inflate;

pub use inflate::{DecompressError, inflate, inflate_into};
