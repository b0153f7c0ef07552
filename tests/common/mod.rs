// Patch stream writer shared by the integration tests.
//
// Emits a valid patch for any old/new pair: Skip for identical blocks, a
// single control triple (diff over the common length, literal tail) for
// changed blocks, Add for new blocks and Remove for dropped ones. It is a
// container writer, not a differ.

#![allow(dead_code)]

use std::io::Write;

use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use fotadelta::format::header::{BlockDeltaHeader, PatchHeader, Token};
use fotadelta::patch::ControlTriple;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Zlib,
    Deflate,
}

#[derive(Debug, Clone)]
pub struct PatchBuilder {
    pub block_size: usize,
    pub preamble_len: usize,
    pub codec: Codec,
}

impl PatchBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            preamble_len: 0,
            codec: Codec::Gzip,
        }
    }

    pub fn preamble(mut self, len: usize) -> Self {
        self.preamble_len = len;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Serialize a patch turning `old` into `new`. Both images carry the
    /// preamble (if any) in their first `preamble_len` bytes.
    pub fn build(&self, old: &[u8], new: &[u8]) -> Vec<u8> {
        let old_blocks: Vec<&[u8]> = old[self.preamble_len..].chunks(self.block_size).collect();
        let new_blocks: Vec<&[u8]> = new[self.preamble_len..].chunks(self.block_size).collect();

        let mut out = PatchHeader::new(old_blocks.len() as u32, new_blocks.len() as u32)
            .encode()
            .to_vec();
        out.extend_from_slice(&new[..self.preamble_len]);

        for i in 0..old_blocks.len().max(new_blocks.len()) {
            let old_block = old_blocks.get(i).copied();
            let new_block = new_blocks.get(i).copied();
            let (token, ctrl, diff, extra) = match (old_block, new_block) {
                (Some(o), Some(n)) if o == n => (Token::Skip, vec![], vec![], vec![]),
                (Some(o), Some(n)) => {
                    let common = o.len().min(n.len());
                    let triple = ControlTriple {
                        copy_len: common as u64,
                        extra_len: (n.len() - common) as u64,
                        old_seek: 0,
                    };
                    let diff = n[..common]
                        .iter()
                        .zip(o)
                        .map(|(a, b)| a.wrapping_sub(*b))
                        .collect();
                    (Token::Modify, triple.encode().unwrap().to_vec(), diff, n[common..].to_vec())
                }
                (None, Some(n)) => (Token::Add, vec![], vec![], n.to_vec()),
                (Some(_), None) => (Token::Remove, vec![], vec![], vec![]),
                (None, None) => unreachable!(),
            };
            let new_block = new_block.unwrap_or(&[]);
            let ctrl = self.compress(&ctrl);
            let diff = self.compress(&diff);
            let extra = self.compress(&extra);
            let header = BlockDeltaHeader {
                token,
                block_number: i as u32,
                ctrl_size: ctrl.len() as u32,
                diff_size: diff.len() as u32,
                extra_size: extra.len() as u32,
                new_block_compressed_size: 0,
                new_block_size: new_block.len() as u64,
                new_block_crc: crc32fast::hash(new_block),
            };
            out.extend_from_slice(&header.encode());
            out.extend_from_slice(&ctrl);
            out.extend_from_slice(&diff);
            out.extend_from_slice(&extra);
        }
        out
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        match self.codec {
            Codec::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::best());
                enc.write_all(data).unwrap();
                enc.finish().unwrap()
            }
            Codec::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).unwrap();
                enc.finish().unwrap()
            }
            Codec::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::fast());
                enc.write_all(data).unwrap();
                enc.finish().unwrap()
            }
        }
    }
}

/// Deterministic pseudo-random bytes (xorshift), firmware-like enough for
/// exercising block boundaries.
pub fn image(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Copy of `old` with a handful of scattered edits and `grow` appended bytes
/// (or `-grow` bytes cut from the end).
pub fn edited(old: &[u8], grow: isize) -> Vec<u8> {
    let mut new = old.to_vec();
    let step = (new.len() / 7).max(1);
    for i in (3..new.len()).step_by(step) {
        new[i] = new[i].wrapping_add(0x5A);
    }
    if grow >= 0 {
        new.extend(image(grow as usize, 0xC0FFEE));
    } else {
        new.truncate(new.len().saturating_sub(grow.unsigned_abs()));
    }
    new
}
