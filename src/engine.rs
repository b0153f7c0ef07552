// Update engine: ties packet reassembly, section decompression and block
// patching together.
//
// An `UpdateSession` drives one update from the first packet to the last:
//   - accumulate the stream prefix (patch header, plus checksum and binary
//     header for preamble images) and copy the preamble to the destination
//   - feed every packet to the reassembler
//   - inflate, apply and write each completed block delta in stream order
//   - check that the stream ended on a record boundary with every block seen

use std::fmt;
use std::io;
use std::path::Path;

use log::{debug, info, warn};

use crate::compress::{self, DecompressError};
use crate::format::header::{
    FormatError, PATCH_HEADER_LEN, PREAMBLE_CHECKSUM_LEN, PatchHeader, Token,
};
use crate::io::{DestinationImage, PacketReader, PacketSource, SourceImage};
use crate::patch::applier::CONTROL_TRIPLE_LEN;
use crate::patch::{
    BlockDeltaRecord, BlockOutput, BlockPatcher, DecodedBlock, PatchError, Reassembler,
};

#[cfg(feature = "file-io")]
use sha2::Digest;

/// Default block size of both images.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default download packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Largest accepted block size (16 MiB).
pub const MAX_BLOCK_SIZE: usize = 1 << 24;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Layout of the images being updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageClass {
    /// Blocks start at offset 0 (kernel partition).
    #[default]
    Raw,
    /// A `u32` checksum and a `binary_header_len`-byte binary header precede
    /// the first block (application partition). Both travel in the patch
    /// stream and are copied to the destination verbatim.
    Preamble { binary_header_len: usize },
}

impl ImageClass {
    /// Bytes preceding block 0.
    pub fn preamble_len(&self) -> usize {
        match *self {
            Self::Raw => 0,
            Self::Preamble { binary_header_len } => PREAMBLE_CHECKSUM_LEN + binary_header_len,
        }
    }

    /// Offset of block 0 in both images.
    pub fn base_offset(&self) -> u64 {
        self.preamble_len() as u64
    }

    /// Guess the class from the device path of the old image.
    ///
    /// `/dev/mtdblock0*` holds the kernel (raw), `/dev/mtdblock2*` the
    /// application (preamble-bearing). Anything else is unknown.
    pub fn detect(path: &Path, binary_header_len: usize) -> Option<Self> {
        let path = path.to_str()?;
        if path.starts_with("/dev/mtdblock0") {
            Some(Self::Raw)
        } else if path.starts_with("/dev/mtdblock2") {
            Some(Self::Preamble { binary_header_len })
        } else {
            None
        }
    }
}

impl fmt::Display for ImageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Preamble { binary_header_len } => {
                write!(f, "preamble ({binary_header_len}-byte binary header)")
            }
        }
    }
}

/// What to do with a Remove record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovePolicy {
    /// Truncate the destination at the current write position.
    #[default]
    Truncate,
    /// Leave the destination untouched past the last written block.
    Ignore,
}

/// Configuration for one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Block size of both images.
    pub block_size: usize,
    /// Packet size used when the engine packetizes a reader itself.
    pub packet_size: usize,
    pub image_class: ImageClass,
    pub remove_policy: RemovePolicy,
    /// Upper bound on the compressed sections of one record. `None` derives
    /// a bound from the block size.
    pub max_record_size: Option<u64>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            packet_size: DEFAULT_PACKET_SIZE,
            image_class: ImageClass::Raw,
            remove_policy: RemovePolicy::Truncate,
            max_record_size: None,
        }
    }
}

impl UpdateConfig {
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(UpdateError::InvalidConfig(format!(
                "block size must be between 1 and {MAX_BLOCK_SIZE}, got {}",
                self.block_size
            )));
        }
        if self.packet_size == 0 {
            return Err(UpdateError::InvalidConfig("packet size must be non-zero".into()));
        }
        if self.max_record_size == Some(0) {
            return Err(UpdateError::InvalidConfig(
                "maximum record size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Effective record bound: room for a poorly compressed diff and extra
    /// section plus a control section of one triple per new byte.
    pub fn record_limit(&self) -> u64 {
        self.max_record_size.unwrap_or_else(|| {
            let bs = self.block_size as u64;
            4 * bs + CONTROL_TRIPLE_LEN as u64 * (bs + 1)
        })
    }

    fn ctrl_limit(&self) -> usize {
        CONTROL_TRIPLE_LEN * (self.block_size + 1)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Summary of a completed update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub packets: u64,
    pub patch_bytes: u64,
    /// Block delta records applied.
    pub blocks: u64,
    pub skipped: u64,
    pub modified: u64,
    pub added: u64,
    pub removed: u64,
    /// Bytes written to the destination, preamble included.
    pub bytes_written: u64,
    /// SHA-256 of the written bytes in write order (requires `file-io`).
    pub output_sha256: Option<[u8; 32]>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Compressed section of a block delta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Ctrl,
    Diff,
    Extra,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ctrl => "ctrl",
            Self::Diff => "diff",
            Self::Extra => "extra",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("patch signature mismatch: found {found:02X?}")]
    SignatureMismatch { found: [u8; 8] },
    #[error("block {block}: corrupt patch: {reason}")]
    CorruptPatch { block: u32, reason: String },
    #[error("block {block}: CRC32 mismatch: expected {expected:#010X}, got {actual:#010X}")]
    CrcMismatch {
        block: u32,
        expected: u32,
        actual: u32,
    },
    #[error("block {block}: cannot decompress {section} section: {source}")]
    Decompress {
        block: u32,
        section: Section,
        #[source]
        source: DecompressError,
    },
    #[error("block {block}: unknown token {token}")]
    UnknownToken { block: u32, token: u32 },
    #[error("block {block}: record of {size} bytes exceeds limit of {limit}")]
    RecordTooLarge { block: u32, size: u64, limit: u64 },
    #[error("patch stream truncated: {0}")]
    TruncatedStream(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FormatError> for UpdateError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Short { what, need, have } => {
                Self::TruncatedStream(format!("{what} needs {need} bytes, have {have}"))
            }
            FormatError::UnknownToken { block, token } => Self::UnknownToken { block, token },
            FormatError::RecordTooLarge { block, size, limit } => {
                Self::RecordTooLarge { block, size, limit }
            }
        }
    }
}

impl From<PatchError> for UpdateError {
    fn from(e: PatchError) -> Self {
        match e {
            PatchError::CorruptPatch { block, reason } => Self::CorruptPatch { block, reason },
            PatchError::CrcMismatch {
                block,
                expected,
                actual,
            } => Self::CrcMismatch {
                block,
                expected,
                actual,
            },
            PatchError::Io { block, source } => Self::Io(io::Error::new(
                source.kind(),
                format!("block {block}: reading old image: {source}"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateSession
// ---------------------------------------------------------------------------

/// Drives one update from packets to a reconstructed image.
///
/// The session owns every buffer the update needs (reassembly carry-over,
/// decompressed sections, block buffers), so memory stays bounded by the
/// packet size, one record and a few blocks regardless of image size.
pub struct UpdateSession {
    config: UpdateConfig,
    reassembler: Reassembler,
    patcher: BlockPatcher,
    prefix: Vec<u8>,
    header: Option<PatchHeader>,
    prefix_done: bool,
    ctrl: Vec<u8>,
    diff: Vec<u8>,
    extra: Vec<u8>,
    write_pos: u64,
    stats: UpdateStats,
    #[cfg(feature = "file-io")]
    hasher: sha2::Sha256,
}

impl UpdateSession {
    pub fn new(config: UpdateConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        Ok(Self {
            reassembler: Reassembler::new(config.record_limit()),
            patcher: BlockPatcher::new(config.block_size, config.image_class.base_offset(), 0),
            prefix: Vec::new(),
            header: None,
            prefix_done: false,
            ctrl: Vec::new(),
            diff: Vec::new(),
            extra: Vec::new(),
            write_pos: 0,
            stats: UpdateStats::default(),
            #[cfg(feature = "file-io")]
            hasher: sha2::Sha256::new(),
            config,
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Patch header, once the stream prefix has been read.
    pub fn patch_header(&self) -> Option<&PatchHeader> {
        self.header.as_ref()
    }

    /// Run the update to completion.
    ///
    /// Pulls packets until the final (short) one, writing each block as soon
    /// as its record is complete. Any error aborts the update and leaves the
    /// destination partially written.
    pub fn run<P, S, D>(
        &mut self,
        packets: &mut P,
        old: &mut S,
        new: &mut D,
    ) -> Result<UpdateStats, UpdateError>
    where
        P: PacketSource + ?Sized,
        S: SourceImage + ?Sized,
        D: DestinationImage + ?Sized,
    {
        self.reset(old.len());
        info!(
            "update start: {} image, block size {}, packet size {}, old image {} bytes",
            self.config.image_class,
            self.config.block_size,
            packets.packet_size(),
            old.len()
        );

        loop {
            let packet = packets.next_packet()?;
            let is_final = packet.is_final;
            let mut data = packet.data;
            self.stats.packets += 1;
            self.stats.patch_bytes += data.len() as u64;
            debug!(
                "packet {}: {} bytes{}",
                self.stats.packets,
                data.len(),
                if is_final { " (final)" } else { "" }
            );

            if !self.prefix_done {
                match self.consume_prefix(data, new)? {
                    Some(rest) => data = rest,
                    None => data = &[],
                }
            }
            if !data.is_empty() {
                for record in self.reassembler.feed(data)? {
                    self.process(record, old, new)?;
                }
            }

            if is_final {
                break;
            }
        }

        self.finish(new)
    }

    fn reset(&mut self, old_len: u64) {
        let base = self.config.image_class.base_offset();
        self.reassembler = Reassembler::new(self.config.record_limit());
        let old_payload_len = old_len.saturating_sub(base);
        self.patcher = BlockPatcher::new(self.config.block_size, base, old_payload_len);
        self.prefix.clear();
        self.header = None;
        self.prefix_done = false;
        self.write_pos = 0;
        self.stats = UpdateStats::default();
        #[cfg(feature = "file-io")]
        {
            self.hasher = sha2::Sha256::new();
        }
    }

    /// Accumulate the stream prefix from `data`.
    ///
    /// Returns the bytes following the prefix once it is complete, `None`
    /// while more packets are needed. The signature is checked as soon as the
    /// patch header is available, even if the preamble is still incomplete.
    fn consume_prefix<'p, D>(
        &mut self,
        data: &'p [u8],
        new: &mut D,
    ) -> Result<Option<&'p [u8]>, UpdateError>
    where
        D: DestinationImage + ?Sized,
    {
        let need = PATCH_HEADER_LEN + self.config.image_class.preamble_len();
        let take = (need - self.prefix.len()).min(data.len());
        self.prefix.extend_from_slice(&data[..take]);

        if self.header.is_none() && self.prefix.len() >= PATCH_HEADER_LEN {
            let header = PatchHeader::parse(&self.prefix)?;
            if !header.has_valid_signature() {
                return Err(UpdateError::SignatureMismatch {
                    found: header.signature,
                });
            }
            info!(
                "patch header: {} old blocks, {} new blocks ({} common)",
                header.old_block_count,
                header.new_block_count,
                header.common_blocks()
            );
            self.header = Some(header);
        }
        if self.prefix.len() < need {
            return Ok(None);
        }

        let prefix = std::mem::take(&mut self.prefix);
        let preamble = &prefix[PATCH_HEADER_LEN..];
        if !preamble.is_empty() {
            new.write_at(0, preamble)?;
            self.record_write(preamble);
            self.write_pos = preamble.len() as u64;
            debug!("preamble: {} bytes copied", preamble.len());
        }
        self.prefix_done = true;
        Ok(Some(&data[take..]))
    }

    /// Inflate, apply and write one record.
    fn process<S, D>(
        &mut self,
        record: BlockDeltaRecord,
        old: &mut S,
        new: &mut D,
    ) -> Result<(), UpdateError>
    where
        S: SourceImage + ?Sized,
        D: DestinationImage + ?Sized,
    {
        let header = record.header;
        let block = header.block_number;
        if u64::from(block) != self.stats.blocks {
            return Err(UpdateError::CorruptPatch {
                block,
                reason: format!("expected block {}", self.stats.blocks),
            });
        }

        // Remove records exactly cover the blocks past the end of the new image.
        let new_blocks = self.header.map_or(0, |h| h.new_block_count);
        if (header.token == Token::Remove) == (block < new_blocks) {
            return Err(UpdateError::CorruptPatch {
                block,
                reason: format!(
                    "{} record with {new_blocks} blocks in the new image",
                    header.token
                ),
            });
        }

        let block_size = self.config.block_size;
        let ctrl_limit = self.config.ctrl_limit();
        inflate_section(block, Section::Ctrl, record.ctrl(), ctrl_limit, &mut self.ctrl)?;
        inflate_section(block, Section::Diff, record.diff(), block_size, &mut self.diff)?;
        inflate_section(block, Section::Extra, record.extra(), block_size, &mut self.extra)?;
        debug!(
            "block {block}: {} ({} byte record, ctrl {} diff {} extra {} inflated)",
            header.token,
            record.wire_len(),
            self.ctrl.len(),
            self.diff.len(),
            self.extra.len()
        );

        let decoded = DecodedBlock {
            header: &header,
            ctrl: &self.ctrl,
            diff: &self.diff,
            extra: &self.extra,
        };
        match self.patcher.apply(&decoded, old)? {
            BlockOutput::Data(bytes) => {
                let base = self.config.image_class.base_offset();
                let offset = base + u64::from(block) * block_size as u64;
                new.write_at(offset, bytes)?;
                #[cfg(feature = "file-io")]
                self.hasher.update(bytes);
                self.stats.bytes_written += bytes.len() as u64;
                self.write_pos = offset + bytes.len() as u64;
            }
            BlockOutput::Truncate => match self.config.remove_policy {
                RemovePolicy::Truncate => {
                    new.truncate(self.write_pos)?;
                    debug!("block {block}: destination truncated at {}", self.write_pos);
                }
                RemovePolicy::Ignore => {
                    warn!(
                        "block {block}: remove ignored, destination keeps bytes past {}",
                        self.write_pos
                    );
                }
            },
        }

        match header.token {
            Token::Skip => self.stats.skipped += 1,
            Token::Modify => self.stats.modified += 1,
            Token::Add => self.stats.added += 1,
            Token::Remove => self.stats.removed += 1,
        }
        self.stats.blocks += 1;
        Ok(())
    }

    fn finish<D>(&mut self, new: &mut D) -> Result<UpdateStats, UpdateError>
    where
        D: DestinationImage + ?Sized,
    {
        let Some(header) = self.header else {
            return Err(UpdateError::TruncatedStream(format!(
                "patch header incomplete ({} of {PATCH_HEADER_LEN} bytes)",
                self.prefix.len()
            )));
        };
        if !self.prefix_done {
            return Err(UpdateError::TruncatedStream("preamble incomplete".into()));
        }
        if !self.reassembler.is_idle() {
            return Err(UpdateError::TruncatedStream(format!(
                "stream ends inside block {} ({} bytes pending)",
                self.stats.blocks,
                self.reassembler.pending_bytes()
            )));
        }
        // Every block of the new image must have been written; trailing
        // Remove records are optional.
        let total = u64::from(header.new_block_count);
        if self.stats.blocks < total {
            return Err(UpdateError::TruncatedStream(format!(
                "{} of {total} blocks present",
                self.stats.blocks
            )));
        }

        // The last block may end short of the old image, with or without
        // Remove records following it.
        if self.config.remove_policy == RemovePolicy::Truncate {
            new.truncate(self.write_pos)?;
            debug!("destination truncated at {}", self.write_pos);
        }
        new.flush()?;

        #[cfg(feature = "file-io")]
        {
            let hasher = std::mem::replace(&mut self.hasher, sha2::Sha256::new());
            self.stats.output_sha256 = Some(hasher.finalize().into());
        }

        let s = &self.stats;
        info!(
            "update complete: {} blocks ({} skipped, {} modified, {} added, {} removed), \
             {} bytes written",
            s.blocks,
            s.skipped,
            s.modified,
            s.added,
            s.removed,
            s.bytes_written
        );
        Ok(self.stats.clone())
    }

    fn record_write(&mut self, bytes: &[u8]) {
        #[cfg(feature = "file-io")]
        self.hasher.update(bytes);
        self.stats.bytes_written += bytes.len() as u64;
    }
}

fn inflate_section(
    block: u32,
    section: Section,
    compressed: &[u8],
    limit: usize,
    out: &mut Vec<u8>,
) -> Result<(), UpdateError> {
    compress::inflate_into(compressed, limit, out)
        .map(|_| ())
        .map_err(|source| UpdateError::Decompress {
            block,
            section,
            source,
        })
}

// ---------------------------------------------------------------------------
// High-level update
// ---------------------------------------------------------------------------

/// Apply an in-memory patch to an in-memory image.
///
/// The destination starts as a copy of `old`, as if the image were updated
/// in place, and the patch is fed in `config.packet_size` packets.
pub fn apply_update(
    old: &[u8],
    patch: &[u8],
    config: UpdateConfig,
) -> Result<(Vec<u8>, UpdateStats), UpdateError> {
    let mut session = UpdateSession::new(config)?;
    let mut packets = PacketReader::new(patch, session.config().packet_size);
    let mut source = old;
    let mut new = old.to_vec();
    let stats = session.run(&mut packets, &mut source, &mut new)?;
    Ok((new, stats))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::format::header::{BLOCK_HEADER_LEN, BlockDeltaHeader};
    use crate::patch::ControlTriple;

    const BS: usize = 16;

    fn gz(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Minimal patch writer: Skip where blocks match, a single-triple Modify
    /// where they differ, Add for new blocks, Remove for dropped ones.
    fn make_patch(old: &[u8], new: &[u8], preamble_len: usize) -> Vec<u8> {
        let old_blocks: Vec<&[u8]> = old[preamble_len..].chunks(BS).collect();
        let new_blocks: Vec<&[u8]> = new[preamble_len..].chunks(BS).collect();
        let mut out = PatchHeader::new(old_blocks.len() as u32, new_blocks.len() as u32)
            .encode()
            .to_vec();
        out.extend_from_slice(&new[..preamble_len]);

        for i in 0..old_blocks.len().max(new_blocks.len()) {
            let (token, ctrl, diff, extra, new_block): (Token, Vec<u8>, Vec<u8>, Vec<u8>, &[u8]) =
                match (old_blocks.get(i).copied(), new_blocks.get(i).copied()) {
                    (Some(o), Some(n)) if o == n => (Token::Skip, vec![], vec![], vec![], n),
                    (Some(o), Some(n)) => {
                        let triple = ControlTriple {
                            copy_len: n.len() as u64,
                            extra_len: 0,
                            old_seek: 0,
                        };
                        let diff = n
                            .iter()
                            .enumerate()
                            .map(|(j, b)| b.wrapping_sub(o.get(j).copied().unwrap_or(0)))
                            .collect();
                        (Token::Modify, triple.encode().unwrap().to_vec(), diff, vec![], n)
                    }
                    (None, Some(n)) => (Token::Add, vec![], vec![], n.to_vec(), n),
                    (Some(_), None) => (Token::Remove, vec![], vec![], vec![], &[]),
                    (None, None) => unreachable!(),
                };
            let (ctrl, diff, extra) = (gz(&ctrl), gz(&diff), gz(&extra));
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

    fn config(packet_size: usize) -> UpdateConfig {
        UpdateConfig {
            block_size: BS,
            packet_size,
            ..Default::default()
        }
    }

    fn sample_images() -> (Vec<u8>, Vec<u8>) {
        let old: Vec<u8> = (0..70u8).collect();
        let mut new = old.clone();
        new[20] ^= 0xFF; // block 1 modified
        new[50] = 0; // block 3 modified
        new.extend_from_slice(b"appended tail bytes"); // block 4 modified, 5 added
        (old, new)
    }

    #[test]
    fn raw_update_at_every_packet_size() {
        let (old, new) = sample_images();
        let patch = make_patch(&old, &new, 0);
        for packet_size in 1..=patch.len() + 1 {
            let (out, stats) = apply_update(&old, &patch, config(packet_size)).unwrap();
            assert_eq!(out, new, "packet size {packet_size}");
            assert_eq!(stats.patch_bytes, patch.len() as u64);
            assert_eq!(stats.blocks, 6);
        }
    }

    #[test]
    fn stats_count_each_token() {
        let (old, new) = sample_images();
        let patch = make_patch(&old, &new, 0);
        let (_, stats) = apply_update(&old, &patch, config(64)).unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.modified, 3);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.bytes_written, new.len() as u64);
        #[cfg(feature = "file-io")]
        {
            let expected: [u8; 32] = sha2::Sha256::digest(&new).into();
            assert_eq!(stats.output_sha256, Some(expected));
        }
    }

    #[test]
    fn preamble_copied_and_blocks_offset() {
        let mut old = vec![0xAA; 4 + 6];
        old.extend((0..40u8).map(|b| b.wrapping_mul(3)));
        let mut new = vec![0x11, 0x22, 0x33, 0x44, b'h', b'e', b'a', b'd', b'e', b'r'];
        new.extend_from_slice(&old[10..]);
        new[30] = 0x99;
        let patch = make_patch(&old, &new, 10);

        let cfg = UpdateConfig {
            image_class: ImageClass::Preamble { binary_header_len: 6 },
            ..config(3)
        };
        let (out, stats) = apply_update(&old, &patch, cfg).unwrap();
        assert_eq!(out, new);
        assert_eq!(stats.modified, 1);
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn remove_truncates_by_default() {
        let old: Vec<u8> = (0..64u8).collect();
        let new = old[..20].to_vec();
        let patch = make_patch(&old, &new, 0);

        let (out, stats) = apply_update(&old, &patch, config(7)).unwrap();
        assert_eq!(out, new);
        assert_eq!(stats.removed, 2);
    }

    #[test]
    fn remove_can_be_ignored() {
        let old: Vec<u8> = (0..64u8).collect();
        let mut new = old[..20].to_vec();
        new[18] = 0xEE;
        let patch = make_patch(&old, &new, 0);

        let cfg = UpdateConfig {
            remove_policy: RemovePolicy::Ignore,
            ..config(4096)
        };
        let (out, _) = apply_update(&old, &patch, cfg).unwrap();
        assert_eq!(&out[..20], &new[..]);
        assert_eq!(&out[20..], &old[20..]);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let (old, new) = sample_images();
        let mut patch = make_patch(&old, &new, 0);
        patch[0] = b'X';
        let err = apply_update(&old, &patch, config(5)).unwrap_err();
        assert!(matches!(err, UpdateError::SignatureMismatch { found } if found[0] == b'X'));
    }

    #[test]
    fn stream_cut_inside_record_is_truncated() {
        let (old, new) = sample_images();
        let patch = make_patch(&old, &new, 0);
        let cut = &patch[..patch.len() - 3];
        let err = apply_update(&old, cut, config(16)).unwrap_err();
        assert!(matches!(err, UpdateError::TruncatedStream(_)), "{err}");
    }

    #[test]
    fn stream_cut_inside_header_is_truncated() {
        let err = apply_update(&[], &PatchHeader::new(1, 1).encode()[..9], config(16)).unwrap_err();
        assert!(matches!(err, UpdateError::TruncatedStream(_)), "{err}");
    }

    #[test]
    fn missing_blocks_are_reported() {
        let old = vec![1u8; 32];
        let patch = PatchHeader::new(2, 2).encode();
        let err = apply_update(&old, &patch, config(64)).unwrap_err();
        assert!(
            matches!(err, UpdateError::TruncatedStream(ref m) if m.contains("0 of 2")),
            "{err}"
        );
    }

    #[test]
    fn missing_added_blocks_are_reported() {
        let (old, new) = sample_images();
        let patch = make_patch(&old, &new, 0);
        // Drop the final Add record, cutting on a record boundary.
        let add_len = BLOCK_HEADER_LEN + gz(&new[80..]).len();
        let cut = &patch[..patch.len() - add_len];
        let err = apply_update(&old, cut, config(64)).unwrap_err();
        assert!(
            matches!(err, UpdateError::TruncatedStream(ref m) if m.contains("5 of 6")),
            "{err}"
        );
    }

    #[test]
    fn trailing_removes_are_optional() {
        let old: Vec<u8> = (0..64u8).collect();
        let new = old[..32].to_vec();
        let patch = make_patch(&old, &new, 0);
        let cut = &patch[..patch.len() - 2 * BLOCK_HEADER_LEN];
        let (out, stats) = apply_update(&old, cut, config(64)).unwrap();
        assert_eq!(stats.removed, 0);
        assert_eq!(out, new);
    }

    #[test]
    fn shrink_inside_last_block_truncates() {
        // Same block count, last block two bytes shorter: no Remove record.
        let old: Vec<u8> = (0..40u8).collect();
        let mut new = old[..38].to_vec();
        new[33] = 0xEE;
        let patch = make_patch(&old, &new, 0);
        assert_eq!(&patch[8..16], &PatchHeader::new(3, 3).encode()[8..16]);

        let (out, stats) = apply_update(&old, &patch, config(9)).unwrap();
        assert_eq!(out, new);
        assert_eq!(stats.removed, 0);

        let cfg = UpdateConfig {
            remove_policy: RemovePolicy::Ignore,
            ..config(9)
        };
        let (out, _) = apply_update(&old, &patch, cfg).unwrap();
        assert_eq!(&out[..38], &new[..]);
        assert_eq!(&out[38..], &old[38..]);
    }

    #[test]
    fn unknown_token_surfaces_with_block_number() {
        let (old, new) = sample_images();
        let mut patch = make_patch(&old, &new, 0);
        // Token is the first field of block 0's header.
        patch[PATCH_HEADER_LEN..PATCH_HEADER_LEN + 4].copy_from_slice(&7u32.to_le_bytes());
        for packet_size in [1, 17, 4096] {
            let err = apply_update(&old, &patch, config(packet_size)).unwrap_err();
            assert!(
                matches!(err, UpdateError::UnknownToken { block: 0, token: 7 }),
                "{err}"
            );
        }
    }

    #[test]
    fn out_of_order_block_is_corrupt() {
        let old = vec![5u8; 32];
        let mut patch = PatchHeader::new(2, 2).encode().to_vec();
        let header = BlockDeltaHeader {
            token: Token::Skip,
            block_number: 1,
            ctrl_size: 0,
            diff_size: 0,
            extra_size: 0,
            new_block_compressed_size: 0,
            new_block_size: BS as u64,
            new_block_crc: crc32fast::hash(&old[16..]),
        };
        patch.extend_from_slice(&header.encode());
        let err = apply_update(&old, &patch, config(64)).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptPatch { block: 1, .. }), "{err}");
    }

    #[test]
    fn token_must_agree_with_block_counts() {
        let old = vec![3u8; 32];
        let skip = |block_number: u32| BlockDeltaHeader {
            token: Token::Skip,
            block_number,
            ctrl_size: 0,
            diff_size: 0,
            extra_size: 0,
            new_block_compressed_size: 0,
            new_block_size: BS as u64,
            new_block_crc: crc32fast::hash(&old[..16]),
        };

        // Remove inside the new image.
        let mut patch = PatchHeader::new(2, 2).encode().to_vec();
        patch.extend_from_slice(&skip(0).encode());
        patch.extend_from_slice(&BlockDeltaHeader { token: Token::Remove, ..skip(1) }.encode());
        let err = apply_update(&old, &patch, config(64)).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptPatch { block: 1, .. }), "{err}");

        // Data record past the end of the new image.
        let mut patch = PatchHeader::new(2, 1).encode().to_vec();
        patch.extend_from_slice(&skip(0).encode());
        patch.extend_from_slice(&skip(1).encode());
        let err = apply_update(&old, &patch, config(64)).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptPatch { block: 1, .. }), "{err}");
    }

    #[test]
    fn crc_failure_surfaces() {
        let (old, new) = sample_images();
        let mut patch = make_patch(&old, &new, 0);
        // Block 0 is a Skip; its CRC sits in the last 4 header bytes.
        let crc_at = PATCH_HEADER_LEN + 36;
        patch[crc_at] ^= 1;
        let err = apply_update(&old, &patch, config(4096)).unwrap_err();
        assert!(matches!(err, UpdateError::CrcMismatch { block: 0, .. }), "{err}");
    }

    #[test]
    fn undecodable_section_names_block_and_section() {
        let old = vec![0u8; 16];
        let mut patch = PatchHeader::new(1, 1).encode().to_vec();
        let junk = [0x1F, 0x8B, 0xFF, 0xFF, 0xFF];
        let header = BlockDeltaHeader {
            token: Token::Modify,
            block_number: 0,
            ctrl_size: junk.len() as u32,
            diff_size: 0,
            extra_size: 0,
            new_block_compressed_size: 0,
            new_block_size: 16,
            new_block_crc: 0,
        };
        patch.extend_from_slice(&header.encode());
        patch.extend_from_slice(&junk);
        let err = apply_update(&old, &patch, config(4096)).unwrap_err();
        assert!(
            matches!(err, UpdateError::Decompress { block: 0, section: Section::Ctrl, .. }),
            "{err}"
        );
    }

    #[test]
    fn session_can_be_reused() {
        let (old, new) = sample_images();
        let patch = make_patch(&old, &new, 0);
        let mut session = UpdateSession::new(config(10)).unwrap();
        for _ in 0..2 {
            let mut packets = PacketReader::new(&patch[..], 10);
            let mut src: &[u8] = &old;
            let mut out = old.clone();
            let stats = session.run(&mut packets, &mut src, &mut out).unwrap();
            assert_eq!(out, new);
            assert_eq!(stats.blocks, 6);
        }
        assert_eq!(session.patch_header().map(|h| h.new_block_count), Some(6));
    }

    #[test]
    fn invalid_config_is_rejected() {
        for cfg in [
            UpdateConfig { block_size: 0, ..Default::default() },
            UpdateConfig { packet_size: 0, ..Default::default() },
            UpdateConfig { max_record_size: Some(0), ..Default::default() },
        ] {
            assert!(matches!(UpdateSession::new(cfg), Err(UpdateError::InvalidConfig(_))));
        }
    }

    #[test]
    fn default_record_limit() {
        let cfg = UpdateConfig::default();
        assert_eq!(cfg.record_limit(), 4 * 4096 + 24 * 4097);
        let cfg = UpdateConfig { max_record_size: Some(99), ..cfg };
        assert_eq!(cfg.record_limit(), 99);
    }

    #[test]
    fn image_class_detection() {
        assert_eq!(ImageClass::detect(Path::new("/dev/mtdblock0"), 8), Some(ImageClass::Raw));
        assert_eq!(
            ImageClass::detect(Path::new("/dev/mtdblock2p1"), 8),
            Some(ImageClass::Preamble { binary_header_len: 8 })
        );
        assert_eq!(ImageClass::detect(Path::new("/tmp/app.bin"), 8), None);
        assert_eq!(ImageClass::Preamble { binary_header_len: 8 }.base_offset(), 12);
        assert_eq!(ImageClass::Raw.base_offset(), 0);
    }
}
