// Reassembly of block delta records from fixed-size download packets.
//
// Packets cut the record stream at arbitrary byte positions: one packet may
// carry many records, and one record may span many packets. The reassembler
// consumes every packet fully and carries the partial header or partial
// delta bytes over to the next call. It never looks past the current record,
// so the stream end is decided by the caller.

use crate::format::header::{BLOCK_HEADER_LEN, BlockDeltaHeader, FormatError};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One complete block delta: header plus the three compressed sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeltaRecord {
    pub header: BlockDeltaHeader,
    /// ctrl, diff and extra sections back to back, as on the wire.
    data: Vec<u8>,
}

impl BlockDeltaRecord {
    /// Build a record from a header and its concatenated sections.
    ///
    /// Returns `None` if `data` does not match the sizes in `header`.
    pub fn new(header: BlockDeltaHeader, data: Vec<u8>) -> Option<Self> {
        (data.len() as u64 == header.delta_len()).then_some(Self { header, data })
    }

    /// Compressed control section.
    pub fn ctrl(&self) -> &[u8] {
        &self.data[..self.ctrl_end()]
    }

    /// Compressed diff section.
    pub fn diff(&self) -> &[u8] {
        &self.data[self.ctrl_end()..self.diff_end()]
    }

    /// Compressed extra section.
    pub fn extra(&self) -> &[u8] {
        &self.data[self.diff_end()..]
    }

    /// Bytes this record occupied in the patch stream.
    pub fn wire_len(&self) -> usize {
        BLOCK_HEADER_LEN + self.data.len()
    }

    fn ctrl_end(&self) -> usize {
        self.header.ctrl_size as usize
    }

    fn diff_end(&self) -> usize {
        self.ctrl_end() + self.header.diff_size as usize
    }
}

// ---------------------------------------------------------------------------
// Reassembler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHeader,
    AwaitingDelta {
        header: BlockDeltaHeader,
        delta_len: usize,
    },
}

/// Turns a packet sequence into [`BlockDeltaRecord`]s.
#[derive(Debug)]
pub struct Reassembler {
    phase: Phase,
    header_buf: [u8; BLOCK_HEADER_LEN],
    header_filled: usize,
    delta: Vec<u8>,
    max_record_size: u64,
    records: u64,
}

impl Reassembler {
    /// Create a reassembler rejecting records whose three sections together
    /// exceed `max_record_size` bytes.
    pub fn new(max_record_size: u64) -> Self {
        Self {
            phase: Phase::AwaitingHeader,
            header_buf: [0u8; BLOCK_HEADER_LEN],
            header_filled: 0,
            delta: Vec::new(),
            max_record_size,
            records: 0,
        }
    }

    /// Consume `packet` fully, returning every record it completes.
    pub fn feed(&mut self, mut packet: &[u8]) -> Result<Vec<BlockDeltaRecord>, FormatError> {
        let mut completed = Vec::new();

        while !packet.is_empty() {
            match self.phase {
                Phase::AwaitingHeader => {
                    let take = (BLOCK_HEADER_LEN - self.header_filled).min(packet.len());
                    self.header_buf[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&packet[..take]);
                    self.header_filled += take;
                    packet = &packet[take..];

                    if self.header_filled == BLOCK_HEADER_LEN {
                        self.begin_delta()?;
                    }
                }
                Phase::AwaitingDelta { delta_len, .. } => {
                    let take = (delta_len - self.delta.len()).min(packet.len());
                    self.delta.extend_from_slice(&packet[..take]);
                    packet = &packet[take..];
                }
            }

            // Checked after every step so that empty deltas complete as soon
            // as their header does, even at the very end of a packet.
            if let Phase::AwaitingDelta { header, delta_len } = self.phase
                && self.delta.len() == delta_len
            {
                completed.push(self.finish_record(header));
            }
        }

        Ok(completed)
    }

    /// True when no partial record is carried over.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::AwaitingHeader && self.header_filled == 0
    }

    /// Number of carried-over bytes belonging to the unfinished record.
    pub fn pending_bytes(&self) -> usize {
        match self.phase {
            Phase::AwaitingHeader => self.header_filled,
            Phase::AwaitingDelta { .. } => BLOCK_HEADER_LEN + self.delta.len(),
        }
    }

    /// Number of records emitted so far.
    pub fn records_emitted(&self) -> u64 {
        self.records
    }

    fn begin_delta(&mut self) -> Result<(), FormatError> {
        let header = BlockDeltaHeader::parse(&self.header_buf)?;
        let size = header.delta_len();
        if size > self.max_record_size {
            return Err(FormatError::RecordTooLarge {
                block: header.block_number,
                size,
                limit: self.max_record_size,
            });
        }
        let delta_len = size as usize;
        self.header_filled = 0;
        self.delta = Vec::with_capacity(delta_len);
        self.phase = Phase::AwaitingDelta { header, delta_len };
        log::trace!(
            "block {}: header complete ({}, {delta_len} delta bytes)",
            header.block_number,
            header.token
        );
        Ok(())
    }

    fn finish_record(&mut self, header: BlockDeltaHeader) -> BlockDeltaRecord {
        self.phase = Phase::AwaitingHeader;
        self.records += 1;
        BlockDeltaRecord {
            header,
            data: std::mem::take(&mut self.delta),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
