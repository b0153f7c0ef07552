// Collaborator interfaces and their std-backed implementations.
//
// The engine talks to three collaborators: a packet source delivering the
// patch stream in fixed-size packets, the old image (random-access reads)
// and the destination image (offset writes plus truncation). Memory-backed
// implementations serve tests and embedding; file-backed ones serve the CLI
// and `update_file()`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::engine::{UpdateConfig, UpdateError, UpdateSession, UpdateStats};

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// Packet source
// ---------------------------------------------------------------------------

/// One download packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub data: &'a [u8],
    /// True exactly when `data` is shorter than the packet size. This is the
    /// only end-of-stream signal.
    pub is_final: bool,
}

/// Delivers the patch stream one packet at a time.
pub trait PacketSource {
    /// Maximum packet length.
    fn packet_size(&self) -> usize;

    /// Block until the next packet is available.
    fn next_packet(&mut self) -> io::Result<Packet<'_>>;
}

/// Packetizes any `Read` into fixed-size packets.
#[derive(Debug)]
pub struct PacketReader<R> {
    reader: R,
    buf: Vec<u8>,
    finished: bool,
}

impl<R: Read> PacketReader<R> {
    /// `packet_size` must be non-zero.
    pub fn new(reader: R, packet_size: usize) -> Self {
        Self {
            reader,
            buf: vec![0u8; packet_size.max(1)],
            finished: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> PacketSource for PacketReader<R> {
    fn packet_size(&self) -> usize {
        self.buf.len()
    }

    fn next_packet(&mut self) -> io::Result<Packet<'_>> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "packet requested after the final packet",
            ));
        }

        let mut filled = 0;
        while filled < self.buf.len() {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let is_final = filled < self.buf.len();
        self.finished = is_final;
        Ok(Packet {
            data: &self.buf[..filled],
            is_final,
        })
    }
}

// ---------------------------------------------------------------------------
// Image traits
// ---------------------------------------------------------------------------

/// Read access to the old image.
pub trait SourceImage {
    /// Fill `buf` with the bytes at `offset`. Short images are an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total image length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write access to the image being reconstructed.
pub trait DestinationImage {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Set the image length to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Persist everything written so far.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory old image.
impl SourceImage for &[u8] {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset))?;
        let end = start.checked_add(buf.len()).ok_or_else(|| out_of_range(offset))?;
        let src = self.get(start..end).ok_or_else(|| out_of_range(offset))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }
}

/// In-memory destination; grows with zeros when written past its end.
impl DestinationImage for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset))?;
        let end = start + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| out_of_range(len))?;
        self.resize(len, 0);
        Ok(())
    }
}

fn out_of_range(offset: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("offset {offset} is outside the image"),
    )
}

// ---------------------------------------------------------------------------
// File-backed images
// ---------------------------------------------------------------------------

/// Old image stored in a file or block device, opened read-only.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        // Block devices report a zero metadata length; seeking works for both.
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self { file, len })
    }
}

impl SourceImage for FileSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Destination image written through a buffered writer.
///
/// Writes arrive in increasing offset order, so consecutive writes are
/// appended without seeking.
#[derive(Debug)]
pub struct FileDestination {
    writer: BufWriter<File>,
    pos: u64,
}

impl FileDestination {
    /// Create (or truncate) a fresh destination image.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::from_file(File::create(path)?))
    }

    /// Open an existing image for in-place update, keeping its contents.
    pub fn open_in_place(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUF_SIZE, file),
            pos: 0,
        }
    }
}

impl DestinationImage for FileDestination {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if offset != self.pos {
            self.writer.seek(SeekFrom::Start(offset))?;
        }
        self.writer.write_all(data)?;
        self.pos = offset + data.len() as u64;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(len)?;
        self.writer.seek(SeekFrom::Start(len))?;
        self.pos = len;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

// ---------------------------------------------------------------------------
// update_file
// ---------------------------------------------------------------------------

/// Apply the patch file at `patch_path` to the image at `old_path`.
///
/// With `new_path` the result is written to a fresh file; without it the
/// old image is updated in place. The patch is read in `config.packet_size`
/// packets, so neither it nor the images are loaded into memory.
pub fn update_file(
    old_path: &Path,
    patch_path: &Path,
    new_path: Option<&Path>,
    config: UpdateConfig,
) -> Result<UpdateStats, UpdateError> {
    let mut session = UpdateSession::new(config)?;

    let mut old = FileSource::open(old_path)?;
    let mut new = match new_path {
        Some(path) => FileDestination::create(path)?,
        None => FileDestination::open_in_place(old_path)?,
    };
    let mut packets = PacketReader::new(File::open(patch_path)?, session.config().packet_size);

    session.run(&mut packets, &mut old, &mut new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
