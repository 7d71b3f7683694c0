//! SQLite WAL file format
//!
//! The manager never interprets page contents: it reads the WAL header and
//! frame headers, validates salts and the cumulative checksum, and cuts the
//! byte stream at commit frames.
//!
//! Layout (all header integers big-endian):
//! - header:  magic, version, page_size, checkpoint_seq, salt1, salt2, cksum1, cksum2
//! - frame:   page_number, commit_size, salt1, salt2, cksum1, cksum2, page bytes
//!
//! A frame with a nonzero `commit_size` ends a transaction; `commit_size` is
//! the database size in pages after that commit.

use thiserror::Error;

/// Size of the WAL file header
pub const WAL_HEADER_SIZE: usize = 32;

/// Size of each frame header
pub const FRAME_HEADER_SIZE: usize = 24;

const MAGIC_LE: u32 = 0x377f_0682;
const MAGIC_BE: u32 = 0x377f_0683;
const FORMAT_VERSION: u32 = 3_007_000;

/// WAL format errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalFormatError {
    #[error("WAL header truncated: {0} bytes")]
    Truncated(usize),

    #[error("invalid WAL magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported WAL format version: {0}")]
    BadVersion(u32),

    #[error("invalid WAL page size: {0}")]
    BadPageSize(u32),

    #[error("WAL header checksum mismatch")]
    HeaderChecksum,
}

/// Checksum pair carried through the WAL
pub type Checksum = (u32, u32);

/// Parsed WAL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt: (u32, u32),
    pub checksum: Checksum,
    pub big_endian: bool,
}

impl WalHeader {
    /// Parse and verify a WAL header.
    pub fn parse(bytes: &[u8]) -> Result<Self, WalFormatError> {
        if bytes.len() < WAL_HEADER_SIZE {
            return Err(WalFormatError::Truncated(bytes.len()));
        }

        let magic = be_u32(bytes, 0);
        let big_endian = match magic {
            MAGIC_LE => false,
            MAGIC_BE => true,
            other => return Err(WalFormatError::BadMagic(other)),
        };

        let version = be_u32(bytes, 4);
        if version != FORMAT_VERSION {
            return Err(WalFormatError::BadVersion(version));
        }

        let page_size = be_u32(bytes, 8);
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(WalFormatError::BadPageSize(page_size));
        }

        let checksum = (be_u32(bytes, 24), be_u32(bytes, 28));
        if checksum != wal_checksum(big_endian, &bytes[..24], (0, 0)) {
            return Err(WalFormatError::HeaderChecksum);
        }

        Ok(Self {
            page_size,
            checkpoint_seq: be_u32(bytes, 12),
            salt: (be_u32(bytes, 16), be_u32(bytes, 20)),
            checksum,
            big_endian,
        })
    }

    /// Size of one frame (header + page)
    pub fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.page_size as usize
    }
}

/// SQLite's WAL checksum, continued from `seed`.
///
/// `data.len()` must be a multiple of 8.
pub fn wal_checksum(big_endian: bool, data: &[u8], seed: Checksum) -> Checksum {
    debug_assert!(data.len() % 8 == 0);

    let (mut s1, mut s2) = seed;
    for chunk in data.chunks_exact(8) {
        let (x0, x1) = if big_endian {
            (be_u32(chunk, 0), be_u32(chunk, 4))
        } else {
            (le_u32(chunk, 0), le_u32(chunk, 4))
        };
        s1 = s1.wrapping_add(x0).wrapping_add(s2);
        s2 = s2.wrapping_add(x1).wrapping_add(s1);
    }
    (s1, s2)
}

/// One WAL frame borrowed from a buffer
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub page_number: u32,
    /// Database size in pages after commit; zero for non-commit frames
    pub commit_size: u32,
    pub page: &'a [u8],
}

impl Frame<'_> {
    pub fn is_commit(&self) -> bool {
        self.commit_size != 0
    }
}

/// Result of scanning a run of frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitScan {
    /// Bytes from the start of the buffer through the last valid commit frame
    pub committed_len: usize,
    /// Running checksum after the last valid commit frame
    pub checksum: Checksum,
    /// Number of commit frames found
    pub commits: usize,
}

/// Iterate the valid frames of `buf`, which must start on a frame boundary.
///
/// Iteration stops at the first frame that is truncated, carries the wrong
/// salts, or fails the cumulative checksum. Each item carries the running
/// checksum after that frame and the buffer offset just past it.
pub fn frames<'a>(
    header: &'a WalHeader,
    buf: &'a [u8],
    seed: Checksum,
) -> impl Iterator<Item = (Frame<'a>, Checksum, usize)> + 'a {
    let frame_size = header.frame_size();
    let mut offset = 0usize;
    let mut checksum = seed;

    std::iter::from_fn(move || {
        let frame = buf.get(offset..offset + frame_size)?;

        if (be_u32(frame, 8), be_u32(frame, 12)) != header.salt {
            return None;
        }

        let next = wal_checksum(header.big_endian, &frame[..8], checksum);
        let next = wal_checksum(header.big_endian, &frame[FRAME_HEADER_SIZE..], next);
        if next != (be_u32(frame, 16), be_u32(frame, 20)) {
            return None;
        }

        checksum = next;
        offset += frame_size;

        Some((
            Frame {
                page_number: be_u32(frame, 0),
                commit_size: be_u32(frame, 4),
                page: &frame[FRAME_HEADER_SIZE..],
            },
            next,
            offset,
        ))
    })
}

/// Find how much of `buf` is made of complete, committed transactions.
pub fn scan_committed(header: &WalHeader, buf: &[u8], seed: Checksum) -> CommitScan {
    let mut scan = CommitScan {
        committed_len: 0,
        checksum: seed,
        commits: 0,
    };

    for (frame, checksum, end) in frames(header, buf, seed) {
        if frame.is_commit() {
            scan.committed_len = end;
            scan.checksum = checksum;
            scan.commits += 1;
        }
    }

    scan
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
