//! WAL segment replay
//!
//! Rebuilds a database file from a snapshot and the shipped WAL segments of
//! one generation. Segments of one WAL index are concatenated back into the
//! WAL they were cut from; each committed transaction's pages are written at
//! `(page_number - 1) * page_size` and the file is truncated to the
//! committed database size.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use super::errors::{RestoreError, RestoreResult};
use crate::client::Segment;
use crate::replication::wal::{frames, WalHeader, WAL_HEADER_SIZE};
use crate::replication::{Context, Position, FIRST_INDEX};

/// Totals for one replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments: usize,
    pub transactions: usize,
    pub pages: usize,
}

/// Order the segments covering everything before `marker` and verify the
/// chain has no gap or overlap.
///
/// Segments starting at or past the marker are ignored.
pub fn plan(segments: Vec<Segment>, marker: &Position) -> RestoreResult<BTreeMap<u64, Vec<Segment>>> {
    let mut by_index: BTreeMap<u64, Vec<Segment>> = BTreeMap::new();
    for segment in segments {
        if segment.generation != marker.generation {
            return Err(RestoreError::corruption(format!(
                "segment of generation {} listed under {}",
                segment.generation, marker.generation
            )));
        }
        if segment.start() >= *marker {
            continue;
        }
        if segment.end() > *marker {
            return Err(RestoreError::corruption(format!(
                "segment {} straddles marker {}",
                segment.start(),
                marker
            )));
        }
        by_index.entry(segment.index).or_default().push(segment);
    }

    let mut expected_index = FIRST_INDEX;
    let mut reached = Position::snapshot(marker.generation);
    for (index, chain) in by_index.iter_mut() {
        if *index != expected_index {
            return Err(RestoreError::corruption(format!(
                "missing WAL index {:08x} (next present is {:08x})",
                expected_index, index
            )));
        }
        chain.sort_by_key(|s| s.offset);

        let mut offset = 0u64;
        for segment in chain.iter() {
            if segment.offset != offset {
                let kind = if segment.offset > offset { "gap" } else { "overlap" };
                return Err(RestoreError::corruption(format!(
                    "{} in WAL index {:08x} at offset {:08x} (segment starts at {:08x})",
                    kind, index, offset, segment.offset
                )));
            }
            offset = segment.offset + segment.data.len() as u64;
        }
        reached = Position::new(marker.generation, *index, offset);
        expected_index += 1;
    }

    if reached != *marker {
        return Err(RestoreError::corruption(format!(
            "segment chain ends at {}, marker is {}",
            reached, marker
        )));
    }

    Ok(by_index)
}

/// Apply every planned segment onto `file`, which holds the snapshot.
pub fn apply(
    ctx: &Context,
    file: &mut File,
    snapshot_page_size: Option<u32>,
    plan: &BTreeMap<u64, Vec<Segment>>,
) -> RestoreResult<ReplayStats> {
    let mut stats = ReplayStats::default();

    for (index, chain) in plan {
        ctx.check().map_err(|_| RestoreError::cancelled())?;

        let wal: Vec<u8> = chain.iter().flat_map(|s| s.data.iter().copied()).collect();
        let header = WalHeader::parse(&wal).map_err(|e| {
            RestoreError::corruption(format!("WAL index {:08x}: {}", index, e))
        })?;
        if let Some(page_size) = snapshot_page_size {
            if page_size != header.page_size {
                return Err(RestoreError::corruption(format!(
                    "WAL index {:08x} page size {} differs from database page size {}",
                    index, header.page_size, page_size
                )));
            }
        }

        let (transactions, pages) = apply_wal(file, &header, &wal)
            .map_err(|e| e.with_index(*index))?;
        stats.segments += chain.len();
        stats.transactions += transactions;
        stats.pages += pages;
    }

    Ok(stats)
}

enum ApplyError {
    Io(std::io::Error),
    Trailing(usize),
    PageZero,
}

impl ApplyError {
    fn with_index(self, index: u64) -> RestoreError {
        match self {
            ApplyError::Io(e) => RestoreError::io_error(format!("replay WAL index {:08x}", index), e),
            ApplyError::Trailing(bytes) => RestoreError::corruption(format!(
                "WAL index {:08x}: {} bytes are not committed frames",
                index, bytes
            )),
            ApplyError::PageZero => RestoreError::corruption(format!(
                "WAL index {:08x}: frame for page 0",
                index
            )),
        }
    }
}

impl From<std::io::Error> for ApplyError {
    fn from(e: std::io::Error) -> Self {
        ApplyError::Io(e)
    }
}

fn apply_wal(file: &mut File, header: &WalHeader, wal: &[u8]) -> Result<(usize, usize), ApplyError> {
    let body = &wal[WAL_HEADER_SIZE..];
    let page_size = header.page_size as u64;

    let mut pending: Vec<(u32, &[u8])> = Vec::new();
    let mut consumed = 0usize;
    let mut transactions = 0usize;
    let mut pages = 0usize;

    for (frame, _, end) in frames(header, body, header.checksum) {
        pending.push((frame.page_number, frame.page));
        if frame.is_commit() {
            for (page_number, page) in pending.drain(..) {
                let slot = u64::from(page_number).checked_sub(1).ok_or(ApplyError::PageZero)?;
                file.seek(SeekFrom::Start(slot * page_size))?;
                file.write_all(page)?;
                pages += 1;
            }
            file.set_len(frame.commit_size as u64 * page_size)?;
            transactions += 1;
            consumed = end;
        }
    }

    if consumed != body.len() {
        return Err(ApplyError::Trailing(body.len() - consumed));
    }
    Ok((transactions, pages))
}

/// Page size recorded in a database header; `None` for an empty file
pub fn database_page_size(snapshot: &[u8]) -> RestoreResult<Option<u32>> {
    if snapshot.is_empty() {
        return Ok(None);
    }
    if snapshot.len() < 100 || &snapshot[..16] != b"SQLite format 3\0" {
        return Err(RestoreError::corruption("snapshot is not a SQLite database"));
    }
    let raw = u16::from_be_bytes([snapshot[16], snapshot[17]]);
    Ok(Some(if raw == 1 { 65536 } else { raw as u32 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::wal::testing::{header, push_frame, PAGE_SIZE};
    use crate::replication::Generation;
    use std::io::Read;

    const SALT: (u32, u32) = (7, 9);

    fn segment(generation: Generation, index: u64, offset: u64, data: Vec<u8>) -> Segment {
        Segment {
            generation,
            index,
            offset,
            data,
        }
    }

    #[test]
    fn test_plan_detects_gap_and_overlap() {
        let g = Generation::new();
        let segs = vec![segment(g, 1, 0, vec![0; 100]), segment(g, 1, 150, vec![0; 50])];
        let err = plan(segs, &Position::new(g, 1, 200)).unwrap_err();
        assert!(err.message().contains("gap"));

        let segs = vec![segment(g, 1, 0, vec![0; 100]), segment(g, 1, 80, vec![0; 120])];
        let err = plan(segs, &Position::new(g, 1, 200)).unwrap_err();
        assert!(err.message().contains("overlap"));

        let segs = vec![segment(g, 2, 0, vec![0; 100])];
        let err = plan(segs, &Position::new(g, 2, 100)).unwrap_err();
        assert!(err.message().contains("missing WAL index"));
    }

    #[test]
    fn test_plan_ignores_segments_past_marker() {
        let g = Generation::new();
        let segs = vec![
            segment(g, 1, 0, vec![0; 100]),
            segment(g, 1, 100, vec![0; 100]),
            segment(g, 1, 200, vec![0; 100]),
        ];
        let planned = plan(segs, &Position::new(g, 1, 200)).unwrap();
        assert_eq!(planned[&1].len(), 2);
    }

    #[test]
    fn test_plan_requires_chain_to_reach_marker() {
        let g = Generation::new();
        let segs = vec![segment(g, 1, 0, vec![0; 100])];
        assert!(plan(segs, &Position::new(g, 1, 300)).is_err());
        assert!(plan(Vec::new(), &Position::snapshot(g)).unwrap().is_empty());
    }

    #[test]
    fn test_apply_writes_committed_pages_and_truncates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE as usize * 4]).unwrap();

        let mut wal = header(SALT);
        let hdr = WalHeader::parse(&wal).unwrap();
        let c = push_frame(&mut wal, SALT, hdr.checksum, 1, 0, 0x11);
        let c = push_frame(&mut wal, SALT, c, 2, 2, 0x22);
        let first_len = wal.len();
        push_frame(&mut wal, SALT, c, 1, 2, 0x33);

        let g = Generation::new();
        let segs = vec![
            segment(g, 1, 0, wal[..first_len].to_vec()),
            segment(g, 1, first_len as u64, wal[first_len..].to_vec()),
        ];
        let planned = plan(segs, &Position::new(g, 1, wal.len() as u64)).unwrap();

        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let stats = apply(&Context::background(), &mut file, None, &planned).unwrap();
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.pages, 3);

        let mut bytes = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE as usize * 2);
        assert!(bytes[..PAGE_SIZE as usize].iter().all(|b| *b == 0x33));
        assert!(bytes[PAGE_SIZE as usize..].iter().all(|b| *b == 0x22));
    }

    #[test]
    fn test_apply_rejects_uncommitted_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db");
        std::fs::write(&path, b"").unwrap();

        let mut wal = header(SALT);
        let hdr = WalHeader::parse(&wal).unwrap();
        push_frame(&mut wal, SALT, hdr.checksum, 1, 0, 0x11);

        let g = Generation::new();
        let mut planned = BTreeMap::new();
        planned.insert(1, vec![segment(g, 1, 0, wal)]);

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let err = apply(&Context::background(), &mut file, None, &planned).unwrap_err();
        assert!(err.message().contains("not committed"));
    }

    #[test]
    fn test_database_page_size() {
        assert_eq!(database_page_size(&[]).unwrap(), None);
        let mut header = vec![0u8; 100];
        header[..16].copy_from_slice(b"SQLite format 3\0");
        header[16..18].copy_from_slice(&4096u16.to_be_bytes());
        assert_eq!(database_page_size(&header).unwrap(), Some(4096));
        header[16..18].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(database_page_size(&header).unwrap(), Some(65536));
        assert!(database_page_size(b"garbage").is_err());
    }
}
