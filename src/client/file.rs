//! Filesystem replica client
//!
//! Treats a directory as an object-storage bucket:
//!
//! ```text
//! <root>/generations/<gen>/snapshots/<index:08x>.snapshot
//! <root>/generations/<gen>/wal/<index:08x>/<offset:08x>.wal
//! <root>/generations/<gen>/position.json
//! ```
//!
//! Every object is written to a temporary name, fsynced, renamed into place,
//! and the parent directory fsynced. Snapshot and segment objects carry a
//! 12-byte trailer (CRC32 of the payload, payload length) checked on fetch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    sort_by_recency, ClientError, ClientResult, GenerationInfo, PositionMarker, ReplicaClient,
    Segment, Snapshot,
};
use crate::replication::{Generation, Position, FIRST_INDEX};

const TRAILER_SIZE: usize = 12;

/// Replica client backed by a local or mounted directory
#[derive(Debug, Clone)]
pub struct FileReplicaClient {
    root: PathBuf,
}

impl FileReplicaClient {
    /// Create a client rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a client rooted at `root/prefix`
    pub fn with_prefix(root: impl Into<PathBuf>, prefix: &str) -> Self {
        let root = root.into();
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            Self::new(root)
        } else {
            Self::new(root.join(prefix))
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join("generations")
    }

    fn generation_dir(&self, generation: &Generation) -> PathBuf {
        self.generations_dir().join(generation.to_string())
    }

    fn snapshot_path(&self, generation: &Generation) -> PathBuf {
        self.generation_dir(generation)
            .join("snapshots")
            .join(format!("{:08x}.snapshot", FIRST_INDEX))
    }

    fn wal_dir(&self, generation: &Generation) -> PathBuf {
        self.generation_dir(generation).join("wal")
    }

    fn segment_path(&self, generation: &Generation, index: u64, offset: u64) -> PathBuf {
        self.wal_dir(generation)
            .join(format!("{:08x}", index))
            .join(format!("{:08x}.wal", offset))
    }

    fn position_path(&self, generation: &Generation) -> PathBuf {
        self.generation_dir(generation).join("position.json")
    }

    async fn read_marker(&self, generation: &Generation) -> ClientResult<Option<PositionMarker>> {
        match fs::read(self.position_path(generation)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ReplicaClient for FileReplicaClient {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn generations(&self) -> ClientResult<Vec<GenerationInfo>> {
        let mut entries = match fs::read_dir(self.generations_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut generations = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(generation) = name.to_str().and_then(|s| s.parse::<Generation>().ok()) else {
                continue;
            };

            let has_snapshot = fs::try_exists(self.snapshot_path(&generation)).await?;
            // An unreadable marker makes the generation unrestorable, not the listing fatal
            let marker = self.read_marker(&generation).await.unwrap_or(None);

            generations.push(GenerationInfo {
                generation,
                has_snapshot,
                marker,
            });
        }

        sort_by_recency(&mut generations);
        Ok(generations)
    }

    async fn latest_position(&self, generation: &Generation) -> ClientResult<Position> {
        self.read_marker(generation)
            .await?
            .map(|marker| marker.position)
            .ok_or_else(|| ClientError::NotFound(format!("position marker for {}", generation)))
    }

    async fn fetch_snapshot(&self, generation: &Generation) -> ClientResult<Snapshot> {
        let path = self.snapshot_path(generation);
        let bytes = fs::read(&path).await?;
        let data = decode_object(bytes, &path)?;
        Ok(Snapshot {
            generation: *generation,
            data,
        })
    }

    async fn fetch_segments(
        &self,
        generation: &Generation,
        from: &Position,
    ) -> ClientResult<Vec<Segment>> {
        let mut index_dirs = match fs::read_dir(self.wal_dir(generation)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(index_entry) = index_dirs.next_entry().await? {
            let Some(index) = parse_hex_name(&index_entry.file_name(), "") else {
                continue;
            };
            if index < from.index {
                continue;
            }

            let mut files = fs::read_dir(index_entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let Some(offset) = parse_hex_name(&file.file_name(), ".wal") else {
                    continue;
                };
                if (index, offset) >= (from.index, from.offset) {
                    keys.push((index, offset));
                }
            }
        }
        keys.sort_unstable();

        let mut segments = Vec::with_capacity(keys.len());
        for (index, offset) in keys {
            let path = self.segment_path(generation, index, offset);
            let bytes = fs::read(&path).await?;
            segments.push(Segment {
                generation: *generation,
                index,
                offset,
                data: decode_object(bytes, &path)?,
            });
        }
        Ok(segments)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> ClientResult<()> {
        let path = self.snapshot_path(&snapshot.generation);
        put_object(&path, &encode_object(&snapshot.data)).await
    }

    async fn write_segment(&self, segment: &Segment) -> ClientResult<()> {
        let path = self.segment_path(&segment.generation, segment.index, segment.offset);
        put_object(&path, &encode_object(&segment.data)).await
    }

    async fn write_position(&self, position: &Position) -> ClientResult<()> {
        let marker = PositionMarker {
            position: *position,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&marker)?;
        put_object(&self.position_path(&position.generation), &bytes).await
    }
}

/// Append the CRC32 + length trailer
fn encode_object(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + TRAILER_SIZE);
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes
}

/// Verify and strip the trailer
fn decode_object(mut bytes: Vec<u8>, path: &Path) -> ClientResult<Vec<u8>> {
    if bytes.len() < TRAILER_SIZE {
        return Err(ClientError::Corrupt(format!(
            "{}: object shorter than trailer",
            path.display()
        )));
    }

    let split = bytes.len() - TRAILER_SIZE;
    let trailer = bytes.split_off(split);

    let mut crc = [0u8; 4];
    crc.copy_from_slice(&trailer[..4]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&trailer[4..]);

    if u64::from_le_bytes(len) != bytes.len() as u64 {
        return Err(ClientError::Corrupt(format!("{}: length mismatch", path.display())));
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&bytes) {
        return Err(ClientError::Corrupt(format!("{}: checksum mismatch", path.display())));
    }

    Ok(bytes)
}

/// Write via temp file + fsync + rename + parent fsync
async fn put_object(path: &Path, bytes: &[u8]) -> ClientResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ClientError::Io(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await?;
        sync_dir(parent).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result.map_err(ClientError::from)
}

async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir).await?.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
    }

    Ok(())
}

fn parse_hex_name(name: &std::ffi::OsStr, suffix: &str) -> Option<u64> {
    let name = name.to_str()?.strip_suffix(suffix)?;
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment(generation: Generation, index: u64, offset: u64, fill: u8) -> Segment {
        Segment {
            generation,
            index,
            offset,
            data: vec![fill; 64],
        }
    }

    #[tokio::test]
    async fn test_empty_bucket_has_no_generations() {
        let dir = TempDir::new().unwrap();
        let client = FileReplicaClient::new(dir.path().join("bucket"));
        assert!(client.generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_segments_and_marker() {
        let dir = TempDir::new().unwrap();
        let client = FileReplicaClient::with_prefix(dir.path(), "db/");
        let generation = Generation::new();

        client
            .write_snapshot(&Snapshot {
                generation,
                data: b"snapshot".to_vec(),
            })
            .await
            .unwrap();
        client.write_segment(&segment(generation, 1, 0, 1)).await.unwrap();
        client.write_segment(&segment(generation, 1, 64, 2)).await.unwrap();
        client.write_segment(&segment(generation, 2, 0, 3)).await.unwrap();
        let marker = Position::new(generation, 2, 64);
        client.write_position(&marker).await.unwrap();

        assert_eq!(client.latest_position(&generation).await.unwrap(), marker);
        assert_eq!(client.fetch_snapshot(&generation).await.unwrap().data, b"snapshot");

        let all = client
            .fetch_segments(&generation, &Position::snapshot(generation))
            .await
            .unwrap();
        let keys: Vec<(u64, u64)> = all.iter().map(|s| (s.index, s.offset)).collect();
        assert_eq!(keys, vec![(1, 0), (1, 64), (2, 0)]);

        let tail = client
            .fetch_segments(&generation, &Position::new(generation, 1, 64))
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);

        let gens = client.generations().await.unwrap();
        assert_eq!(gens.len(), 1);
        assert!(gens[0].is_restorable());
    }

    #[tokio::test]
    async fn test_corrupt_segment_detected() {
        let dir = TempDir::new().unwrap();
        let client = FileReplicaClient::new(dir.path());
        let generation = Generation::new();
        client.write_segment(&segment(generation, 1, 0, 7)).await.unwrap();

        let path = client.segment_path(&generation, 1, 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[3] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = client
            .fetch_segments(&generation, &Position::snapshot(generation))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_missing_marker_is_not_found() {
        let dir = TempDir::new().unwrap();
        let client = FileReplicaClient::new(dir.path());
        let err = client.latest_position(&Generation::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let client = FileReplicaClient::new(dir.path());
        let generation = Generation::new();
        client.write_segment(&segment(generation, 1, 0, 1)).await.unwrap();

        let index_dir = client.wal_dir(&generation).join("00000001");
        let names: Vec<String> = std::fs::read_dir(index_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["00000000.wal".to_string()]);
    }
}
