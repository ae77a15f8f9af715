//! Snapshot files of the in-memory backend.
//!
//! File layout: `magic(8) version(u32 LE) id(u64 LE) payload_len(u64 LE) crc32(u32 LE) payload`,
//! where the payload is the bincode encoding of a [`BackendImage`]. Files are installed
//! atomically (temp file, fsync, rename, fsync dir) and named `snapshot_<id>.bin`.

use crate::error::DbError;
use crate::storage::{BackendImage, MemoryBackend};

use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAP_MAGIC: &[u8; 8] = b"TIERSNP1";
const SNAP_VERSION: u32 = 1;

/// Handles snapshot operations
#[derive(Debug)]
pub struct Snapshotter {
    snapshot_dir: PathBuf,
}

impl Snapshotter {
    /// Creates the snapshot directory if needed.
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self, DbError> {
        let dir_path = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir_path)?;
        Ok(Snapshotter {
            snapshot_dir: dir_path,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Writes a snapshot of every table in `backend` and returns its path.
    ///
    /// Snapshot ids are nanosecond wall-clock stamps, bumped past the latest existing id so
    /// ordering by id matches creation order.
    pub fn create_snapshot(&self, backend: &MemoryBackend) -> Result<PathBuf, DbError> {
        let image = backend.image()?;
        let payload =
            bincode::serialize(&image).map_err(|e| DbError::Serialization(e.to_string()))?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let id = match self.latest_snapshot_id()? {
            Some(latest) => now_ns().max(latest.saturating_add(1)),
            None => now_ns(),
        };
        let final_path = self.snapshot_dir.join(format!("snapshot_{}.bin", id));
        let tmp_path = self.snapshot_dir.join(format!(".tmp_snapshot_{}.bin", id));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SNAP_MAGIC)?;
        w.write_all(&SNAP_VERSION.to_le_bytes())?;
        w.write_all(&id.to_le_bytes())?;
        w.write_all(&(payload.len() as u64).to_le_bytes())?;
        w.write_all(&crc.to_le_bytes())?;
        w.write_all(&payload)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.snapshot_dir)?;
        Ok(final_path)
    }

    /// Reads the newest snapshot, if any.
    pub fn load_latest_snapshot(&self) -> Result<Option<BackendImage>, DbError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));
        match snaps.first() {
            Some((_, path)) => read_snapshot(path).map(Some),
            None => Ok(None),
        }
    }

    /// Loads the newest snapshot into `backend`. Returns whether one was found.
    pub fn restore_latest(&self, backend: &MemoryBackend) -> Result<bool, DbError> {
        match self.load_latest_snapshot()? {
            Some(image) => {
                backend.restore(image)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn latest_snapshot_id(&self) -> Result<Option<u64>, DbError> {
        Ok(list_snapshots(&self.snapshot_dir)?
            .into_iter()
            .map(|(id, _)| id)
            .max())
    }
}

fn read_snapshot(path: &Path) -> Result<BackendImage, DbError> {
    let corrupt = |details: String| DbError::Corruption {
        details,
        series: None,
        timestamp: None,
    };

    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SNAP_MAGIC {
        return Err(corrupt(format!("Bad snapshot magic in {:?}", path)));
    }
    let mut b4 = [0u8; 4];
    reader.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != SNAP_VERSION {
        return Err(corrupt(format!(
            "Unsupported snapshot version {} in {:?}",
            version, path
        )));
    }
    let mut b8 = [0u8; 8];
    reader.read_exact(&mut b8)?;
    let _id = u64::from_le_bytes(b8);
    reader.read_exact(&mut b8)?;
    let payload_len = u64::from_le_bytes(b8);
    reader.read_exact(&mut b4)?;
    let expected_crc = u32::from_le_bytes(b4);

    let mut payload = Vec::new();
    reader.take(payload_len).read_to_end(&mut payload)?;
    if payload.len() as u64 != payload_len {
        return Err(corrupt(format!("Truncated snapshot payload in {:?}", path)));
    }
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Err(corrupt(format!("Snapshot payload CRC mismatch in {:?}", path)));
    }

    bincode::deserialize(&payload)
        .map_err(|e| corrupt(format!("Undecodable snapshot payload in {:?}: {}", path, e)))
}

fn sync_dir(dir: &Path) -> Result<(), DbError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>, DbError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id_str) = name
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".bin"))
        else {
            continue;
        };
        let Ok(id) = id_str.parse::<u64>() else { continue };
        out.push((id, entry.path()));
    }
    Ok(out)
}
