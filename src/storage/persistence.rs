//! On-disk helpers: atomic JSON snapshots and a length-prefixed
//! MessagePack journal.

use crate::core::{MigrateError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Writes `value` as pretty JSON to a temp file next to `path`, then renames
/// it into place so readers never see a torn file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), value)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path)
        .map_err(|e| MigrateError::Io(format!("Failed to persist {}: {}", path.display(), e)))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| MigrateError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Append-only journal of `T` frames: `u32` little-endian length followed by
/// the MessagePack body.
pub struct Journal<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    sync: bool,
    _entry: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    pub fn open<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                MigrateError::Io(format!("Failed to create journal directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MigrateError::Io(format!("Failed to open journal: {}", e)))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            sync,
            _entry: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &T) -> Result<()> {
        let body = rmp_serde::to_vec(entry).map_err(|e| {
            MigrateError::Serialization(format!("Failed to encode journal entry: {}", e))
        })?;
        let len = u32::try_from(body.len()).map_err(|_| {
            MigrateError::Serialization("Journal entry exceeds 4 GiB".to_string())
        })?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_mut().sync_all()?;
        }
        Ok(())
    }

    /// Reads every complete frame. A torn trailing frame (crash mid-append)
    /// ends the replay instead of failing it.
    pub fn read_all(path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut body = vec![0u8; len];
            match reader.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("journal {} ends with a torn frame", path.display());
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            let entry = rmp_serde::from_slice(&body).map_err(|e| {
                MigrateError::Serialization(format!("Failed to decode journal entry: {}", e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        seq: u64,
        note: String,
    }

    #[test]
    fn test_journal_replays_frames_and_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.journal");
        {
            let mut journal = Journal::<Entry>::open(&path, false).unwrap();
            journal.append(&Entry { seq: 1, note: "a".into() }).unwrap();
            journal.append(&Entry { seq: 2, note: "b".into() }).unwrap();
        }
        // Simulate a crash mid-append: a length prefix with no body.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();

        let entries = Journal::<Entry>::read_all(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 2);
    }

    #[test]
    fn test_atomic_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        let back: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
