//! Storage port for the twin adapter: atomic configuration snapshots and
//! diagnostic records for malformed inbound payloads.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use tracing::warn;

pub trait Storage {
    /// Writes `bytes` to `path` such that readers never observe a torn
    /// value: either the previous content or the new one.
    fn write_atomic(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Persists a diagnostic record (malformed payload, parse error).
    fn write_error_record(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Filesystem-backed storage. Atomicity comes from writing a sibling
/// temporary file and renaming it over the destination.
pub struct FsStorage {
    error_path: PathBuf,
}

impl FsStorage {
    pub fn new(error_path: PathBuf) -> Self {
        Self { error_path }
    }
}

impl Storage for FsStorage {
    fn write_atomic(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        if let Err(err) = fs::rename(&tmp, path) {
            // don't leave the temp file behind on failure
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        Ok(())
    }

    fn write_error_record(&mut self, bytes: &[u8]) -> io::Result<()> {
        let error_path = self.error_path.clone();
        if let Err(err) = self.write_atomic(&error_path, bytes) {
            warn!("failed to persist error record to {}: {err}", error_path.display());
            return Err(err);
        }
        Ok(())
    }
}

/// In-memory storage for tests; records every write.
#[derive(Debug, Default)]
pub struct MemStorage {
    pub writes: Vec<(PathBuf, Vec<u8>)>,
    pub error_records: Vec<Vec<u8>>,
    pub fail_writes: bool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest content written to `path`, if any.
    pub fn read(&self, path: &Path) -> Option<&[u8]> {
        self.writes
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, bytes)| bytes.as_slice())
    }
}

impl Storage for MemStorage {
    fn write_atomic(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("simulated storage failure"));
        }
        self.writes.push((path.to_path_buf(), bytes.to_vec()));
        Ok(())
    }

    fn write_error_record(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.error_records.push(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut storage = FsStorage::new(dir.path().join("error.json"));

        storage.write_atomic(&path, b"{\"v\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":1}");

        storage.write_atomic(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":2}");

        // no temp file left behind
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/config.json");
        let mut storage = FsStorage::new(dir.path().join("error.json"));

        storage.write_atomic(&path, b"x").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn error_records_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let error_path = dir.path().join("twin-error.json");
        let mut storage = FsStorage::new(error_path.clone());

        storage.write_error_record(b"{\"error\":\"bad json\"}").unwrap();
        assert_eq!(fs::read(&error_path).unwrap(), b"{\"error\":\"bad json\"}");
    }
}
