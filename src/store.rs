use crate::models::ResponseRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory of record files used as a durable single-consumer queue.
///
/// The external prediction API drops `{id}.json` files here; the reconciler is
/// the only writer afterwards. Writes go through a temp file and rename so a
/// concurrent reader never sees a torn write. Filenames are never trusted to
/// encode record fields; listing filters by suffix only.
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the backing directory if it does not exist
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create record directory: {}", self.dir.display()))
    }

    /// List record file paths in directory order
    pub fn list_pending(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list record directory: {}", self.dir.display()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Read one record. A parse error here usually means the API layer has not
    /// finished writing the file; the caller skips it until the next sweep.
    pub fn read(&self, path: &Path) -> Result<ResponseRecord> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read record file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse record file: {}", path.display()))
    }

    /// Atomically replace the record file's content
    pub fn write(&self, path: &Path, record: &ResponseRecord) -> Result<()> {
        let content = serde_json::to_string_pretty(record)
            .with_context(|| format!("Failed to serialize record {}", record.id))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp record file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!("Failed to replace record file: {}", path.display())
        })
    }

    /// Delete a completed record file (only used when `remove_completed` is on)
    pub fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove record file: {}", path.display()))
    }
}
