use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use canload_protocol::FileUploadRecord;

use crate::StoreError;

/// Name of the metadata index inside the store root.
pub const METADATA_FILE: &str = "uploaded_files_metadata.json";

/// Persistent index of the last record written for each file.
///
/// Every update is written through to disk, so a restarted store still
/// answers `uploaded_file_details` for earlier uploads.
#[derive(Debug)]
pub(crate) struct MetadataIndex {
    path: PathBuf,
    records: BTreeMap<String, FileUploadRecord>,
}

impl MetadataIndex {
    /// Loads the index from `root`, starting empty if none exists.
    pub fn load(root: &Path) -> Result<Self, StoreError> {
        let path = root.join(METADATA_FILE);
        let records = match std::fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<FileUploadRecord> = serde_json::from_slice(&bytes)
                    .map_err(|source| StoreError::CorruptMetadata {
                        path: path.clone(),
                        source,
                    })?;
                list.into_iter().map(|r| (r.filename.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no metadata file, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, records })
    }

    pub fn get(&self, key: &str) -> Option<&FileUploadRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Inserts or replaces a record and persists the index.
    pub fn upsert(&mut self, record: FileUploadRecord) -> Result<(), StoreError> {
        self.records.insert(record.filename.clone(), record);
        self.save()
    }

    fn save(&self) -> Result<(), StoreError> {
        let list: Vec<&FileUploadRecord> = self.records.values().collect();
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&list)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
