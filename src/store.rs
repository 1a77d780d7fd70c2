use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::PatientId;
use crate::error::HarvestError;

/// On-disk layout of one output directory. The manifest lives at the root,
/// raw downloaded payloads land flat beside it (the staging area), and
/// organized output lives under `raw/<PatientID>/<modality>/<identifier>/`.
#[derive(Debug, Clone)]
pub struct DataStore {
    root: Utf8PathBuf,
}

impl DataStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join("manifest.json")
    }

    /// A staged payload file, named by whatever identifier the registry
    /// response carried (a file name or a series identifier).
    pub fn staging_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    pub fn raw_root(&self) -> Utf8PathBuf {
        self.root.join("raw")
    }

    pub fn raw_dir(&self, patient: &PatientId, bucket: &str, identifier: &str) -> Utf8PathBuf {
        self.root
            .join("raw")
            .join(patient.as_str())
            .join(bucket)
            .join(identifier)
    }

    /// Non-recursive listing of the staging area: everything directly under
    /// the root except the manifest document and the organized `raw/` tree.
    pub fn staging_entries(&self) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        let mut entries = Vec::new();
        let listing = fs::read_dir(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in listing {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| HarvestError::Filesystem("non-utf8 path in staging".to_string()))?;
            let name = path.file_name().unwrap_or_default();
            if name == "manifest.json" || name == "raw" {
                continue;
            }
            entries.push(path);
        }
        Ok(entries)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = DataStore::new(Utf8PathBuf::from("/data/cohort-a"));
        let patient: PatientId = "TCGA-01".parse().unwrap();

        assert_eq!(store.manifest_path(), "/data/cohort-a/manifest.json");
        assert_eq!(
            store.staging_path("reads.tar.gz"),
            "/data/cohort-a/reads.tar.gz"
        );
        assert_eq!(
            store.raw_dir(&patient, "CT", "1.2.3"),
            "/data/cohort-a/raw/TCGA-01/CT/1.2.3"
        );
    }

    #[test]
    fn staging_listing_skips_manifest_and_raw() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = DataStore::new(root);
        std::fs::write(store.manifest_path().as_std_path(), b"[]").unwrap();
        std::fs::create_dir_all(store.raw_root().as_std_path()).unwrap();
        std::fs::write(store.staging_path("payload.tar.gz").as_std_path(), b"x").unwrap();

        let entries = store.staging_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name(), Some("payload.tar.gz"));
    }
}
