use std::fs;
use std::io::{self, Read, Seek};
use std::path::Path;

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::HarvestError;
use crate::progress::{Phase, PhaseProgress, ProgressSink};
use crate::store::DataStore;

/// Archive formats recognized in the staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    pub fn suffix(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::Zip => ".zip",
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        file_name.ends_with(self.suffix())
    }
}

/// Formats expanded by default: batched clinical downloads arrive as
/// tarballs, gzipped or plain.
pub const DEFAULT_FORMATS: [ArchiveFormat; 2] = [ArchiveFormat::TarGz, ArchiveFormat::Tar];

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandReport {
    pub expanded: usize,
    pub failed: usize,
}

/// Decompresses every staged archive in place. A corrupt or unreadable
/// archive is logged and skipped; it never aborts the batch. Re-running over
/// already-expanded archives rewrites identical content.
pub struct ArchiveExpander {
    store: DataStore,
}

impl ArchiveExpander {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }

    pub fn expand(
        &self,
        formats: &[ArchiveFormat],
        sink: &dyn ProgressSink,
    ) -> Result<ExpandReport, HarvestError> {
        let mut archives = Vec::new();
        for path in self.store.staging_entries()? {
            if !path.as_std_path().is_file() {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            if let Some(format) = formats.iter().find(|format| format.matches(name)) {
                archives.push((path, *format));
            }
        }

        let progress = PhaseProgress::new(Phase::Extracting, archives.len(), sink);
        let mut report = ExpandReport::default();
        for (path, format) in archives {
            let target = self.store.root();
            let outcome = match format {
                ArchiveFormat::TarGz => extract_tarball(path.as_std_path(), target.as_std_path(), true),
                ArchiveFormat::Tar => extract_tarball(path.as_std_path(), target.as_std_path(), false),
                ArchiveFormat::Zip => extract_zip(path.as_std_path(), target.as_std_path()),
            };
            match outcome {
                Ok(()) => report.expanded += 1,
                Err(err) => {
                    tracing::error!(archive = %path, %err, "failed to expand staged archive");
                    report.failed += 1;
                }
            }
            progress.tick();
        }
        Ok(report)
    }
}

pub fn extract_tarball(archive_path: &Path, target_dir: &Path, gzipped: bool) -> Result<(), HarvestError> {
    let corrupt = |err: &dyn std::fmt::Display| HarvestError::ArchiveCorrupt {
        archive: archive_path.display().to_string(),
        message: err.to_string(),
    };
    let file = fs::File::open(archive_path).map_err(|err| corrupt(&err))?;
    if gzipped {
        unpack_tar(tar::Archive::new(GzDecoder::new(file)), target_dir, archive_path)
    } else {
        unpack_tar(tar::Archive::new(file), target_dir, archive_path)
    }
}

fn unpack_tar<R: Read>(
    mut archive: tar::Archive<R>,
    target_dir: &Path,
    archive_path: &Path,
) -> Result<(), HarvestError> {
    archive
        .unpack(target_dir)
        .map_err(|err| HarvestError::ArchiveCorrupt {
            archive: archive_path.display().to_string(),
            message: err.to_string(),
        })
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), HarvestError> {
    let file = fs::File::open(zip_path).map_err(|err| HarvestError::ArchiveCorrupt {
        archive: zip_path.display().to_string(),
        message: err.to_string(),
    })?;
    extract_zip_reader(file, target_dir).map_err(|err| match err {
        HarvestError::ArchiveCorrupt { message, .. } => HarvestError::ArchiveCorrupt {
            archive: zip_path.display().to_string(),
            message,
        },
        other => other,
    })
}

/// Extracts a zip archive from any seekable reader, rejecting entries whose
/// paths would escape the target directory.
pub fn extract_zip_reader<R: Read + Seek>(reader: R, target_dir: &Path) -> Result<(), HarvestError> {
    let corrupt = |message: String| HarvestError::ArchiveCorrupt {
        archive: "<zip stream>".to_string(),
        message,
    };
    let mut archive = ZipArchive::new(reader).map_err(|err| corrupt(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|err| corrupt(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(corrupt("zip entry path traversal detected".to_string()));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::progress::NullSink;

    fn write_tarball(path: &Path, member: &str, content: &[u8]) {
        let file = fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, member, content).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn format_matching_by_suffix() {
        assert!(ArchiveFormat::TarGz.matches("payload.tar.gz"));
        assert!(!ArchiveFormat::Tar.matches("payload.tar.gz"));
        assert!(ArchiveFormat::Tar.matches("payload.tar"));
        assert!(ArchiveFormat::Zip.matches("series.zip"));
    }

    #[test]
    fn expands_staged_tarball_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = DataStore::new(root.clone());
        write_tarball(
            store.staging_path("bundle.tar.gz").as_std_path(),
            "uuid-1/reads.bam",
            b"payload",
        );

        let expander = ArchiveExpander::new(store.clone());
        let report = expander.expand(&DEFAULT_FORMATS, &NullSink).unwrap();
        assert_eq!(report.expanded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            fs::read(root.join("uuid-1/reads.bam").as_std_path()).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn corrupt_archive_is_skipped_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = DataStore::new(root.clone());
        fs::write(store.staging_path("broken.tar.gz").as_std_path(), b"not a tarball").unwrap();
        write_tarball(
            store.staging_path("ok.tar.gz").as_std_path(),
            "fine.txt",
            b"fine",
        );

        let expander = ArchiveExpander::new(store);
        let report = expander.expand(&DEFAULT_FORMATS, &NullSink).unwrap();
        assert_eq!(report.expanded, 1);
        assert_eq!(report.failed, 1);
        assert!(root.join("fine.txt").as_std_path().exists());
    }

    #[test]
    fn reexpansion_is_a_no_op_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = DataStore::new(root.clone());
        write_tarball(
            store.staging_path("bundle.tar.gz").as_std_path(),
            "data.txt",
            b"same bytes",
        );

        let expander = ArchiveExpander::new(store);
        expander.expand(&DEFAULT_FORMATS, &NullSink).unwrap();
        let report = expander.expand(&DEFAULT_FORMATS, &NullSink).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(
            fs::read(root.join("data.txt").as_std_path()).unwrap(),
            b"same bytes"
        );
    }
}
