use std::fs;

use camino::Utf8Path;

use crate::domain::{FileReference, FilterSet};
use crate::error::HarvestError;
use crate::manifest::Manifest;
use crate::progress::{Phase, PhaseProgress, ProgressSink};
use crate::store::DataStore;

/// Staging leftovers removed by the final cleanup pass.
const CLEANUP_SUFFIXES: [&str; 4] = [".tar.gz", ".tar", ".log", ".txt"];

#[derive(Debug, Clone, Copy, Default)]
pub struct OrganizeReport {
    pub moved: usize,
    pub missing: usize,
    pub conflicts: usize,
}

/// Moves staged artifacts into `raw/<PatientID>/<bucket>/<identifier>/`
/// using the manifest as the routing table. A vanished source and an
/// already-populated destination are both benign: the former means the item
/// was organized by a prior run or never downloaded, the latter that this
/// run is a re-run.
pub struct FileOrganizer {
    store: DataStore,
    manifest: Manifest,
    filters: FilterSet,
}

impl FileOrganizer {
    pub fn new(store: DataStore, filters: FilterSet) -> Result<Self, HarvestError> {
        let manifest = Manifest::load(&store.manifest_path())?;
        Ok(Self {
            store,
            manifest,
            filters,
        })
    }

    pub fn organize(&self, sink: &dyn ProgressSink) -> Result<OrganizeReport, HarvestError> {
        let mut report = OrganizeReport::default();
        let progress = PhaseProgress::new(Phase::Organizing, self.manifest.len(), sink);

        for entry in self.manifest.entries() {
            for (bucket, references) in &entry.buckets {
                if !self.filters.selects(bucket) {
                    continue;
                }
                for reference in references {
                    let dest = self
                        .store
                        .raw_dir(&entry.patient_id, bucket, reference.identifier());
                    match reference {
                        FileReference::Clinical(file) => {
                            self.place_clinical(&file.file_name, &file.id, &dest, &mut report)?;
                        }
                        FileReference::Imaging(series) => {
                            self.place_series(
                                &series.series_instance_uid,
                                &dest,
                                &mut report,
                            )?;
                        }
                    }
                }
            }
            progress.tick();
        }
        Ok(report)
    }

    /// A clinical payload may sit in staging as a bare file (single-file
    /// download) or as an expanded `<uuid>/` directory (batched tarball).
    fn place_clinical(
        &self,
        file_name: &str,
        file_id: &str,
        dest: &Utf8Path,
        report: &mut OrganizeReport,
    ) -> Result<(), HarvestError> {
        let staged_file = self.store.staging_path(file_name);
        let staged_dir = self.store.staging_path(file_id);
        let mut found_source = false;

        if staged_file.as_std_path().is_file() {
            found_source = true;
            ensure_dir(dest)?;
            let target = dest.join(file_name);
            if target.as_std_path().exists() {
                report.conflicts += 1;
            } else {
                rename(&staged_file, &target)?;
                report.moved += 1;
            }
        }

        if staged_dir.as_std_path().is_dir() {
            found_source = true;
            ensure_dir(dest)?;
            move_dir_contents(&staged_dir, dest, report)?;
            if fs::remove_dir(staged_dir.as_std_path()).is_err() {
                tracing::debug!(dir = %staged_dir, "staged directory not empty after move");
            }
        }

        if !found_source {
            report.missing += 1;
        }
        Ok(())
    }

    fn place_series(
        &self,
        series_uid: &str,
        dest: &Utf8Path,
        report: &mut OrganizeReport,
    ) -> Result<(), HarvestError> {
        let source = self.store.staging_path(series_uid);
        if !source.as_std_path().is_dir() {
            report.missing += 1;
            return Ok(());
        }
        if dest.as_std_path().exists() {
            report.conflicts += 1;
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        rename(&source, dest)?;
        report.moved += 1;
        Ok(())
    }

    /// Removes leftover archive and log artifacts from the staging area once
    /// every entry is organized.
    pub fn cleanup(&self) -> Result<usize, HarvestError> {
        let mut removed = 0;
        for path in self.store.staging_entries()? {
            if !path.as_std_path().is_file() {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            if CLEANUP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn ensure_dir(path: &Utf8Path) -> Result<(), HarvestError> {
    fs::create_dir_all(path.as_std_path()).map_err(|err| HarvestError::Filesystem(err.to_string()))
}

fn rename(from: &Utf8Path, to: &Utf8Path) -> Result<(), HarvestError> {
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("move {from} -> {to}: {err}")))
}

fn move_dir_contents(
    source: &Utf8Path,
    dest: &Utf8Path,
    report: &mut OrganizeReport,
) -> Result<(), HarvestError> {
    let entries = fs::read_dir(source.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let name = entry.file_name();
        let target = dest.as_std_path().join(&name);
        if target.exists() {
            report.conflicts += 1;
            continue;
        }
        fs::rename(entry.path(), &target)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        report.moved += 1;
    }
    Ok(())
}
