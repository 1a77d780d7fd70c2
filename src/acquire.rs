use std::fs;

use crate::domain::{FileReference, FilterSet, IMAGING_MODALITIES, ImagingFileRef, PatientId};
use crate::error::HarvestError;
use crate::gdc::ClinicalRegistry;
use crate::idc::ImagingRegistry;
use crate::manifest::Manifest;
use crate::pool::run_parallel;
use crate::progress::{Phase, PhaseProgress, ProgressSink};
use crate::store::DataStore;

pub const DEFAULT_THREADS: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireReport {
    pub files_downloaded: usize,
    pub files_skipped: usize,
    pub series_downloaded: usize,
    pub series_skipped: usize,
    pub failures: usize,
    pub manifest_additions: usize,
}

struct ClinicalWork {
    patient: PatientId,
    buckets: Vec<(String, Vec<(String, String)>)>,
}

struct SeriesWork {
    patient: PatientId,
    modality: String,
    series: ImagingFileRef,
}

enum SeriesOutcome {
    Downloaded,
    Skipped,
    Failed,
}

/// Downloads every file the manifest references and is not already on disk.
/// The manifest is read once at construction; a missing manifest is a fatal
/// precondition. Item-level failures are logged with their identifiers and
/// counted, never propagated out of the worker pool.
pub struct FileAcquirer<'a, C: ClinicalRegistry> {
    store: DataStore,
    manifest: Manifest,
    clinical: &'a C,
    imaging: &'a [Box<dyn ImagingRegistry>],
    filters: FilterSet,
    threads: usize,
}

impl<'a, C: ClinicalRegistry> FileAcquirer<'a, C> {
    pub fn new(
        store: DataStore,
        clinical: &'a C,
        imaging: &'a [Box<dyn ImagingRegistry>],
        filters: FilterSet,
    ) -> Result<Self, HarvestError> {
        let manifest = Manifest::load(&store.manifest_path())?;
        Ok(Self {
            store,
            manifest,
            clinical,
            imaging,
            filters,
            threads: DEFAULT_THREADS,
        })
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn process_cases(&mut self, sink: &dyn ProgressSink) -> Result<AcquireReport, HarvestError> {
        let mut report = AcquireReport {
            manifest_additions: self.register_existing_downloads()?,
            ..AcquireReport::default()
        };
        self.download_clinical(sink, &mut report);
        self.download_imaging(sink, &mut report);
        Ok(report)
    }

    /// A file already staged or already organized needs no network call.
    fn clinical_file_present(&self, patient: &PatientId, bucket: &str, id: &str, file_name: &str) -> bool {
        self.store.staging_path(file_name).as_std_path().exists()
            || self.store.staging_path(id).as_std_path().is_dir()
            || self.store.raw_dir(patient, bucket, id).as_std_path().exists()
    }

    fn series_present(&self, patient: &PatientId, modality: &str, series_uid: &str) -> bool {
        self.store.staging_path(series_uid).as_std_path().is_dir()
            || self
                .store
                .raw_dir(patient, modality, series_uid)
                .as_std_path()
                .exists()
    }

    fn download_clinical(&self, sink: &dyn ProgressSink, report: &mut AcquireReport) {
        let work: Vec<ClinicalWork> = self
            .manifest
            .entries()
            .iter()
            .map(|entry| ClinicalWork {
                patient: entry.patient_id.clone(),
                buckets: entry
                    .buckets
                    .iter()
                    .filter(|(label, _)| self.filters.selects(label))
                    .map(|(label, references)| {
                        let files: Vec<(String, String)> = references
                            .iter()
                            .filter_map(|reference| match reference {
                                FileReference::Clinical(file) => {
                                    Some((file.id.clone(), file.file_name.clone()))
                                }
                                FileReference::Imaging(_) => None,
                            })
                            .collect();
                        (label.clone(), files)
                    })
                    .filter(|(_, files)| !files.is_empty())
                    .collect(),
            })
            .filter(|work| !work.buckets.is_empty())
            .collect();

        let progress = PhaseProgress::new(Phase::Downloading, work.len(), sink);
        let outcomes = run_parallel(self.threads, work, |work| {
            let outcome = self.download_patient_files(&work);
            progress.tick();
            outcome
        });

        for (downloaded, skipped, failed) in outcomes {
            report.files_downloaded += downloaded;
            report.files_skipped += skipped;
            report.failures += failed;
        }
    }

    /// One worker task: every eligible bucket of one patient. File ids from
    /// the same bucket are batched into a single multi-id download.
    fn download_patient_files(&self, work: &ClinicalWork) -> (usize, usize, usize) {
        let (mut downloaded, mut skipped, mut failed) = (0, 0, 0);
        for (bucket, files) in &work.buckets {
            let mut pending = Vec::new();
            for (id, file_name) in files {
                if self.clinical_file_present(&work.patient, bucket, id, file_name) {
                    skipped += 1;
                } else {
                    pending.push(id.clone());
                }
            }
            if pending.is_empty() {
                continue;
            }
            match self.clinical.download_files(&pending, self.store.root()) {
                Ok(Some(_)) => downloaded += pending.len(),
                Ok(None) => {
                    tracing::warn!(
                        patient = %work.patient,
                        bucket = bucket.as_str(),
                        "download response carried no filename header; skipping batch"
                    );
                    failed += pending.len();
                }
                Err(err) => {
                    tracing::warn!(
                        patient = %work.patient,
                        bucket = bucket.as_str(),
                        %err,
                        "clinical download failed; files left for a future run"
                    );
                    failed += pending.len();
                }
            }
        }
        (downloaded, skipped, failed)
    }

    fn download_imaging(&self, sink: &dyn ProgressSink, report: &mut AcquireReport) {
        let work: Vec<SeriesWork> = self
            .manifest
            .entries()
            .iter()
            .flat_map(|entry| {
                entry
                    .buckets
                    .iter()
                    .filter(|(label, _)| self.filters.selects(label))
                    .flat_map(|(label, references)| {
                        references.iter().filter_map(|reference| match reference {
                            FileReference::Imaging(series) => Some(SeriesWork {
                                patient: entry.patient_id.clone(),
                                modality: label.clone(),
                                series: series.clone(),
                            }),
                            FileReference::Clinical(_) => None,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let progress = PhaseProgress::new(Phase::Downloading, work.len(), sink);
        let outcomes = run_parallel(self.threads, work, |work| {
            let outcome = self.download_series(&work);
            progress.tick();
            outcome
        });

        for outcome in outcomes {
            match outcome {
                SeriesOutcome::Downloaded => report.series_downloaded += 1,
                SeriesOutcome::Skipped => report.series_skipped += 1,
                SeriesOutcome::Failed => report.failures += 1,
            }
        }
    }

    fn download_series(&self, work: &SeriesWork) -> SeriesOutcome {
        let series_uid = &work.series.series_instance_uid;
        if self.series_present(&work.patient, &work.modality, series_uid) {
            return SeriesOutcome::Skipped;
        }

        let registry = self
            .imaging
            .iter()
            .find(|registry| work.series.source.as_deref() == Some(registry.registry_name()))
            .or_else(|| {
                self.imaging
                    .iter()
                    .find(|registry| registry.can_download(&work.series))
            });
        let Some(registry) = registry else {
            tracing::warn!(
                patient = %work.patient,
                series = series_uid.as_str(),
                "no registry can serve this series reference; skipping"
            );
            return SeriesOutcome::Failed;
        };

        let dest = self.store.staging_path(series_uid);
        match registry.download_series(&work.series, &dest) {
            Ok(()) => SeriesOutcome::Downloaded,
            Err(err) => {
                tracing::warn!(
                    registry = registry.registry_name(),
                    patient = %work.patient,
                    series = series_uid.as_str(),
                    %err,
                    "series download failed; left for a future run"
                );
                // A partially written series directory must not satisfy the
                // next run's existence check.
                let _ = fs::remove_dir_all(dest.as_std_path());
                SeriesOutcome::Failed
            }
        }
    }

    /// Reconciles the manifest with a previously organized `raw/` tree:
    /// every (patient, imaging-modality, folder) triple found on disk but
    /// absent from the manifest is appended as a series reference. Returns
    /// the number of appended references; the manifest is persisted when it
    /// changed.
    pub fn register_existing_downloads(&mut self) -> Result<usize, HarvestError> {
        let raw_root = self.store.raw_root();
        if !raw_root.as_std_path().is_dir() {
            return Ok(0);
        }

        let mut added = 0;
        let patients = fs::read_dir(raw_root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for patient_dir in patients.flatten() {
            let Ok(patient) = patient_dir.file_name().to_string_lossy().parse::<PatientId>() else {
                continue;
            };
            let Ok(modalities) = fs::read_dir(patient_dir.path()) else {
                continue;
            };
            for modality_dir in modalities.flatten() {
                let modality = modality_dir.file_name().to_string_lossy().to_string();
                if !IMAGING_MODALITIES.contains(&modality.as_str()) {
                    continue;
                }
                let Ok(folders) = fs::read_dir(modality_dir.path()) else {
                    continue;
                };
                for folder in folders.flatten() {
                    if !folder.path().is_dir() {
                        continue;
                    }
                    let series_uid = folder.file_name().to_string_lossy().to_string();
                    let series = ImagingFileRef::new(series_uid);
                    if self.manifest.record_series(&patient, &modality, series) {
                        added += 1;
                    }
                }
            }
        }

        if added > 0 {
            self.manifest.save(&self.store.manifest_path())?;
        }
        Ok(added)
    }
}
