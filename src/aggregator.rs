use std::collections::HashMap;

use serde_json::Value;

use crate::domain::{CaseId, Cohort, FileReference, IMAGING_MODALITIES, ImagingFileRef, PatientId};
use crate::error::HarvestError;
use crate::gdc::ClinicalRegistry;
use crate::idc::{ImagingPayload, ImagingRegistry};
use crate::manifest::{Manifest, ManifestEntry};
use crate::pool::run_parallel;
use crate::progress::{Phase, PhaseProgress, ProgressSink};
use crate::store::DataStore;

pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationReport {
    pub cases_total: usize,
    pub cases_failed: usize,
    pub imaging_patients: usize,
    pub imaging_failed: usize,
    pub manifest_entries: usize,
}

/// Fans registry fetches out over a cohort and merges the results into one
/// persisted manifest.
///
/// Phase 1 fetches clinical file metadata per case and overwrites the
/// manifest with the collected entries. Phase 2 fetches imaging series per
/// distinct submitter identifier, per registry, into an in-memory structured
/// manifest keyed by `PatientID`. Phase 3 re-reads the phase-1 document and
/// merges the structured entries into it, replacing buckets per modality key
/// and appending patients with no clinical entry. Single-case failures are
/// logged and counted, never fatal for the batch.
pub struct ManifestAggregator<C: ClinicalRegistry> {
    cohort: Cohort,
    store: DataStore,
    clinical: C,
    imaging: Vec<Box<dyn ImagingRegistry>>,
    workers: usize,
}

impl<C: ClinicalRegistry> ManifestAggregator<C> {
    pub fn new(
        cohort: Cohort,
        store: DataStore,
        clinical: C,
        imaging: Vec<Box<dyn ImagingRegistry>>,
    ) -> Self {
        Self {
            cohort,
            store,
            clinical,
            imaging,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn generate_manifest(
        &self,
        sink: &dyn ProgressSink,
    ) -> Result<AggregationReport, HarvestError> {
        self.store.ensure_root()?;
        let manifest_path = self.store.manifest_path();
        let mut report = AggregationReport::default();

        // Phase 1: clinical metadata, one fetch per case, overwrite on save.
        let pairs: Vec<(CaseId, PatientId)> = self
            .cohort
            .iter()
            .map(|(case, submitters)| (case.clone(), submitters[0].clone()))
            .collect();
        report.cases_total = pairs.len();

        let progress = PhaseProgress::new(Phase::Clinical, pairs.len(), sink);
        let fetched = run_parallel(self.workers, pairs, |(case, patient)| {
            let outcome = self.clinical.fetch_case_files(&case, &patient);
            progress.tick();
            (case, outcome)
        });

        let mut entries = Vec::new();
        for (case, outcome) in fetched {
            match outcome {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(case = %case, %err, "clinical fetch failed; case omitted from manifest");
                    report.cases_failed += 1;
                }
            }
        }
        Manifest::new(entries).save(&manifest_path)?;

        // Phase 2: imaging series per distinct submitter, per registry.
        let submitters = self.cohort.distinct_submitters();
        report.imaging_patients = submitters.len();
        let mut structured = StructuredManifest::default();

        for registry in &self.imaging {
            let progress = PhaseProgress::new(Phase::Imaging, submitters.len(), sink);
            let fetched = run_parallel(self.workers, submitters.clone(), |patient| {
                let outcome = registry.fetch_for_patient(&patient);
                progress.tick();
                (patient, outcome)
            });
            for (patient, outcome) in fetched {
                match outcome {
                    Ok(Some(payload)) => structured.absorb(registry.registry_name(), payload),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(
                            registry = registry.registry_name(),
                            patient = %patient,
                            %err,
                            "imaging fetch failed; patient omitted from this registry"
                        );
                        report.imaging_failed += 1;
                    }
                }
            }
        }

        // Phase 3: sequential merge into the phase-1 document.
        let progress = PhaseProgress::new(Phase::Merging, 1, sink);
        let mut manifest = Manifest::load(&manifest_path)?;
        manifest.merge_structured(structured.into_entries());
        manifest.save(&manifest_path)?;
        progress.tick();

        report.manifest_entries = manifest.len();
        Ok(report)
    }
}

/// In-memory manifest fragment built during phase 2, keyed by `PatientID`.
/// Entries for an already-seen patient extend the modality lists; new
/// patients are appended.
#[derive(Default)]
struct StructuredManifest {
    entries: Vec<ManifestEntry>,
}

impl StructuredManifest {
    fn add(&mut self, patient: PatientId, modality: &str, series: ImagingFileRef) {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.patient_id == patient);
        let entry = match position {
            Some(index) => &mut self.entries[index],
            None => {
                self.entries.push(ManifestEntry::new(patient));
                self.entries.last_mut().unwrap()
            }
        };
        entry.push_reference(modality, FileReference::Imaging(series));
    }

    fn absorb(&mut self, registry: &str, payload: ImagingPayload) {
        match payload {
            ImagingPayload::Preview { manifest, metadata } => {
                self.absorb_preview(registry, &manifest, metadata.as_ref())
            }
            ImagingPayload::SeriesList(items) => self.absorb_series_list(registry, &items),
        }
    }

    /// Storage rows bucketed by their declared modality; rows missing one
    /// fall back to the descriptive metadata payload (the merge the
    /// preview-style registries defer to us).
    fn absorb_preview(&mut self, registry: &str, manifest: &Value, metadata: Option<&Value>) {
        let modality_by_series = metadata.map(series_modalities).unwrap_or_default();
        let rows = manifest
            .get("manifest")
            .and_then(|envelope| envelope.get("manifest_data"))
            .and_then(Value::as_array);
        let Some(rows) = rows else {
            return;
        };

        for row in rows {
            let Some(series_uid) = string_field(row, "SeriesInstanceUID") else {
                continue;
            };
            let Some(patient) = patient_field(row) else {
                continue;
            };
            let modality = string_field(row, "Modality")
                .or_else(|| modality_by_series.get(&series_uid).cloned());
            let Some(modality) = modality else {
                continue;
            };
            if !IMAGING_MODALITIES.contains(&modality.as_str()) {
                continue;
            }

            let series = ImagingFileRef {
                series_instance_uid: series_uid,
                gcs_url: string_field(row, "gcs_url"),
                collection_id: string_field(row, "collection_id"),
                crdc_series_uuid: string_field(row, "crdc_series_uuid"),
                study_instance_uid: string_field(row, "StudyInstanceUID"),
                sop_instance_uid: string_field(row, "SOPInstanceUID"),
                source: Some(registry.to_string()),
            };
            self.add(patient, &modality, series);
        }
    }

    fn absorb_series_list(&mut self, registry: &str, items: &[Value]) {
        for item in items {
            let Some(modality) = string_field(item, "Modality") else {
                continue;
            };
            if !IMAGING_MODALITIES.contains(&modality.as_str()) {
                continue;
            }
            let Some(patient) = patient_field(item) else {
                continue;
            };
            let Some(series_uid) = string_field(item, "SeriesInstanceUID") else {
                continue;
            };

            let mut series = ImagingFileRef::new(series_uid);
            series.study_instance_uid = string_field(item, "StudyInstanceUID");
            series.source = Some(registry.to_string());
            self.add(patient, &modality, series);
        }
    }

    fn into_entries(self) -> Vec<ManifestEntry> {
        self.entries
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn patient_field(value: &Value) -> Option<PatientId> {
    string_field(value, "PatientID").and_then(|text| text.parse().ok())
}

/// Series-to-modality index extracted from a descriptive metadata payload.
fn series_modalities(metadata: &Value) -> HashMap<String, String> {
    let mut index = HashMap::new();
    let rows = metadata
        .get("query_results")
        .and_then(|results| results.get("json"))
        .and_then(Value::as_array);
    let Some(rows) = rows else {
        return index;
    };
    for row in rows {
        let (Some(series_uid), Some(modality)) = (
            string_field(row, "SeriesInstanceUID"),
            string_field(row, "Modality"),
        ) else {
            continue;
        };
        index.entry(series_uid).or_insert(modality);
    }
    index
}
