use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::domain::{FileReference, ImagingFileRef, PatientId};
use crate::error::HarvestError;
use crate::store::DataStore;

/// One per-patient record. Modality buckets are flattened into the entry
/// object so the persisted JSON is `{"PatientID": ..., "gdc_case_id": ...,
/// "<modality>": [...], ...}` — the interchange shape consumed by the
/// acquisition side and by prior manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "PatientID")]
    pub patient_id: PatientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdc_case_id: Option<String>,
    #[serde(flatten)]
    pub buckets: BTreeMap<String, Vec<FileReference>>,
}

impl ManifestEntry {
    pub fn new(patient_id: PatientId) -> Self {
        Self {
            patient_id,
            gdc_case_id: None,
            buckets: BTreeMap::new(),
        }
    }

    pub fn push_reference(&mut self, bucket: &str, reference: FileReference) {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .push(reference);
    }

    pub fn bucket(&self, label: &str) -> Option<&[FileReference]> {
        self.buckets.get(label).map(Vec::as_slice)
    }

    /// Replaces every modality bucket present in `other` wholesale
    /// (last-write-wins per modality key, not per file).
    pub fn replace_buckets_from(&mut self, other: ManifestEntry) {
        if other.gdc_case_id.is_some() {
            self.gdc_case_id = other.gdc_case_id;
        }
        for (label, references) in other.buckets {
            self.buckets.insert(label, references);
        }
    }
}

/// The persisted manifest: an ordered list of per-patient entries with at
/// most one entry per `PatientID`. All writes are whole-file
/// rewrite-on-save; phases never write it concurrently.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Utf8Path) -> Result<Self, HarvestError> {
        if !path.as_std_path().exists() {
            return Err(HarvestError::ManifestMissing(
                path.as_std_path().to_path_buf(),
            ));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ManifestParse(err.to_string()))?;
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), HarvestError> {
        let content = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| HarvestError::ManifestParse(err.to_string()))?;
        DataStore::write_bytes_atomic(path, &content)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, patient: &PatientId) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|entry| entry.patient_id == *patient)
    }

    fn entry_mut_or_append(&mut self, patient: &PatientId) -> &mut ManifestEntry {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.patient_id == *patient);
        match position {
            Some(index) => &mut self.entries[index],
            None => {
                self.entries.push(ManifestEntry::new(patient.clone()));
                self.entries.last_mut().unwrap()
            }
        }
    }

    /// Phase-3 merge: each structured entry replaces its modality buckets in
    /// the matching manifest entry; unmatched patients are appended whole.
    pub fn merge_structured(&mut self, structured: Vec<ManifestEntry>) {
        for incoming in structured {
            let position = self
                .entries
                .iter()
                .position(|entry| entry.patient_id == incoming.patient_id);
            match position {
                Some(index) => self.entries[index].replace_buckets_from(incoming),
                None => self.entries.push(incoming),
            }
        }
    }

    pub fn contains_reference(&self, patient: &PatientId, bucket: &str, identifier: &str) -> bool {
        self.entry(patient)
            .and_then(|entry| entry.bucket(bucket))
            .map(|references| {
                references
                    .iter()
                    .any(|reference| reference.identifier() == identifier)
            })
            .unwrap_or(false)
    }

    /// Find-or-append registration of a downloaded series. Returns true when
    /// the manifest changed.
    pub fn record_series(
        &mut self,
        patient: &PatientId,
        modality: &str,
        series: ImagingFileRef,
    ) -> bool {
        if self.contains_reference(patient, modality, &series.series_instance_uid) {
            return false;
        }
        self.entry_mut_or_append(patient)
            .push_reference(modality, FileReference::Imaging(series));
        true
    }

    /// Read-only projection: per-modality file count and total byte size,
    /// sorted descending by total size.
    pub fn stats(&self) -> Vec<ModalityStats> {
        let mut by_modality: BTreeMap<String, (usize, u64)> = BTreeMap::new();
        for entry in &self.entries {
            for (label, references) in &entry.buckets {
                let slot = by_modality.entry(label.clone()).or_default();
                slot.0 += references.len();
                slot.1 += references
                    .iter()
                    .map(FileReference::file_size)
                    .sum::<u64>();
            }
        }
        let mut stats: Vec<ModalityStats> = by_modality
            .into_iter()
            .map(|(modality, (file_count, total_size))| ModalityStats {
                modality,
                file_count,
                total_size,
            })
            .collect();
        stats.sort_by(|a, b| b.total_size.cmp(&a.total_size));
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModalityStats {
    pub modality: String,
    pub file_count: usize,
    pub total_size: u64,
}

/// Normalizes registry JSON so whole-number floats become integers before
/// entries are persisted; registries are inconsistent about numeric types
/// for sizes and counts.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, normalize_value(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Number(number) => match number.as_f64() {
            Some(float) if number.is_f64() && float.fract() == 0.0 && float.is_finite() => {
                if float >= 0.0 && float <= u64::MAX as f64 {
                    Value::Number(Number::from(float as u64))
                } else if float >= i64::MIN as f64 && float <= i64::MAX as f64 {
                    Value::Number(Number::from(float as i64))
                } else {
                    Value::Number(number)
                }
            }
            _ => Value::Number(number),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::ClinicalFileRef;

    fn clinical(id: &str, name: &str, size: u64) -> FileReference {
        FileReference::Clinical(ClinicalFileRef {
            id: id.to_string(),
            file_name: name.to_string(),
            file_size: size,
            data_type: None,
            data_category: None,
            md5sum: None,
            extra: serde_json::Map::new(),
        })
    }

    #[test]
    fn entry_serializes_with_flattened_buckets() {
        let mut entry = ManifestEntry::new("TCGA-01".parse().unwrap());
        entry.gdc_case_id = Some("case-1".to_string());
        entry.push_reference("Aligned Reads", clinical("uuid-1", "reads.bam", 7));

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["PatientID"], "TCGA-01");
        assert_eq!(value["gdc_case_id"], "case-1");
        assert_eq!(value["Aligned Reads"][0]["file_name"], "reads.bam");

        let parsed: ManifestEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn merge_replaces_buckets_by_modality() {
        let mut entry = ManifestEntry::new("TCGA-01".parse().unwrap());
        entry.push_reference("CT", clinical("old", "old.bin", 1));
        entry.push_reference("MR", clinical("kept", "kept.bin", 1));
        let mut manifest = Manifest::new(vec![entry]);

        let mut incoming = ManifestEntry::new("TCGA-01".parse().unwrap());
        incoming.push_reference("CT", clinical("new", "new.bin", 2));
        let mut fresh = ManifestEntry::new("TCGA-02".parse().unwrap());
        fresh.push_reference("CT", clinical("other", "other.bin", 3));
        manifest.merge_structured(vec![incoming, fresh]);

        assert_eq!(manifest.len(), 2);
        let first = manifest.entry(&"TCGA-01".parse().unwrap()).unwrap();
        assert_eq!(first.bucket("CT").unwrap().len(), 1);
        assert_eq!(first.bucket("CT").unwrap()[0].identifier(), "new");
        assert_eq!(first.bucket("MR").unwrap()[0].identifier(), "kept");
    }

    #[test]
    fn record_series_is_idempotent() {
        let mut manifest = Manifest::default();
        let patient: PatientId = "TCGA-01".parse().unwrap();
        let series = ImagingFileRef::new("1.2.3".to_string());
        assert!(manifest.record_series(&patient, "CT", series.clone()));
        assert!(!manifest.record_series(&patient, "CT", series));
        assert_eq!(
            manifest
                .entry(&patient)
                .unwrap()
                .bucket("CT")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn stats_sorted_descending_by_total_size() {
        let mut entry = ManifestEntry::new("TCGA-01".parse().unwrap());
        entry.push_reference("A", clinical("a1", "a1.bin", 1024));
        entry.push_reference("A", clinical("a2", "a2.bin", 2048));
        entry.push_reference("B", clinical("b1", "b1.bin", 100));
        let manifest = Manifest::new(vec![entry]);

        let stats = manifest.stats();
        assert_eq!(
            stats,
            vec![
                ModalityStats {
                    modality: "A".to_string(),
                    file_count: 2,
                    total_size: 3072,
                },
                ModalityStats {
                    modality: "B".to_string(),
                    file_count: 1,
                    total_size: 100,
                },
            ]
        );
    }

    #[test]
    fn normalize_turns_whole_floats_into_integers() {
        let value = json!({"file_size": 2048.0, "nested": [{"count": 3.0}], "ratio": 0.5});
        let normalized = normalize_value(value);
        assert_eq!(normalized["file_size"], json!(2048));
        assert_eq!(normalized["nested"][0]["count"], json!(3));
        assert_eq!(normalized["ratio"], json!(0.5));
    }

    #[test]
    fn load_missing_manifest_fails() {
        let temp = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("manifest.json")).unwrap();
        let err = Manifest::load(&path).unwrap_err();
        assert!(matches!(err, HarvestError::ManifestMissing(_)));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("manifest.json")).unwrap();

        let mut entry = ManifestEntry::new("TCGA-01".parse().unwrap());
        entry.push_reference("CT", clinical("uuid", "scan.bin", 9));
        let manifest = Manifest::new(vec![entry]);
        manifest.save(&path).unwrap();

        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains_reference(&"TCGA-01".parse().unwrap(), "CT", "uuid"));
    }
}
