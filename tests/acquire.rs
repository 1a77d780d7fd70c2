use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use medharvest::acquire::FileAcquirer;
use medharvest::domain::{
    CaseId, ClinicalFileRef, FileReference, FilterSet, ImagingFileRef, PatientId,
};
use medharvest::error::HarvestError;
use medharvest::gdc::ClinicalRegistry;
use medharvest::idc::{ImagingPayload, ImagingRegistry};
use medharvest::manifest::{Manifest, ManifestEntry};
use medharvest::progress::NullSink;
use medharvest::store::DataStore;

/// Serves file ids from an in-memory table, writing each file into staging
/// under its manifest file name.
struct MockClinical {
    payloads: HashMap<String, (String, Vec<u8>)>,
    calls: Arc<Mutex<usize>>,
    drop_filename_header: bool,
}

impl ClinicalRegistry for MockClinical {
    fn fetch_case_files(
        &self,
        _case: &CaseId,
        patient: &PatientId,
    ) -> Result<ManifestEntry, HarvestError> {
        Ok(ManifestEntry::new(patient.clone()))
    }

    fn download_files(
        &self,
        file_ids: &[String],
        staging_dir: &Utf8Path,
    ) -> Result<Option<Utf8PathBuf>, HarvestError> {
        *self.calls.lock().unwrap() += 1;
        if self.drop_filename_header {
            return Ok(None);
        }
        let mut last = None;
        for id in file_ids {
            let Some((name, bytes)) = self.payloads.get(id) else {
                return Err(HarvestError::DownloadFailed {
                    registry: "GDC".to_string(),
                    item: id.clone(),
                    message: "unknown file id".to_string(),
                });
            };
            let path = staging_dir.join(name);
            fs::write(path.as_std_path(), bytes).unwrap();
            last = Some(path);
        }
        Ok(last)
    }
}

struct MockImaging {
    calls: Arc<Mutex<usize>>,
}

impl ImagingRegistry for MockImaging {
    fn registry_name(&self) -> &'static str {
        "IDC"
    }

    fn fetch_for_patient(
        &self,
        _patient: &PatientId,
    ) -> Result<Option<ImagingPayload>, HarvestError> {
        Ok(None)
    }

    fn can_download(&self, _series: &ImagingFileRef) -> bool {
        true
    }

    fn download_series(
        &self,
        series: &ImagingFileRef,
        dest_dir: &Utf8Path,
    ) -> Result<(), HarvestError> {
        *self.calls.lock().unwrap() += 1;
        fs::create_dir_all(dest_dir.as_std_path()).unwrap();
        fs::write(
            dest_dir
                .join(format!("{}.dcm", series.series_instance_uid))
                .as_std_path(),
            b"dicom bytes",
        )
        .unwrap();
        Ok(())
    }
}

fn sandbox() -> (tempfile::TempDir, DataStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, DataStore::new(root))
}

fn clinical_ref(id: &str, name: &str) -> FileReference {
    FileReference::Clinical(ClinicalFileRef {
        id: id.to_string(),
        file_name: name.to_string(),
        file_size: 100,
        data_type: Some("Aligned Reads".to_string()),
        data_category: None,
        md5sum: None,
        extra: serde_json::Map::new(),
    })
}

fn imaging_ref(uid: &str) -> FileReference {
    let mut series = ImagingFileRef::new(uid.to_string());
    series.source = Some("IDC".to_string());
    FileReference::Imaging(series)
}

fn write_manifest(store: &DataStore) {
    let mut entry = ManifestEntry::new("TCGA-01".parse().unwrap());
    entry.push_reference("Aligned Reads", clinical_ref("uuid-1", "reads.bam"));
    entry.push_reference("CT", imaging_ref("1.2.3"));
    entry.push_reference("MR", imaging_ref("9.9.9"));
    Manifest::new(vec![entry])
        .save(&store.manifest_path())
        .unwrap();
}

fn mock_clients(
    drop_filename_header: bool,
) -> (MockClinical, Vec<Box<dyn ImagingRegistry>>, Arc<Mutex<usize>>, Arc<Mutex<usize>>) {
    let clinical_calls = Arc::new(Mutex::new(0));
    let imaging_calls = Arc::new(Mutex::new(0));
    let clinical = MockClinical {
        payloads: HashMap::from([(
            "uuid-1".to_string(),
            ("reads.bam".to_string(), b"bam bytes".to_vec()),
        )]),
        calls: clinical_calls.clone(),
        drop_filename_header,
    };
    let imaging: Vec<Box<dyn ImagingRegistry>> = vec![Box::new(MockImaging {
        calls: imaging_calls.clone(),
    })];
    (clinical, imaging, clinical_calls, imaging_calls)
}

#[test]
fn missing_manifest_is_a_fatal_precondition() {
    let (_temp, store) = sandbox();
    let (clinical, imaging, _, _) = mock_clients(false);
    let result = FileAcquirer::new(store, &clinical, &imaging, FilterSet::default());
    assert_matches!(result.err(), Some(HarvestError::ManifestMissing(_)));
}

#[test]
fn downloads_are_skipped_once_artifacts_exist() {
    let (_temp, store) = sandbox();
    write_manifest(&store);
    let (clinical, imaging, clinical_calls, imaging_calls) = mock_clients(false);

    let mut acquirer =
        FileAcquirer::new(store.clone(), &clinical, &imaging, FilterSet::default()).unwrap();
    let first = acquirer.process_cases(&NullSink).unwrap();
    assert_eq!(first.files_downloaded, 1);
    assert_eq!(first.series_downloaded, 2);
    assert_eq!(first.failures, 0);
    assert!(store.staging_path("reads.bam").as_std_path().is_file());
    assert!(store.staging_path("1.2.3").as_std_path().is_dir());

    let calls_after_first = (*clinical_calls.lock().unwrap(), *imaging_calls.lock().unwrap());

    let mut acquirer =
        FileAcquirer::new(store.clone(), &clinical, &imaging, FilterSet::default()).unwrap();
    let second = acquirer.process_cases(&NullSink).unwrap();
    assert_eq!(second.files_downloaded, 0);
    assert_eq!(second.files_skipped, 1);
    assert_eq!(second.series_downloaded, 0);
    assert_eq!(second.series_skipped, 2);

    // No new network calls on the re-run.
    assert_eq!(
        (*clinical_calls.lock().unwrap(), *imaging_calls.lock().unwrap()),
        calls_after_first
    );
}

#[test]
fn include_and_exclude_bound_the_processed_buckets() {
    let (_temp, store) = sandbox();
    write_manifest(&store);
    let (clinical, imaging, clinical_calls, _) = mock_clients(false);

    let filters = FilterSet::new(vec!["CT".to_string()], Vec::new());
    let mut acquirer = FileAcquirer::new(store.clone(), &clinical, &imaging, filters).unwrap();
    let report = acquirer.process_cases(&NullSink).unwrap();

    assert_eq!(report.series_downloaded, 1);
    assert!(store.staging_path("1.2.3").as_std_path().is_dir());
    assert!(!store.staging_path("9.9.9").as_std_path().exists());
    assert!(!store.staging_path("reads.bam").as_std_path().exists());
    assert_eq!(*clinical_calls.lock().unwrap(), 0);
}

#[test]
fn missing_filename_header_is_logged_and_skipped() {
    let (_temp, store) = sandbox();
    write_manifest(&store);
    let (clinical, imaging, _, _) = mock_clients(true);

    let filters = FilterSet::new(vec!["Aligned Reads".to_string()], Vec::new());
    let mut acquirer = FileAcquirer::new(store.clone(), &clinical, &imaging, filters).unwrap();
    let report = acquirer.process_cases(&NullSink).unwrap();

    assert_eq!(report.files_downloaded, 0);
    assert_eq!(report.failures, 1);
    assert!(!store.staging_path("reads.bam").as_std_path().exists());
}

#[test]
fn organized_folders_are_registered_back_into_the_manifest() {
    let (_temp, store) = sandbox();
    Manifest::new(vec![ManifestEntry::new("TCGA-01".parse().unwrap())])
        .save(&store.manifest_path())
        .unwrap();
    let patient: PatientId = "TCGA-01".parse().unwrap();
    fs::create_dir_all(store.raw_dir(&patient, "CT", "1.2.3").as_std_path()).unwrap();

    let (clinical, imaging, _, _) = mock_clients(false);
    let mut acquirer =
        FileAcquirer::new(store.clone(), &clinical, &imaging, FilterSet::default()).unwrap();
    let added = acquirer.register_existing_downloads().unwrap();
    assert_eq!(added, 1);

    let manifest = Manifest::load(&store.manifest_path()).unwrap();
    assert!(manifest.contains_reference(&patient, "CT", "1.2.3"));
}
