use std::fs;

use camino::Utf8PathBuf;

use medharvest::domain::{ClinicalFileRef, FileReference, FilterSet, ImagingFileRef, PatientId};
use medharvest::manifest::{Manifest, ManifestEntry};
use medharvest::organize::FileOrganizer;
use medharvest::progress::NullSink;
use medharvest::store::DataStore;

fn sandbox() -> (tempfile::TempDir, DataStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, DataStore::new(root))
}

fn clinical_ref(id: &str, name: &str) -> FileReference {
    FileReference::Clinical(ClinicalFileRef {
        id: id.to_string(),
        file_name: name.to_string(),
        file_size: 10,
        data_type: Some("Aligned Reads".to_string()),
        data_category: None,
        md5sum: None,
        extra: serde_json::Map::new(),
    })
}

fn imaging_ref(uid: &str) -> FileReference {
    FileReference::Imaging(ImagingFileRef::new(uid.to_string()))
}

fn stage_series(store: &DataStore, uid: &str) {
    let dir = store.staging_path(uid);
    fs::create_dir_all(dir.as_std_path()).unwrap();
    fs::write(dir.join("slice-1.dcm").as_std_path(), b"dicom").unwrap();
}

#[test]
fn include_filter_moves_only_selected_modalities() {
    let (_temp, store) = sandbox();
    let patient: PatientId = "TCGA-01".parse().unwrap();

    let mut entry = ManifestEntry::new(patient.clone());
    entry.push_reference("CT", imaging_ref("1.2.3"));
    entry.push_reference("MR", imaging_ref("9.9.9"));
    Manifest::new(vec![entry])
        .save(&store.manifest_path())
        .unwrap();
    stage_series(&store, "1.2.3");
    stage_series(&store, "9.9.9");

    let filters = FilterSet::new(vec!["CT".to_string()], Vec::new());
    let organizer = FileOrganizer::new(store.clone(), filters).unwrap();
    let report = organizer.organize(&NullSink).unwrap();

    assert_eq!(report.moved, 1);
    assert!(
        store
            .raw_dir(&patient, "CT", "1.2.3")
            .join("slice-1.dcm")
            .as_std_path()
            .is_file()
    );
    // The excluded series stays in the flat staging area untouched.
    assert!(store.staging_path("9.9.9").as_std_path().is_dir());
    assert!(!store.raw_dir(&patient, "MR", "9.9.9").as_std_path().exists());
}

#[test]
fn clinical_files_and_expanded_directories_are_routed() {
    let (_temp, store) = sandbox();
    let patient: PatientId = "TCGA-01".parse().unwrap();

    let mut entry = ManifestEntry::new(patient.clone());
    entry.push_reference("Aligned Reads", clinical_ref("uuid-1", "reads.bam"));
    entry.push_reference("Aligned Reads", clinical_ref("uuid-2", "more.bam"));
    Manifest::new(vec![entry])
        .save(&store.manifest_path())
        .unwrap();

    // uuid-1 staged as a bare file, uuid-2 as an expanded tarball directory.
    fs::write(store.staging_path("reads.bam").as_std_path(), b"bam").unwrap();
    let expanded = store.staging_path("uuid-2");
    fs::create_dir_all(expanded.as_std_path()).unwrap();
    fs::write(expanded.join("more.bam").as_std_path(), b"bam2").unwrap();

    let organizer = FileOrganizer::new(store.clone(), FilterSet::default()).unwrap();
    let report = organizer.organize(&NullSink).unwrap();
    assert_eq!(report.moved, 2);

    assert!(
        store
            .raw_dir(&patient, "Aligned Reads", "uuid-1")
            .join("reads.bam")
            .as_std_path()
            .is_file()
    );
    assert!(
        store
            .raw_dir(&patient, "Aligned Reads", "uuid-2")
            .join("more.bam")
            .as_std_path()
            .is_file()
    );
    assert!(!expanded.as_std_path().exists());
}

#[test]
fn rerun_tolerates_missing_sources_and_existing_destinations() {
    let (_temp, store) = sandbox();
    let patient: PatientId = "TCGA-01".parse().unwrap();

    let mut entry = ManifestEntry::new(patient.clone());
    entry.push_reference("CT", imaging_ref("1.2.3"));
    entry.push_reference("Aligned Reads", clinical_ref("uuid-1", "reads.bam"));
    Manifest::new(vec![entry])
        .save(&store.manifest_path())
        .unwrap();
    stage_series(&store, "1.2.3");
    fs::write(store.staging_path("reads.bam").as_std_path(), b"bam").unwrap();

    let organizer = FileOrganizer::new(store.clone(), FilterSet::default()).unwrap();
    organizer.organize(&NullSink).unwrap();
    let report = organizer.organize(&NullSink).unwrap();

    assert_eq!(report.moved, 0);
    assert_eq!(report.missing, 2);
    assert!(
        store
            .raw_dir(&patient, "CT", "1.2.3")
            .join("slice-1.dcm")
            .as_std_path()
            .is_file()
    );
}

#[test]
fn cleanup_removes_archive_and_log_leftovers() {
    let (_temp, store) = sandbox();
    Manifest::new(Vec::new()).save(&store.manifest_path()).unwrap();

    fs::write(store.staging_path("bundle.tar.gz").as_std_path(), b"x").unwrap();
    fs::write(store.staging_path("bundle.tar").as_std_path(), b"x").unwrap();
    fs::write(store.staging_path("gdc.log").as_std_path(), b"x").unwrap();
    fs::write(store.staging_path("MANIFEST.txt").as_std_path(), b"x").unwrap();
    fs::write(store.staging_path("keep.bam").as_std_path(), b"x").unwrap();

    let organizer = FileOrganizer::new(store.clone(), FilterSet::default()).unwrap();
    let removed = organizer.cleanup().unwrap();

    assert_eq!(removed, 4);
    assert!(store.staging_path("keep.bam").as_std_path().is_file());
    assert!(store.manifest_path().as_std_path().is_file());
    assert!(!store.staging_path("bundle.tar.gz").as_std_path().exists());
}
