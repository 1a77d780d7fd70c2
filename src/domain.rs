use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HarvestError;

/// Imaging modality codes recognized as manifest bucket labels. Series
/// reported under any other modality are discarded during aggregation.
pub const IMAGING_MODALITIES: [&str; 22] = [
    "MG", "MR", "CT", "SEG", "RTSTRUCT", "CR", "SR", "US", "PT", "DX", "RTDOSE", "RTPLAN", "PR",
    "REG", "RWV", "NM", "KO", "FUSION", "OT", "XA", "SC", "RF",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if normalized.is_empty() {
            return Err(HarvestError::InvalidCaseId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(String);

impl PatientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PatientId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if normalized.is_empty() {
            return Err(HarvestError::InvalidPatientId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Ordered mapping from case identifier to its submitter identifiers.
/// Case identifiers are unique; insertion order is preserved.
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    cases: Vec<(CaseId, Vec<PatientId>)>,
}

impl Cohort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a case with its submitter identifiers. Returns false (and leaves
    /// the cohort unchanged) when the case identifier is already present.
    pub fn insert(&mut self, case: CaseId, submitters: Vec<PatientId>) -> bool {
        if submitters.is_empty() || self.cases.iter().any(|(existing, _)| *existing == case) {
            return false;
        }
        self.cases.push((case, submitters));
        true
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CaseId, &[PatientId])> {
        self.cases
            .iter()
            .map(|(case, submitters)| (case, submitters.as_slice()))
    }

    /// Submitter identifiers across the whole cohort, deduplicated, in first
    /// appearance order.
    pub fn distinct_submitters(&self) -> Vec<PatientId> {
        let mut seen = Vec::new();
        for (_, submitters) in &self.cases {
            for submitter in submitters {
                if !seen.contains(submitter) {
                    seen.push(submitter.clone());
                }
            }
        }
        seen
    }
}

/// Include/exclude filtering over modality bucket labels. An empty include
/// list admits every bucket; exclude wins when a label appears in both.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl FilterSet {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn selects(&self, label: &str) -> bool {
        if self.exclude.iter().any(|entry| entry == label) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|entry| entry == label)
    }
}

/// One remote file, tagged by the registry family it came from. Imaging is
/// tried first during deserialization because the clinical shape carries a
/// catch-all field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileReference {
    Imaging(ImagingFileRef),
    Clinical(ClinicalFileRef),
}

impl FileReference {
    /// The identifier used as the routing directory segment under `raw/`.
    pub fn identifier(&self) -> &str {
        match self {
            FileReference::Imaging(series) => &series.series_instance_uid,
            FileReference::Clinical(file) => &file.id,
        }
    }

    pub fn file_size(&self) -> u64 {
        match self {
            FileReference::Imaging(_) => 0,
            FileReference::Clinical(file) => file.file_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalFileRef {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingFileRef {
    #[serde(rename = "SeriesInstanceUID")]
    pub series_instance_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crdc_series_uuid: Option<String>,
    #[serde(
        rename = "StudyInstanceUID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub study_instance_uid: Option<String>,
    #[serde(
        rename = "SOPInstanceUID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sop_instance_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ImagingFileRef {
    pub fn new(series_instance_uid: String) -> Self {
        Self {
            series_instance_uid,
            gcs_url: None,
            collection_id: None,
            crdc_series_uuid: None,
            study_instance_uid: None,
            sop_instance_uid: None,
            source: None,
        }
    }
}
