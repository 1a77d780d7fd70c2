use std::fs::File;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};

use crate::domain::{CaseId, ClinicalFileRef, FileReference, PatientId};
use crate::error::HarvestError;
use crate::manifest::{ManifestEntry, normalize_value};
use crate::retry::RetryPolicy;

/// Descriptive fields requested for every file hit.
const FILE_FIELDS: [&str; 17] = [
    "access",
    "created_datetime",
    "data_category",
    "data_format",
    "data_type",
    "experimental_strategy",
    "file_name",
    "file_size",
    "file_state",
    "md5sum",
    "origin",
    "platform",
    "revision",
    "state",
    "tags",
    "type",
    "updated_datetime",
];

/// Page size requested from the files endpoint; bounded but far above any
/// realistic per-case file count.
const FILES_PAGE_SIZE: &str = "1000000";

pub trait ClinicalRegistry: Send + Sync {
    /// Fetches every open-access file for one case and buckets the hits by
    /// their `data_type` into a manifest entry fragment.
    fn fetch_case_files(
        &self,
        case: &CaseId,
        patient: &PatientId,
    ) -> Result<ManifestEntry, HarvestError>;

    /// Downloads one or more files as a single payload into the staging
    /// area. Returns the staged path, or `None` when the response carried no
    /// usable filename header.
    fn download_files(
        &self,
        file_ids: &[String],
        staging_dir: &Utf8Path,
    ) -> Result<Option<Utf8PathBuf>, HarvestError>;
}

#[derive(Clone)]
pub struct GdcHttpClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    disposition: Regex,
}

impl GdcHttpClient {
    pub fn new() -> Result<Self, HarvestError> {
        Self::with_retry(RetryPolicy::default())
    }

    pub fn with_retry(retry: RetryPolicy) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("medharvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| HarvestError::GdcHttp(err.to_string()))?;
        let disposition = Regex::new("filename=(.+)")
            .map_err(|err| HarvestError::GdcHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://api.gdc.cancer.gov/".to_string(),
            retry,
            disposition,
        })
    }

    fn case_filters(case: &CaseId) -> Value {
        json!({
            "op": "and",
            "content": [
                {
                    "op": "in",
                    "content": {"field": "cases.case_id", "value": [case.as_str()]},
                },
                {"op": "=", "content": {"field": "access", "value": ["open"]}},
            ],
        })
    }

    fn fetch_hits(&self, case: &CaseId) -> Result<Vec<Value>, HarvestError> {
        let url = format!("{}files", self.base_url);
        let filters = Self::case_filters(case).to_string();
        let fields = FILE_FIELDS.join(",");

        let envelope: Value = self.retry.run(|| {
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("filters", filters.as_str()),
                    ("fields", fields.as_str()),
                    ("format", "JSON"),
                    ("size", FILES_PAGE_SIZE),
                ])
                .send()
                .map_err(|err| HarvestError::GdcHttp(err.to_string()))?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .unwrap_or_else(|_| "GDC request failed".to_string());
                return Err(HarvestError::GdcStatus { status, message });
            }
            response
                .json()
                .map_err(|err| HarvestError::GdcHttp(err.to_string()))
        })?;

        let hits = envelope
            .get("data")
            .and_then(|data| data.get("hits"))
            .and_then(|hits| hits.as_array())
            .cloned()
            .ok_or_else(|| HarvestError::GdcHttp("malformed files envelope".to_string()))?;
        Ok(hits)
    }
}

impl ClinicalRegistry for GdcHttpClient {
    fn fetch_case_files(
        &self,
        case: &CaseId,
        patient: &PatientId,
    ) -> Result<ManifestEntry, HarvestError> {
        let hits = self
            .fetch_hits(case)
            .map_err(|err| HarvestError::RegistryUnavailable {
                registry: "GDC".to_string(),
                case: case.to_string(),
                message: err.to_string(),
            })?;

        let mut entry = ManifestEntry::new(patient.clone());
        entry.gdc_case_id = Some(case.to_string());
        for hit in hits {
            let hit = normalize_value(hit);
            let Some(data_type) = hit
                .get("data_type")
                .and_then(|value| value.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            match serde_json::from_value::<ClinicalFileRef>(hit) {
                Ok(reference) => {
                    entry.push_reference(&data_type, FileReference::Clinical(reference));
                }
                Err(err) => {
                    tracing::debug!(case = %case, %err, "skipping file hit without routing fields");
                }
            }
        }
        Ok(entry)
    }

    fn download_files(
        &self,
        file_ids: &[String],
        staging_dir: &Utf8Path,
    ) -> Result<Option<Utf8PathBuf>, HarvestError> {
        if file_ids.is_empty() {
            return Ok(None);
        }
        let url = format!("{}data", self.base_url);
        let body = json!({"ids": file_ids});

        self.retry
            .run(|| {
                let mut response = self
                    .client
                    .post(&url)
                    .json(&body)
                    .send()
                    .map_err(|err| HarvestError::GdcHttp(err.to_string()))?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let message = response
                        .text()
                        .unwrap_or_else(|_| "GDC download failed".to_string());
                    return Err(HarvestError::GdcStatus { status, message });
                }

                let file_name = response
                    .headers()
                    .get(CONTENT_DISPOSITION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| self.disposition.captures(value))
                    .and_then(|captures| captures.get(1))
                    .map(|capture| capture.as_str().trim_matches('"').to_string());
                let Some(file_name) = file_name else {
                    return Ok(None);
                };

                let destination = staging_dir.join(&file_name);
                let mut file = File::create(destination.as_std_path())
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                std::io::copy(&mut response, &mut file)
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                Ok(Some(destination))
            })
            .map_err(|err| HarvestError::DownloadFailed {
                registry: "GDC".to_string(),
                item: file_ids.join(","),
                message: err.to_string(),
            })
    }
}
