use std::fs::{self, File};
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};

use crate::domain::{ImagingFileRef, PatientId};
use crate::error::HarvestError;
use crate::retry::RetryPolicy;

/// Hard ceiling on the re-requested page size; a registry reporting more
/// rows than this cannot be drained and fails with `IncompletePage`.
pub const PAGE_SIZE_CEILING: u64 = 1_000_000;

/// Raw payloads handed back to the aggregator for bucketing. The two-step
/// preview keeps the storage manifest and the descriptive metadata unjoined;
/// the aggregator merges them against the manifest document, not here.
#[derive(Debug, Clone)]
pub enum ImagingPayload {
    Preview {
        manifest: Value,
        metadata: Option<Value>,
    },
    SeriesList(Vec<Value>),
}

pub trait ImagingRegistry: Send + Sync {
    fn registry_name(&self) -> &'static str;

    /// Fetches every series the registry knows for one patient. `None` means
    /// the registry has nothing for this patient, which is not an error.
    fn fetch_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Option<ImagingPayload>, HarvestError>;

    /// Whether this registry can serve the given series reference.
    fn can_download(&self, series: &ImagingFileRef) -> bool;

    /// Downloads one series into `dest_dir` (created by the caller).
    fn download_series(
        &self,
        series: &ImagingFileRef,
        dest_dir: &Utf8Path,
    ) -> Result<(), HarvestError>;
}

/// Drives `call` until the registry reports a complete page. `call` receives
/// the page-size override to request (None on the first attempt) and returns
/// the raw response body. Payloads without a `manifest` envelope are returned
/// as-is. An explicit loop bounded by the page-size ceiling and by a
/// no-progress check, per the redesign of the legacy self-recursion.
pub fn fetch_complete_page<F>(
    registry: &str,
    case: &str,
    mut call: F,
) -> Result<Value, HarvestError>
where
    F: FnMut(Option<u64>) -> Result<Value, HarvestError>,
{
    let mut page_size: Option<u64> = None;
    loop {
        let payload = call(page_size)?;
        let Some(envelope) = payload.get("manifest") else {
            return Ok(payload);
        };
        let total = envelope
            .get("totalFound")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let rows = envelope
            .get("rowsReturned")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if total <= rows {
            return Ok(payload);
        }
        let enlarged = total + 10;
        if enlarged > PAGE_SIZE_CEILING || Some(enlarged) == page_size {
            return Err(HarvestError::IncompletePage {
                registry: registry.to_string(),
                case: case.to_string(),
                total,
                ceiling: PAGE_SIZE_CEILING,
            });
        }
        page_size = Some(enlarged);
    }
}

#[derive(Clone)]
pub struct IdcHttpClient {
    client: Client,
    base_url: String,
    storage_base: String,
    retry: RetryPolicy,
}

impl IdcHttpClient {
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
            .map_err(|err| HarvestError::IdcHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://api.imaging.datacommons.cancer.gov/v2".to_string(),
            storage_base: "https://storage.googleapis.com".to_string(),
            retry,
        })
    }

    fn cohort_body(patient: &PatientId, fields: &[&str]) -> Value {
        json!({
            "cohort_def": {
                "name": "medharvest_temp",
                "description": "Temporary cohort for patient data",
                "filters": {"PatientID": [patient.as_str()]},
            },
            "fields": fields,
        })
    }

    fn post_json(&self, url: &str, body: &Value, page_size: Option<u64>) -> Result<Value, HarvestError> {
        self.retry.run(|| {
            let mut request = self.client.post(url).query(&[("sql", "false")]).json(body);
            if let Some(size) = page_size {
                request = request.query(&[("page_size", size.to_string())]);
            }
            let response = request
                .send()
                .map_err(|err| HarvestError::IdcHttp(err.to_string()))?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .unwrap_or_else(|_| "IDC request failed".to_string());
                return Err(HarvestError::IdcStatus { status, message });
            }
            response
                .json()
                .map_err(|err| HarvestError::IdcHttp(err.to_string()))
        })
    }

    fn fetch_manifest_preview(&self, patient: &PatientId) -> Result<Value, HarvestError> {
        let url = format!("{}/cohorts/manifest/preview", self.base_url);
        let body = Self::cohort_body(
            patient,
            &[
                "collection_id",
                "PatientID",
                "Modality",
                "StudyInstanceUID",
                "SeriesInstanceUID",
                "SOPInstanceUID",
                "gcs_url",
                "crdc_series_uuid",
            ],
        );
        fetch_complete_page("IDC", patient.as_str(), |page_size| {
            self.post_json(&url, &body, page_size)
        })
    }

    fn fetch_query_preview(&self, patient: &PatientId) -> Option<Value> {
        let url = format!("{}/cohorts/query/preview", self.base_url);
        let body = json!({
            "cohort_def": {
                "name": "medharvest_temp",
                "description": "Temporary cohort",
                "filters": {"PatientID": [patient.as_str()]},
            },
            "queryFields": {
                "fields": [
                    "PatientID",
                    "SeriesInstanceUID",
                    "Modality",
                    "collection_id",
                    "StudyDescription",
                    "SeriesDescription",
                ],
            },
        });
        match self.post_json(&url, &body, None) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(patient = %patient, %err, "IDC metadata query failed; continuing with manifest only");
                None
            }
        }
    }

    /// Splits a `gs://bucket/object` URL into the public object URL and the
    /// object's final path segment.
    fn object_url(&self, gcs_url: &str) -> Result<(String, String), HarvestError> {
        let rest = gcs_url
            .strip_prefix("gs://")
            .ok_or_else(|| HarvestError::IdcHttp(format!("unsupported storage url: {gcs_url}")))?;
        let (bucket, object) = rest
            .split_once('/')
            .ok_or_else(|| HarvestError::IdcHttp(format!("unsupported storage url: {gcs_url}")))?;
        let file_name = object
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| HarvestError::IdcHttp(format!("unsupported storage url: {gcs_url}")))?;
        Ok((
            format!("{}/{}/{}", self.storage_base, bucket, object),
            file_name.to_string(),
        ))
    }
}

impl ImagingRegistry for IdcHttpClient {
    fn registry_name(&self) -> &'static str {
        "IDC"
    }

    fn fetch_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Option<ImagingPayload>, HarvestError> {
        let manifest = self.fetch_manifest_preview(patient).map_err(|err| match err {
            incomplete @ HarvestError::IncompletePage { .. } => incomplete,
            other => HarvestError::RegistryUnavailable {
                registry: "IDC".to_string(),
                case: patient.to_string(),
                message: other.to_string(),
            },
        })?;

        let has_rows = manifest
            .get("manifest")
            .and_then(|envelope| envelope.get("manifest_data"))
            .and_then(Value::as_array)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false);
        if !has_rows {
            return Ok(None);
        }

        let metadata = self.fetch_query_preview(patient);
        Ok(Some(ImagingPayload::Preview { manifest, metadata }))
    }

    fn can_download(&self, series: &ImagingFileRef) -> bool {
        series.gcs_url.is_some()
    }

    fn download_series(
        &self,
        series: &ImagingFileRef,
        dest_dir: &Utf8Path,
    ) -> Result<(), HarvestError> {
        let Some(gcs_url) = series.gcs_url.as_deref() else {
            return Err(HarvestError::DownloadFailed {
                registry: "IDC".to_string(),
                item: series.series_instance_uid.clone(),
                message: "series reference carries no storage url".to_string(),
            });
        };
        let (url, file_name) = self.object_url(gcs_url)?;

        fs::create_dir_all(dest_dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let destination = dest_dir.join(&file_name);

        self.retry
            .run(|| {
                let mut response = self
                    .client
                    .get(&url)
                    .send()
                    .map_err(|err| HarvestError::IdcHttp(err.to_string()))?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let message = response
                        .text()
                        .unwrap_or_else(|_| "IDC download failed".to_string());
                    return Err(HarvestError::IdcStatus { status, message });
                }
                let mut file = File::create(destination.as_std_path())
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                std::io::copy(&mut response, &mut file)
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                Ok(())
            })
            .map_err(|err| HarvestError::DownloadFailed {
                registry: "IDC".to_string(),
                item: series.series_instance_uid.clone(),
                message: err.to_string(),
            })
    }
}
