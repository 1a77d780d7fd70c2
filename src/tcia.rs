use std::fs;
use std::io::Cursor;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::archive::extract_zip_reader;
use crate::domain::{ImagingFileRef, PatientId};
use crate::error::HarvestError;
use crate::idc::{ImagingPayload, ImagingRegistry};
use crate::retry::RetryPolicy;

/// Legacy imaging registry: one query endpoint returning a flat series list
/// and one download endpoint returning a series as a zip payload.
#[derive(Clone)]
pub struct TciaHttpClient {
    client: Client,
    query_base: String,
    download_base: String,
    retry: RetryPolicy,
}

impl TciaHttpClient {
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
            .map_err(|err| HarvestError::TciaHttp(err.to_string()))?;
        Ok(Self {
            client,
            query_base: "https://services.cancerimagingarchive.net/services/v4/TCIA/query"
                .to_string(),
            download_base: "https://services.cancerimagingarchive.net/nbia-api/services/v1"
                .to_string(),
            retry,
        })
    }

    fn get_series(&self, patient: &PatientId) -> Result<Vec<Value>, HarvestError> {
        let url = format!("{}/getSeries", self.query_base);
        let series: Value = self.retry.run(|| {
            let response = self
                .client
                .get(&url)
                .query(&[("PatientID", patient.as_str()), ("format", "json")])
                .send()
                .map_err(|err| HarvestError::TciaHttp(err.to_string()))?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .unwrap_or_else(|_| "TCIA request failed".to_string());
                return Err(HarvestError::TciaStatus { status, message });
            }
            response
                .json()
                .map_err(|err| HarvestError::TciaHttp(err.to_string()))
        })?;

        match series {
            Value::Array(items) => Ok(items),
            other => Err(HarvestError::TciaHttp(format!(
                "expected a series array, got {other}"
            ))),
        }
    }
}

impl ImagingRegistry for TciaHttpClient {
    fn registry_name(&self) -> &'static str {
        "TCIA"
    }

    fn fetch_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Option<ImagingPayload>, HarvestError> {
        let series = self
            .get_series(patient)
            .map_err(|err| HarvestError::RegistryUnavailable {
                registry: "TCIA".to_string(),
                case: patient.to_string(),
                message: err.to_string(),
            })?;
        if series.is_empty() {
            return Ok(None);
        }
        Ok(Some(ImagingPayload::SeriesList(series)))
    }

    fn can_download(&self, _series: &ImagingFileRef) -> bool {
        true
    }

    fn download_series(
        &self,
        series: &ImagingFileRef,
        dest_dir: &Utf8Path,
    ) -> Result<(), HarvestError> {
        let url = format!("{}/getImage", self.download_base);

        let payload = self
            .retry
            .run(|| {
                let response = self
                    .client
                    .get(&url)
                    .query(&[
                        ("NewFileNames", "Yes"),
                        ("SeriesInstanceUID", series.series_instance_uid.as_str()),
                    ])
                    .send()
                    .map_err(|err| HarvestError::TciaHttp(err.to_string()))?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let message = response
                        .text()
                        .unwrap_or_else(|_| "TCIA download failed".to_string());
                    return Err(HarvestError::TciaStatus { status, message });
                }
                response
                    .bytes()
                    .map_err(|err| HarvestError::TciaHttp(err.to_string()))
            })
            .map_err(|err| HarvestError::DownloadFailed {
                registry: "TCIA".to_string(),
                item: series.series_instance_uid.clone(),
                message: err.to_string(),
            })?;

        fs::create_dir_all(dest_dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        extract_zip_reader(Cursor::new(payload), dest_dir.as_std_path()).map_err(|err| {
            HarvestError::DownloadFailed {
                registry: "TCIA".to_string(),
                item: series.series_instance_uid.clone(),
                message: err.to_string(),
            }
        })
    }
}
