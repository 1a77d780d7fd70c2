use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid case identifier: {0}")]
    InvalidCaseId(String),

    #[error("invalid patient identifier: {0}")]
    InvalidPatientId(String),

    #[error("either a query or a cohort file must be provided")]
    InvalidCohortSpec,

    #[error("failed to read cohort file at {0}")]
    CohortRead(PathBuf),

    #[error("failed to parse cohort file: {0}")]
    CohortParse(String),

    #[error("missing config file medharvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no manifest found at {0}; run manifest generation first")]
    ManifestMissing(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("{registry} unavailable for case {case}: {message}")]
    RegistryUnavailable {
        registry: String,
        case: String,
        message: String,
    },

    #[error("{registry} reported {total} results for {case} but the page-size ceiling is {ceiling}")]
    IncompletePage {
        registry: String,
        case: String,
        total: u64,
        ceiling: u64,
    },

    #[error("download from {registry} failed for {item}: {message}")]
    DownloadFailed {
        registry: String,
        item: String,
        message: String,
    },

    #[error("failed to extract archive {archive}: {message}")]
    ArchiveCorrupt { archive: String, message: String },

    #[error("GDC request failed: {0}")]
    GdcHttp(String),

    #[error("GDC returned status {status}: {message}")]
    GdcStatus { status: u16, message: String },

    #[error("IDC request failed: {0}")]
    IdcHttp(String),

    #[error("IDC returned status {status}: {message}")]
    IdcStatus { status: u16, message: String },

    #[error("TCIA request failed: {0}")]
    TciaHttp(String),

    #[error("TCIA returned status {status}: {message}")]
    TciaStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
