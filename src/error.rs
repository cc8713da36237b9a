use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IcosdpError {
    #[error("invalid parameters: {0}")]
    Configuration(String),

    #[error(
        "preloading the aggregated datasets requires ICOS credentials; set `email` and \
         `password` in icosdp.json or ICOSDP_EMAIL / ICOSDP_PASSWORD"
    )]
    CredentialsRequired,

    #[error("Data id {data_id:?} is not available. The store has the following data ids {available}.")]
    UnknownDataId { data_id: String, available: String },

    #[error("Data type must be one of (\"dataset\"), but got {0:?}.")]
    InvalidDataType(String),

    #[error("Data opener identifier must be one of (\"dataset:zarr:icosdp\"), but got {0:?}.")]
    InvalidOpenerId(String),

    #[error("No data found for {0}.")]
    NoDataFound(String),

    #[error(
        "expected exactly one object with resolution {resolution:?} and frequency {frequency:?} \
         for year {year}, found {matched}; candidates: {candidates:?}"
    )]
    AmbiguousOrMissingObject {
        year: i32,
        resolution: String,
        frequency: String,
        matched: usize,
        candidates: Vec<String>,
    },

    #[error("Invalid bbox {0}. West must be smaller than East and South must be smaller than North.")]
    InvalidBbox(String),

    #[error("Invalid time range {0}. Start date must be before end date.")]
    InvalidTimeRange(String),

    #[error("ICOS request failed: {0}")]
    Transport(String),

    #[error("ICOS returned status {status}: {message}")]
    TransportStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("cube error: {0}")]
    Cube(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("preload cancelled: {0}")]
    Cancelled(String),
}

impl IcosdpError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IcosdpError::Transport(_) | IcosdpError::TransportStatus { .. }
        )
    }
}
