use std::io::{self, Write};

use serde::Serialize;

use crate::cache::CacheMetadata;
use crate::preload::{PreloadOutcome, PreloadPhase};
use crate::store::DatasetDescriptor;
use crate::writer::CacheArtifact;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Serializable view of a [`PreloadOutcome`].
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    pub data_id: String,
    pub phase: PreloadPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<PreloadPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<CacheArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PreloadOutcome> for OutcomeReport {
    fn from(outcome: &PreloadOutcome) -> Self {
        let (artifact, error) = match &outcome.result {
            Ok(artifact) => (Some(artifact.clone()), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Self {
            data_id: outcome.data_id.clone(),
            phase: outcome.phase,
            failed_in: outcome.failed_in,
            artifact,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
struct DataIdList<'a> {
    data_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct CacheListing<'a> {
    entries: &'a [CacheMetadata],
}

#[derive(Debug, Serialize)]
struct PreloadSummary {
    outcomes: Vec<OutcomeReport>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_data_ids(data_ids: &[String]) -> io::Result<()> {
        Self::print_json(&DataIdList { data_ids })
    }

    pub fn print_descriptor(descriptor: &DatasetDescriptor) -> io::Result<()> {
        Self::print_json(descriptor)
    }

    pub fn print_cache(entries: &[CacheMetadata]) -> io::Result<()> {
        Self::print_json(&CacheListing { entries })
    }

    pub fn print_outcomes(outcomes: &[PreloadOutcome]) -> io::Result<()> {
        Self::print_json(&PreloadSummary {
            outcomes: outcomes.iter().map(OutcomeReport::from).collect(),
        })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::TargetFormat;
    use crate::error::IcosdpError;

    #[test]
    fn failed_outcome_reports_phase_and_error() {
        let outcome = PreloadOutcome {
            data_id: "FLUXCOM-X-BASE_NEE".to_string(),
            phase: PreloadPhase::Failed,
            failed_in: Some(PreloadPhase::Downloading),
            result: Err(IcosdpError::Transport("connection reset".to_string())),
        };
        let value = serde_json::to_value(OutcomeReport::from(&outcome)).unwrap();
        assert_eq!(value["phase"], "FAILED");
        assert_eq!(value["failed_in"], "DOWNLOADING");
        assert!(value["error"].as_str().unwrap().contains("connection reset"));
        assert!(value.get("artifact").is_none());
    }

    #[test]
    fn finished_outcome_carries_artifact() {
        let outcome = PreloadOutcome {
            data_id: "FLUXCOM-X-BASE_NEE".to_string(),
            phase: PreloadPhase::Finished,
            failed_in: None,
            result: Ok(CacheArtifact {
                output_id: "NEE_monthly.zarr".to_string(),
                format: TargetFormat::Zarr,
                storage_location: Utf8PathBuf::from("/cache/NEE_monthly.zarr"),
            }),
        };
        let value = serde_json::to_value(OutcomeReport::from(&outcome)).unwrap();
        assert_eq!(value["artifact"]["output_id"], "NEE_monthly.zarr");
        assert_eq!(value["artifact"]["format"], "zarr");
        assert!(value.get("error").is_none());
    }
}
