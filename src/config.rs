use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::{AggMode, Bbox, DataId, TargetFormat, YearRange, parse_iso_datetime};
use crate::error::IcosdpError;

pub const CONFIG_FILE_NAME: &str = "icosdp.json";

/// Options accepted by `preload_data`. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PreloadParams {
    pub agg_mode: AggMode,
    #[serde(default)]
    pub time_range: Option<(String, String)>,
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub flatten_time: bool,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default = "default_true")]
    pub silent: bool,
    #[serde(default)]
    pub target_format: TargetFormat,
    #[serde(default)]
    pub chunks: Option<Vec<usize>>,
}

fn default_true() -> bool {
    true
}

impl PreloadParams {
    pub fn new(agg_mode: AggMode) -> Self {
        Self {
            agg_mode,
            time_range: None,
            bbox: None,
            flatten_time: false,
            blocking: true,
            silent: true,
            target_format: TargetFormat::Zarr,
            chunks: None,
        }
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, IcosdpError> {
        serde_json::from_value(value).map_err(|err| IcosdpError::Configuration(err.to_string()))
    }

    /// Checks every option and builds the immutable request for one data id.
    pub fn resolve(&self, data_id: &DataId) -> Result<PreloadRequest, IcosdpError> {
        if !self.agg_mode.is_preloadable() {
            return Err(IcosdpError::Configuration(format!(
                "aggregation mode {} is served directly by open_data and cannot be preloaded",
                self.agg_mode
            )));
        }
        if self.flatten_time && self.agg_mode != AggMode::MonthlyCycle025 {
            return Err(IcosdpError::Configuration(format!(
                "flatten_time is only available for agg_mode {}, got {}",
                AggMode::MonthlyCycle025,
                self.agg_mode
            )));
        }
        let years = self
            .time_range
            .as_ref()
            .map(|(start, end)| YearRange::from_dates(start, end))
            .transpose()?;
        let bbox = self.bbox.map(Bbox::from_array).transpose()?;
        if let Some(chunks) = &self.chunks {
            if chunks.is_empty() || chunks.contains(&0) {
                return Err(IcosdpError::Configuration(format!(
                    "chunks must be a non-empty sequence of positive integers, got {chunks:?}"
                )));
            }
        }
        Ok(PreloadRequest {
            data_id: data_id.clone(),
            agg_mode: self.agg_mode,
            years,
            bbox,
            flatten_time: self.flatten_time,
            target_format: self.target_format,
            chunks: self.chunks.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreloadRequest {
    pub data_id: DataId,
    pub agg_mode: AggMode,
    pub years: Option<YearRange>,
    pub bbox: Option<Bbox>,
    pub flatten_time: bool,
    pub target_format: TargetFormat,
    pub chunks: Option<Vec<usize>>,
}

impl PreloadRequest {
    /// `{variable}_{frequency}[_{start}_{end}].{ext}`
    pub fn output_id(&self) -> String {
        let mut id = format!("{}_{}", self.data_id.variable(), self.agg_mode.frequency());
        if let Some(years) = self.years {
            id.push_str(&format!("_{}_{}", years.start, years.end));
        }
        format!("{id}.{}", self.target_format.extension())
    }
}

/// Options accepted by `open_data`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OpenParams {
    #[serde(default)]
    pub time_range: Option<(String, String)>,
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub flatten_time: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOpenParams {
    pub time_range: Option<(NaiveDateTime, NaiveDateTime)>,
    pub bbox: Option<Bbox>,
    pub flatten_time: bool,
}

impl OpenParams {
    pub fn from_json(value: serde_json::Value) -> Result<Self, IcosdpError> {
        serde_json::from_value(value).map_err(|err| IcosdpError::Configuration(err.to_string()))
    }

    pub fn resolve(&self) -> Result<ResolvedOpenParams, IcosdpError> {
        let time_range = match &self.time_range {
            Some((start, end)) => {
                let start_dt = parse_iso_datetime(start)?;
                let end_dt = parse_iso_datetime(end)?;
                if end_dt <= start_dt {
                    return Err(IcosdpError::InvalidTimeRange(format!(
                        "({start:?}, {end:?})"
                    )));
                }
                Some((start_dt, end_dt))
            }
            None => None,
        };
        Ok(ResolvedOpenParams {
            time_range,
            bbox: self.bbox.map(Bbox::from_array).transpose()?,
            flatten_time: self.flatten_time,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cache_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub scratch_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub catalog: BTreeMap<String, BTreeMap<AggMode, String>>,
}

impl StoreConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.email.as_deref(), self.password.as_deref()) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => {
                Some((email, password))
            }
            _ => None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `icosdp.json` (or `path`), then applies environment overrides.
    /// A missing default file yields the default configuration.
    pub fn resolve(path: Option<&str>) -> Result<StoreConfig, IcosdpError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };

        let mut config = if path.is_none() && !config_path.exists() {
            StoreConfig::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| IcosdpError::ConfigRead(config_path.clone()))?;
            Self::parse(&content)?
        };

        if let Ok(email) = std::env::var("ICOSDP_EMAIL") {
            if !email.trim().is_empty() {
                config.email = Some(email.trim().to_string());
            }
        }
        if let Ok(password) = std::env::var("ICOSDP_PASSWORD") {
            if !password.is_empty() {
                config.password = Some(password);
            }
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<StoreConfig, IcosdpError> {
        serde_json::from_str(content).map_err(|err| IcosdpError::ConfigParse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn preload_params_defaults() {
        let params = PreloadParams::from_json(json!({"agg_mode": "050_monthly"})).unwrap();
        assert_eq!(params, PreloadParams::new(AggMode::Monthly050));
        assert!(params.blocking);
        assert!(params.silent);
        assert_eq!(params.target_format, TargetFormat::Zarr);
    }

    #[test]
    fn preload_params_reject_unknown_keys() {
        let err = PreloadParams::from_json(json!({"agg_mode": "050_monthly", "format_id": "zarr"}))
            .unwrap_err();
        assert_matches!(err, IcosdpError::Configuration(_));
        let err = PreloadParams::from_json(json!({"time_range": ["2002-01-01", "2002-12-31"]}))
            .unwrap_err();
        assert_matches!(err, IcosdpError::Configuration(_));
    }

    #[test]
    fn flatten_time_requires_monthly_cycle() {
        let id: DataId = "NEE".parse().unwrap();
        let mut params = PreloadParams::new(AggMode::Monthly050);
        params.flatten_time = true;
        assert_matches!(params.resolve(&id), Err(IcosdpError::Configuration(_)));
        params.agg_mode = AggMode::MonthlyCycle025;
        assert!(params.resolve(&id).unwrap().flatten_time);
    }

    #[test]
    fn zero_chunk_is_rejected() {
        let id: DataId = "NEE".parse().unwrap();
        let mut params = PreloadParams::new(AggMode::Daily025);
        params.chunks = Some(vec![1, 0, 10]);
        assert_matches!(params.resolve(&id), Err(IcosdpError::Configuration(_)));
    }

    #[test]
    fn open_params_require_increasing_time_range() {
        let params = OpenParams {
            time_range: Some(("2004-01-01".to_string(), "2002-12-31".to_string())),
            ..OpenParams::default()
        };
        assert_matches!(params.resolve(), Err(IcosdpError::InvalidTimeRange(_)));
    }

    #[test]
    fn store_config_parses_catalog_section() {
        let config = ConfigLoader::parse(
            r#"{"email": "a@b.c", "password": "x",
                "catalog": {"NEE": {"050_monthly": "https://meta.icos-cp.eu/collections/abc"}}}"#,
        )
        .unwrap();
        assert_eq!(config.credentials(), Some(("a@b.c", "x")));
        assert_eq!(config.catalog["NEE"][&AggMode::Monthly050], "https://meta.icos-cp.eu/collections/abc");
    }
}
