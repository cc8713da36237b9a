use std::fs;

use assert_matches::assert_matches;
use serde_json::json;

use icosdp_store::config::{ConfigLoader, OpenParams, PreloadParams};
use icosdp_store::domain::{AggMode, TargetFormat};
use icosdp_store::error::IcosdpError;

#[test]
fn preload_params_full_document() {
    let params = PreloadParams::from_json(json!({
        "agg_mode": "025_monthlycycle",
        "time_range": ["2002-01-01", "2003-12-31"],
        "bbox": [5.0, 45.0, 10.0, 50.0],
        "flatten_time": true,
        "blocking": false,
        "silent": false,
        "target_format": "netcdf",
        "chunks": [1, 90, 180]
    }))
    .unwrap();
    assert_eq!(params.agg_mode, AggMode::MonthlyCycle025);
    assert_eq!(params.target_format, TargetFormat::Netcdf);
    assert!(!params.blocking);
    assert_eq!(params.chunks, Some(vec![1, 90, 180]));

    let request = params.resolve(&"NEE".parse().unwrap()).unwrap();
    assert_eq!(request.output_id(), "NEE_monthlycycle_2002_2003.nc");
    assert!(request.flatten_time);
}

#[test]
fn preload_params_reject_bad_values() {
    let err = PreloadParams::from_json(json!({"agg_mode": "050_weekly"})).unwrap_err();
    assert_matches!(err, IcosdpError::Configuration(_));
    let err = PreloadParams::from_json(json!({"agg_mode": "050_monthly", "bbox": [1, 2, 3]}))
        .unwrap_err();
    assert_matches!(err, IcosdpError::Configuration(_));
}

#[test]
fn empty_chunks_are_rejected() {
    let mut params = PreloadParams::new(AggMode::Monthly050);
    params.chunks = Some(Vec::new());
    assert_matches!(
        params.resolve(&"NEE".parse().unwrap()),
        Err(IcosdpError::Configuration(_))
    );
}

#[test]
fn open_params_accept_datetimes() {
    let params = OpenParams::from_json(json!({
        "time_range": ["2002-01-01T00:00:00", "2002-06-30"],
        "bbox": [5.0, 45.0, 10.0, 50.0]
    }))
    .unwrap();
    let resolved = params.resolve().unwrap();
    assert!(resolved.time_range.is_some());
    assert!(resolved.bbox.is_some());
    assert!(!resolved.flatten_time);

    let err = OpenParams::from_json(json!({"agg_mode": "050_monthly"})).unwrap_err();
    assert_matches!(err, IcosdpError::Configuration(_));
}

#[test]
fn config_file_is_loaded_from_explicit_path() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("icosdp.json");
    fs::write(
        &path,
        r#"{
            "cache_root": "/data/icosdp/cache",
            "catalog": {"GPP": {"025_daily": "https://meta.icos-cp.eu/collections/gpp-daily"}}
        }"#,
    )
    .unwrap();

    let config = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(config.cache_root.as_deref().map(|p| p.as_str()), Some("/data/icosdp/cache"));
    assert_eq!(
        config.catalog["GPP"][&AggMode::Daily025],
        "https://meta.icos-cp.eu/collections/gpp-daily"
    );
}

#[test]
fn missing_explicit_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, IcosdpError::ConfigRead(_));
}

#[test]
fn unknown_config_keys_are_rejected() {
    let err = ConfigLoader::parse(r#"{"user": "someone"}"#).unwrap_err();
    assert_matches!(err, IcosdpError::ConfigParse(_));
}

#[test]
fn credentials_need_both_parts() {
    let config = ConfigLoader::parse(r#"{"email": "someone@example.org"}"#).unwrap();
    assert!(config.credentials().is_none());
    let config =
        ConfigLoader::parse(r#"{"email": "someone@example.org", "password": ""}"#).unwrap();
    assert!(config.credentials().is_none());
}
