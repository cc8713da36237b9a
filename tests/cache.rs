use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use ndarray::{ArrayD, IxDyn};

use icosdp_store::cache::{CacheMetadata, CacheStore, iso_timestamp};
use icosdp_store::codec::{CubeReader, CubeWriter, ZarrFormat};
use icosdp_store::cube::{Coordinate, Cube, LAT, LON, TIME, TIME_UNITS, Variable};
use icosdp_store::domain::{AggMode, TargetFormat};
use icosdp_store::error::IcosdpError;

fn cache() -> (tempfile::TempDir, CacheStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
    (temp, CacheStore::new(root))
}

fn cube(fill: f32) -> Cube {
    let data = ArrayD::from_elem(IxDyn(&[2, 2, 3]), fill);
    Cube::new(
        vec![
            Coordinate::new(TIME, vec![0.0, 31.0]).with_attr("units", TIME_UNITS),
            Coordinate::new(LAT, vec![50.0, 49.5]),
            Coordinate::new(LON, vec![5.0, 5.5, 6.0]),
        ],
        vec![Variable::new("NEE", &[TIME, LAT, LON], data).unwrap()],
    )
    .unwrap()
}

fn metadata(cache: &CacheStore, output_id: &str) -> CacheMetadata {
    CacheMetadata {
        source: "icosdp".to_string(),
        data_id: "FLUXCOM-X-BASE_NEE".to_string(),
        output_id: output_id.to_string(),
        format: TargetFormat::Zarr,
        agg_mode: AggMode::Monthly050,
        time_range: None,
        bbox: None,
        written_at: iso_timestamp(),
        tool: "icosdp/test".to_string(),
        resolved_path: cache.artifact_path(output_id).to_string(),
    }
}

#[test]
fn write_list_and_remove() {
    let (_temp, cache) = cache();
    let id = "NEE_monthly.zarr";
    let path = cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(1.0), path))
        .unwrap();
    assert_eq!(path, cache.artifact_path(id));
    assert!(cache.has_data(id));
    assert_eq!(cache.list_data_ids().unwrap(), vec![id]);
    assert_eq!(cache.open_data(id).unwrap(), cube(1.0));

    assert!(cache.remove(id).unwrap());
    assert!(!cache.has_data(id));
    assert!(!cache.metadata_path(id).as_std_path().exists());
    assert!(!cache.remove(id).unwrap());
}

#[test]
fn replacement_swaps_whole_artifact() {
    let (_temp, cache) = cache();
    let id = "NEE_monthly.zarr";
    cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(1.0), path))
        .unwrap();
    cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(2.0), path))
        .unwrap();
    assert_eq!(cache.open_data(id).unwrap(), cube(2.0));
    let entries = fs::read_dir(cache.root().as_std_path()).unwrap().count();
    assert_eq!(entries, 2);
}

#[test]
fn failed_build_leaves_previous_artifact() {
    let (_temp, cache) = cache();
    let id = "NEE_monthly.zarr";
    cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(1.0), path))
        .unwrap();
    let err = cache
        .write_artifact(id, &metadata(&cache, id), |_| {
            Err(IcosdpError::Cube("interrupted".to_string()))
        })
        .unwrap_err();
    assert_matches!(err, IcosdpError::Cube(_));
    assert_eq!(cache.open_data(id).unwrap(), cube(1.0));
}

#[test]
fn hidden_entries_are_not_data() {
    let (_temp, cache) = cache();
    cache.ensure_root().unwrap();
    fs::create_dir_all(cache.root().join(".icosdp-partial").as_std_path()).unwrap();
    assert!(!cache.has_data(".icosdp-partial"));
    assert!(cache.list_data_ids().unwrap().is_empty());
}

#[test]
fn unknown_artifact_lists_available_ids() {
    let (_temp, cache) = cache();
    let id = "GPP_daily.zarr";
    cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(1.0), path))
        .unwrap();
    let err = cache.describe("NEE_daily.zarr").unwrap_err();
    assert_matches!(
        err,
        IcosdpError::UnknownDataId { ref available, .. } if available.contains("GPP_daily.zarr")
    );
}

#[test]
fn blocked_metadata_dir_leaves_no_new_artifact() {
    let (_temp, cache) = cache();
    let id = "NEE_monthly.zarr";
    cache.ensure_root().unwrap();
    fs::write(cache.root().join("metadata").as_std_path(), b"not a directory").unwrap();

    let err = cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(1.0), path))
        .unwrap_err();
    assert_matches!(err, IcosdpError::Filesystem(_));
    assert!(!cache.artifact_path(id).as_std_path().exists());
    let entries = fs::read_dir(cache.root().as_std_path()).unwrap().count();
    assert_eq!(entries, 1);
}

#[test]
fn failed_sidecar_swap_restores_previous_artifact() {
    let (_temp, cache) = cache();
    let id = "NEE_monthly.zarr";
    cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(1.0), path))
        .unwrap();
    let sidecar = cache.metadata_path(id);
    fs::remove_file(sidecar.as_std_path()).unwrap();
    fs::create_dir_all(sidecar.join("occupied").as_std_path()).unwrap();

    let err = cache
        .write_artifact(id, &metadata(&cache, id), |path| ZarrFormat.write(&cube(2.0), path))
        .unwrap_err();
    assert_matches!(err, IcosdpError::Filesystem(_));
    assert_eq!(ZarrFormat.read(&cache.artifact_path(id)).unwrap(), cube(1.0));
    let hidden = fs::read_dir(cache.root().as_std_path())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with('.')
        })
        .count();
    assert_eq!(hidden, 0);
}
