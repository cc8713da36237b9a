#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::{ArrayD, IxDyn};
use serde_json::{Value, json};
use tempfile::TempDir;

use icosdp_store::catalog::DatasetCatalog;
use icosdp_store::codec::CubeReader;
use icosdp_store::cube::{Coordinate, Cube, HOUR, LAT, LON, TIME, Variable};
use icosdp_store::domain::AggMode;
use icosdp_store::error::IcosdpError;
use icosdp_store::icos::{CatalogClient, CatalogMember};
use icosdp_store::store::IcosdpStore;

pub const LATS: [f64; 6] = [52.0, 50.0, 48.0, 46.0, 44.0, 42.0];
pub const LONS: [f64; 10] = [3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
pub const MONTH_STARTS: [f64; 3] = [0.0, 31.0, 59.0];
pub const CYCLE_HOURS: [f64; 2] = [0.0, 12.0];

pub fn root_locator(variable: &str, mode: AggMode) -> String {
    format!("root/{variable}/{mode}")
}

fn year_locator(variable: &str, mode: AggMode, year: i32) -> String {
    format!("{}/{year}", root_locator(variable, mode))
}

/// Yearly fixture in the layout read by [`JsonCubeReader`]. Values encode
/// the year so concatenation order is visible in the output.
pub fn yearly_fixture(variable: &str, year: i32, hourly_cycle: bool) -> Value {
    let mut shape = vec![MONTH_STARTS.len()];
    if hourly_cycle {
        shape.push(CYCLE_HOURS.len());
    }
    shape.extend([LATS.len(), LONS.len()]);
    let len = shape.iter().product::<usize>();
    let values = (0..len)
        .map(|i| (year - 2000) as f64 * 10_000.0 + i as f64)
        .collect::<Vec<_>>();
    let mut fixture = json!({
        "variable": variable,
        "time": MONTH_STARTS,
        "time_units": format!("days since {year}-01-01 00:00:00"),
        "lat": LATS,
        "lon": LONS,
        "values": values,
    });
    if hourly_cycle {
        fixture["hour"] = json!(CYCLE_HOURS);
    }
    fixture
}

/// In-memory stand-in for the ICOS metadata and data services.
#[derive(Default)]
pub struct FakeArchive {
    collections: BTreeMap<String, Vec<CatalogMember>>,
    objects: BTreeMap<String, Value>,
    failing: Vec<String>,
    pause: Option<DownloadPause>,
    calls: Mutex<Vec<String>>,
}

/// Holds the first download until the test has met both barriers.
struct DownloadPause {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl FakeArchive {
    /// Adds a root collection for `variable` in `mode` with one yearly
    /// sub-collection per entry of `years`, listed in the given order. Each
    /// year holds the matching object plus one for another resolution.
    pub fn with_dataset(mut self, variable: &str, mode: AggMode, years: &[i32]) -> Self {
        let root = root_locator(variable, mode);
        let hourly_cycle = mode == AggMode::MonthlyCycle025;
        let mut members = Vec::new();
        for year in years {
            let locator = year_locator(variable, mode, *year);
            members.push(CatalogMember::collection(
                &locator,
                &format!("FLUXCOM-X-BASE {variable} {} {year}", mode.frequency()),
            ));
            let name = format!(
                "{variable}_{year}_{}_{}.nc",
                mode.resolution_token(),
                mode.catalog_frequency()
            );
            let other = format!("{variable}_{year}_0.05_hourly.nc");
            let object = format!("{locator}/objects/{name}");
            let distractor = format!("{locator}/objects/{other}");
            self.objects
                .insert(object.clone(), yearly_fixture(variable, *year, hourly_cycle));
            self.objects
                .insert(distractor.clone(), yearly_fixture(variable, *year, false));
            self.collections.insert(
                locator,
                vec![
                    CatalogMember::object(&distractor, &other),
                    CatalogMember::object(&object, &name),
                ],
            );
        }
        self.collections.insert(root, members);
        self
    }

    /// Adds a second object to the year's listing that matches `mode` too.
    pub fn with_duplicate_object(mut self, variable: &str, mode: AggMode, year: i32) -> Self {
        let locator = year_locator(variable, mode, year);
        let name = format!(
            "{variable}_{year}_{}_{}_v2.nc",
            mode.resolution_token(),
            mode.catalog_frequency()
        );
        let object = format!("{locator}/objects/{name}");
        self.objects.insert(
            object.clone(),
            yearly_fixture(variable, year, mode == AggMode::MonthlyCycle025),
        );
        self.collections
            .entry(locator)
            .or_default()
            .push(CatalogMember::object(&object, &name));
        self
    }

    /// Any listing or download whose locator contains `fragment` fails with a
    /// transport error.
    pub fn failing_on(mut self, fragment: &str) -> Self {
        self.failing.push(fragment.to_string());
        self
    }

    /// The first download waits on `entered`, then on `release`, before it
    /// transfers anything.
    pub fn pausing_first_download(mut self, entered: Arc<Barrier>, release: Arc<Barrier>) -> Self {
        self.pause = Some(DownloadPause { entered, release });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix("download ").map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) -> Result<(), IcosdpError> {
        let fails = self.failing.iter().any(|fragment| call.contains(fragment.as_str()));
        self.calls.lock().unwrap().push(call.clone());
        if fails {
            return Err(IcosdpError::Transport(format!("connection reset during {call}")));
        }
        Ok(())
    }
}

impl CatalogClient for FakeArchive {
    fn collection_members(&self, locator: &str) -> Result<Vec<CatalogMember>, IcosdpError> {
        self.record(format!("list {locator}"))?;
        self.collections
            .get(locator)
            .cloned()
            .ok_or_else(|| IcosdpError::TransportStatus {
                status: 404,
                message: locator.to_string(),
            })
    }

    fn download(&self, object_locator: &str, destination: &Path) -> Result<(), IcosdpError> {
        if let Some(pause) = &self.pause {
            if self.downloads().is_empty() {
                pause.entered.wait();
                pause.release.wait();
            }
        }
        self.record(format!("download {object_locator}"))?;
        let fixture = self
            .objects
            .get(object_locator)
            .ok_or_else(|| IcosdpError::TransportStatus {
                status: 404,
                message: object_locator.to_string(),
            })?;
        fs::write(destination, fixture.to_string())
            .map_err(|err| IcosdpError::Filesystem(err.to_string()))
    }
}

/// Reads the JSON fixtures written by [`FakeArchive`] as yearly cubes.
#[derive(Debug, Default)]
pub struct JsonCubeReader;

fn floats(value: &Value, key: &str) -> Result<Vec<f64>, IcosdpError> {
    value[key]
        .as_array()
        .ok_or_else(|| IcosdpError::Cube(format!("fixture has no {key}")))?
        .iter()
        .map(|v| v.as_f64().ok_or_else(|| IcosdpError::Cube(format!("bad {key} value"))))
        .collect()
}

impl CubeReader for JsonCubeReader {
    fn read(&self, path: &Utf8Path) -> Result<Cube, IcosdpError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        let fixture: Value =
            serde_json::from_str(&content).map_err(|err| IcosdpError::Cube(err.to_string()))?;
        let variable = fixture["variable"].as_str().unwrap_or("NEE");
        let units = fixture["time_units"].as_str().unwrap_or("days since 1970-01-01");

        let mut coords = vec![Coordinate::new(TIME, floats(&fixture, TIME)?).with_attr("units", units)];
        let mut dims = vec![TIME];
        if fixture.get(HOUR).is_some() {
            coords.push(Coordinate::new(HOUR, floats(&fixture, HOUR)?));
            dims.push(HOUR);
        }
        coords.push(Coordinate::new(LAT, floats(&fixture, LAT)?));
        coords.push(Coordinate::new(LON, floats(&fixture, LON)?));
        dims.extend([LAT, LON]);

        let shape = coords.iter().map(Coordinate::len).collect::<Vec<_>>();
        let values = floats(&fixture, "values")?
            .into_iter()
            .map(|v| v as f32)
            .collect::<Vec<_>>();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|err| IcosdpError::Cube(err.to_string()))?;
        let var = Variable::new(variable, &dims, data)?.with_attr("units", "gC m-2 d-1");
        Cube::new(coords, vec![var])
    }
}

/// Workspace with isolated cache and scratch roots.
pub struct Fixture {
    pub store: IcosdpStore,
    pub archive: Arc<FakeArchive>,
    pub temp: TempDir,
}

impl Fixture {
    pub fn cache_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.temp.path().join("cache")).unwrap()
    }

    pub fn scratch_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.temp.path().join("processing")).unwrap()
    }

    pub fn scratch_is_gone(&self) -> bool {
        let root = self.scratch_root();
        !root.as_std_path().exists()
            || fs::read_dir(root.as_std_path()).map(|mut d| d.next().is_none()).unwrap_or(false)
    }
}

pub fn catalog_for(archive_modes: &[(&str, AggMode)]) -> DatasetCatalog {
    let mut locators: BTreeMap<String, BTreeMap<AggMode, String>> = BTreeMap::new();
    for (variable, mode) in archive_modes {
        locators
            .entry(variable.to_string())
            .or_default()
            .insert(*mode, root_locator(variable, *mode));
    }
    DatasetCatalog::default().with_locators(&locators).unwrap()
}

pub fn fixture(archive: FakeArchive) -> Fixture {
    fixture_with_scratch(archive, None)
}

/// Like [`fixture`], but with a custom scratch root below the temp dir.
pub fn fixture_with_scratch(archive: FakeArchive, scratch: Option<&str>) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let catalog = catalog_for(&[
        ("NEE", AggMode::Monthly050),
        ("NEE", AggMode::MonthlyCycle025),
        ("NEE", AggMode::Daily025),
        ("GPP", AggMode::Monthly050),
    ]);
    let archive = Arc::new(archive);
    let scratch_root = match scratch {
        Some(relative) => root.join(relative),
        None => root.join("processing"),
    };
    let store = IcosdpStore::new(catalog, root.join("cache"), scratch_root)
        .with_client(archive.clone())
        .with_reader(Arc::new(JsonCubeReader));
    Fixture {
        store,
        archive,
        temp,
    }
}
