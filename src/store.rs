use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{Span, debug, info, info_span};

use crate::cache::{CacheStore, default_cache_root, default_scratch_root};
use crate::catalog::DatasetCatalog;
use crate::codec::CubeReader;
use crate::config::{OpenParams, PreloadParams, ResolvedOpenParams, StoreConfig};
use crate::cube::{Cube, TIME};
use crate::domain::{
    AggMode, COVERAGE_END_YEAR, COVERAGE_START_YEAR, DATA_OPENER_ID, DATA_TYPE, DataId,
};
use crate::error::IcosdpError;
use crate::icos::{CatalogClient, IcosHttpClient};
use crate::preload::{PreloadHandle, Preloader};
use crate::progress::{LogProgress, ProgressSink, SilentProgress};

const CRS: &str = "EPSG:4326";
const GLOBAL_BBOX: [f64; 4] = [-180.0, -90.0, 180.0, 90.0];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggModeDescriptor {
    pub agg_mode: AggMode,
    pub resolution: String,
    pub frequency: String,
    pub preloadable: bool,
    pub locator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDescriptor {
    pub data_id: String,
    pub data_type: String,
    pub crs: String,
    pub bbox: [f64; 4],
    pub time_range: (String, String),
    pub data_vars: Vec<String>,
    pub agg_modes: Vec<AggModeDescriptor>,
}

/// Data store over the FLUXCOM-X-BASE archive with a local cache of
/// preloaded cubes.
pub struct IcosdpStore {
    catalog: Arc<DatasetCatalog>,
    cache: CacheStore,
    scratch_root: Utf8PathBuf,
    client: Option<Arc<dyn CatalogClient>>,
    reader: Option<Arc<dyn CubeReader>>,
    span: Span,
    scratch_lock: Arc<Mutex<()>>,
}

impl IcosdpStore {
    pub fn new(catalog: DatasetCatalog, cache_root: Utf8PathBuf, scratch_root: Utf8PathBuf) -> Self {
        Self {
            catalog: Arc::new(catalog),
            cache: CacheStore::new(cache_root),
            scratch_root,
            client: None,
            reader: None,
            span: info_span!("icosdp"),
            scratch_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Builds the store from configuration. Credentials, when present, are
    /// exchanged for an authenticated ICOS session right away.
    pub fn from_config(config: &StoreConfig) -> Result<Self, IcosdpError> {
        let catalog = DatasetCatalog::default().with_locators(&config.catalog)?;
        let cache_root = match &config.cache_root {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        };
        let scratch_root = match &config.scratch_root {
            Some(root) => root.clone(),
            None => default_scratch_root()?,
        };
        let mut store = Self::new(catalog, cache_root, scratch_root);
        if let Some((email, password)) = config.credentials() {
            let client = IcosHttpClient::from_credentials(email, password)?;
            info!("authenticated at the ICOS data portal");
            store = store.with_client(Arc::new(client));
        }
        Ok(store)
    }

    /// Authenticated catalog client used by `preload_data`.
    pub fn with_client(mut self, client: Arc<dyn CatalogClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Reader for the downloaded yearly objects; NetCDF by default.
    pub fn with_reader(mut self, reader: Arc<dyn CubeReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn catalog(&self) -> &DatasetCatalog {
        &self.catalog
    }

    pub fn data_types() -> &'static [&'static str] {
        &[DATA_TYPE]
    }

    pub fn data_types_for_data(&self, data_id: &str) -> Result<&'static [&'static str], IcosdpError> {
        self.assert_has_data(data_id)?;
        Ok(Self::data_types())
    }

    pub fn data_ids(&self) -> Vec<DataId> {
        self.catalog.data_ids()
    }

    pub fn has_data(&self, data_id: &str, data_type: Option<&str>) -> bool {
        if Self::assert_valid_data_type(data_type).is_err() {
            return false;
        }
        data_id
            .parse::<DataId>()
            .map(|id| id.as_str() == data_id && self.catalog.contains(&id))
            .unwrap_or(false)
    }

    pub fn data_opener_ids(
        &self,
        data_id: Option<&str>,
        data_type: Option<&str>,
    ) -> Result<&'static [&'static str], IcosdpError> {
        Self::assert_valid_data_type(data_type)?;
        if let Some(data_id) = data_id {
            self.assert_has_data(data_id)?;
        }
        Ok(&[DATA_OPENER_ID])
    }

    pub fn describe_data(
        &self,
        data_id: &str,
        data_type: Option<&str>,
    ) -> Result<DatasetDescriptor, IcosdpError> {
        Self::assert_valid_data_type(data_type)?;
        let id = self.assert_has_data(data_id)?;
        let entry = self
            .catalog
            .entry(&id)
            .ok_or_else(|| self.unknown(data_id))?;
        let agg_modes = AggMode::ALL
            .into_iter()
            .map(|mode| AggModeDescriptor {
                agg_mode: mode,
                resolution: mode.resolution_token(),
                frequency: mode.catalog_frequency().to_string(),
                preloadable: mode.is_preloadable(),
                locator: entry.aggregation_modes.get(&mode).cloned(),
            })
            .collect();
        Ok(DatasetDescriptor {
            data_id: id.to_string(),
            data_type: DATA_TYPE.to_string(),
            crs: CRS.to_string(),
            bbox: GLOBAL_BBOX,
            time_range: (
                format!("{COVERAGE_START_YEAR}-01-01T00:00:00Z"),
                format!("{COVERAGE_END_YEAR}-12-31T23:00:00Z"),
            ),
            data_vars: vec![entry.logical_name.clone()],
            agg_modes,
        })
    }

    pub fn validate_open_params(
        &self,
        data_id: &str,
        opener_id: Option<&str>,
        params: &OpenParams,
    ) -> Result<ResolvedOpenParams, IcosdpError> {
        self.assert_has_data(data_id)?;
        Self::assert_valid_opener_id(opener_id)?;
        params.resolve()
    }

    /// Opens a cached artifact and applies the open parameters to it.
    pub fn open_cached(&self, output_id: &str, params: &OpenParams) -> Result<Cube, IcosdpError> {
        let params = params.resolve()?;
        let mut cube = self.cache.open_data(output_id)?.normalize_time()?;
        if let Some((start, end)) = params.time_range {
            let unix = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH.naive_utc();
            let to_days = |dt: chrono::NaiveDateTime| (dt - unix).num_seconds() as f64 / 86_400.0;
            if cube.coord(TIME).is_some() {
                cube = cube.select_time(to_days(start), to_days(end))?;
            }
        }
        if let Some(bbox) = params.bbox {
            cube = cube.select_bbox(&bbox)?;
        }
        if params.flatten_time {
            cube = cube.flatten_time()?;
        }
        Ok(cube)
    }

    pub fn assert_has_data(&self, data_id: &str) -> Result<DataId, IcosdpError> {
        let id = data_id
            .parse::<DataId>()
            .ok()
            .filter(|id| id.as_str() == data_id && self.catalog.contains(id));
        id.ok_or_else(|| self.unknown(data_id))
    }

    pub fn assert_valid_data_type(data_type: Option<&str>) -> Result<(), IcosdpError> {
        match data_type {
            None => Ok(()),
            Some(value) if value == DATA_TYPE => Ok(()),
            Some(value) => Err(IcosdpError::InvalidDataType(value.to_string())),
        }
    }

    pub fn assert_valid_opener_id(opener_id: Option<&str>) -> Result<(), IcosdpError> {
        match opener_id {
            None => Ok(()),
            Some(value) if value == DATA_OPENER_ID => Ok(()),
            Some(value) => Err(IcosdpError::InvalidOpenerId(value.to_string())),
        }
    }

    /// Starts preloading `data_ids` into the cache. Progress is logged unless
    /// `params.silent` is set.
    pub fn preload_data(
        &self,
        data_ids: &[&str],
        params: &PreloadParams,
    ) -> Result<PreloadHandle, IcosdpError> {
        let sink: Arc<dyn ProgressSink> = if params.silent {
            Arc::new(SilentProgress)
        } else {
            Arc::new(LogProgress)
        };
        self.preload_data_with_sink(data_ids, params, sink)
    }

    /// Like [`IcosdpStore::preload_data`] with an explicit progress observer.
    /// Everything is validated before any I/O; with `blocking` the call
    /// returns once every data id has finished or failed.
    pub fn preload_data_with_sink(
        &self,
        data_ids: &[&str],
        params: &PreloadParams,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PreloadHandle, IcosdpError> {
        if data_ids.is_empty() {
            return Err(IcosdpError::Configuration(
                "at least one data id must be provided".to_string(),
            ));
        }
        let requests = data_ids
            .iter()
            .map(|data_id| {
                let id = self.assert_has_data(data_id)?;
                params.resolve(&id)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let client = self.client.clone().ok_or(IcosdpError::CredentialsRequired)?;

        let mut preloader = Preloader::new(
            client,
            self.catalog.clone(),
            self.cache.clone(),
            self.scratch_root.clone(),
        )
        .with_span(self.span.clone())
        .with_scratch_lock(self.scratch_lock.clone());
        if let Some(reader) = &self.reader {
            preloader = preloader.with_reader(reader.clone());
        }
        for request in &requests {
            preloader.check_formats(request)?;
        }
        debug!(data_ids = ?data_ids, agg_mode = %params.agg_mode, "starting preload");

        let mut handle = PreloadHandle::spawn(preloader, requests, sink)?;
        if params.blocking {
            handle.wait();
        }
        Ok(handle)
    }

    fn unknown(&self, data_id: &str) -> IcosdpError {
        IcosdpError::UnknownDataId {
            data_id: data_id.to_string(),
            available: self.catalog.available(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn store() -> IcosdpStore {
        IcosdpStore::new(
            DatasetCatalog::default(),
            Utf8PathBuf::from("/tmp/icosdp-test/cache"),
            Utf8PathBuf::from("/tmp/icosdp-test/processing"),
        )
    }

    #[test]
    fn data_ids_and_types() {
        let store = store();
        let ids = store
            .data_ids()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                "FLUXCOM-X-BASE_ET",
                "FLUXCOM-X-BASE_ET_T",
                "FLUXCOM-X-BASE_GPP",
                "FLUXCOM-X-BASE_NEE"
            ]
        );
        assert!(store.has_data("FLUXCOM-X-BASE_NEE", None));
        assert!(store.has_data("FLUXCOM-X-BASE_NEE", Some("dataset")));
        assert!(!store.has_data("FLUXCOM-X-BASE_NEE", Some("mldataset")));
        assert!(!store.has_data("NEE", None));
        assert_eq!(IcosdpStore::data_types(), &["dataset"]);
    }

    #[test]
    fn unknown_data_id_lists_available() {
        let err = store().assert_has_data("FLUXCOM-X-BASE_CO2").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("FLUXCOM-X-BASE_CO2"));
        assert!(message.contains("FLUXCOM-X-BASE_GPP"));
    }

    #[test]
    fn opener_and_type_validation() {
        assert!(IcosdpStore::assert_valid_opener_id(Some("dataset:zarr:icosdp")).is_ok());
        assert_matches!(
            IcosdpStore::assert_valid_opener_id(Some("dataset:netcdf:icosdp")),
            Err(IcosdpError::InvalidOpenerId(_))
        );
        assert_matches!(
            IcosdpStore::assert_valid_data_type(Some("geodataframe")),
            Err(IcosdpError::InvalidDataType(_))
        );
    }

    #[test]
    fn describe_lists_modes() {
        let descriptor = store().describe_data("FLUXCOM-X-BASE_GPP", None).unwrap();
        assert_eq!(descriptor.crs, "EPSG:4326");
        assert_eq!(descriptor.data_vars, vec!["GPP"]);
        assert_eq!(descriptor.agg_modes.len(), 5);
        let hourly = &descriptor.agg_modes[0];
        assert!(!hourly.preloadable);
        assert!(hourly.locator.is_some());
    }

    #[test]
    fn preload_without_credentials_fails() {
        let params = PreloadParams::new(AggMode::Monthly050);
        let err = store()
            .preload_data(&["FLUXCOM-X-BASE_NEE"], &params)
            .err()
            .unwrap();
        assert_matches!(err, IcosdpError::CredentialsRequired);
    }

    #[test]
    fn preload_requires_data_ids() {
        let params = PreloadParams::new(AggMode::Monthly050);
        let err = store().preload_data(&[], &params).err().unwrap();
        assert_matches!(err, IcosdpError::Configuration(_));
    }
}
