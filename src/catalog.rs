use std::collections::BTreeMap;

use crate::domain::{AggMode, DATA_ID_PREFIX, DataId};
use crate::error::IcosdpError;

const HOURLY_BASE_URI: &str =
    "https://swift.dkrz.de/v1/dkrz_a1e106384d7946408b9724b59858a536/fluxcom-x/FLUXCOMxBase";

const VARIABLES: [&str; 4] = ["NEE", "GPP", "ET", "ET_T"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCatalogEntry {
    pub logical_name: String,
    pub aggregation_modes: BTreeMap<AggMode, String>,
}

/// Static mapping from (dataset, aggregation mode) to a root locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCatalog {
    entries: BTreeMap<String, DatasetCatalogEntry>,
}

impl Default for DatasetCatalog {
    fn default() -> Self {
        let entries = VARIABLES
            .iter()
            .map(|variable| {
                let mut modes = BTreeMap::new();
                modes.insert(
                    AggMode::Hourly005,
                    format!("{HOURLY_BASE_URI}/{variable}"),
                );
                (
                    variable.to_string(),
                    DatasetCatalogEntry {
                        logical_name: variable.to_string(),
                        aggregation_modes: modes,
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

impl DatasetCatalog {
    /// Adds collection locators for aggregated modes on top of the built-in
    /// entries. Unknown variables become new entries.
    pub fn with_locators(
        mut self,
        locators: &BTreeMap<String, BTreeMap<AggMode, String>>,
    ) -> Result<Self, IcosdpError> {
        for (name, modes) in locators {
            let id: DataId = name.parse()?;
            let variable = id.variable().to_string();
            if modes.is_empty() {
                return Err(IcosdpError::Configuration(format!(
                    "catalog entry {name:?} has no aggregation modes"
                )));
            }
            let entry = self
                .entries
                .entry(variable.clone())
                .or_insert_with(|| DatasetCatalogEntry {
                    logical_name: variable,
                    aggregation_modes: BTreeMap::new(),
                });
            for (mode, locator) in modes {
                if locator.trim().is_empty() {
                    return Err(IcosdpError::Configuration(format!(
                        "empty locator for {name} {mode}"
                    )));
                }
                entry.aggregation_modes.insert(*mode, locator.trim().to_string());
            }
        }
        Ok(self)
    }

    pub fn data_ids(&self) -> Vec<DataId> {
        self.entries
            .keys()
            .filter_map(|name| format!("{DATA_ID_PREFIX}{name}").parse().ok())
            .collect()
    }

    pub fn entry(&self, id: &DataId) -> Option<&DatasetCatalogEntry> {
        self.entries.get(id.variable())
    }

    pub fn contains(&self, id: &DataId) -> bool {
        self.entry(id).is_some()
    }

    pub fn locator(&self, id: &DataId, mode: AggMode) -> Result<&str, IcosdpError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| IcosdpError::UnknownDataId {
                data_id: id.to_string(),
                available: self.available(),
            })?;
        entry
            .aggregation_modes
            .get(&mode)
            .map(String::as_str)
            .ok_or_else(|| {
                IcosdpError::Configuration(format!(
                    "no collection locator configured for {id} in mode {mode}; \
                     add it under `catalog` in icosdp.json"
                ))
            })
    }

    pub fn available(&self) -> String {
        let ids = self
            .data_ids()
            .iter()
            .map(|id| format!("{:?}", id.as_str()))
            .collect::<Vec<_>>();
        format!("[{}]", ids.join(", "))
    }
}
