use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::codec::reader_for;
use crate::cube::Cube;
use crate::domain::{AggMode, TargetFormat, YearRange};
use crate::error::IcosdpError;

const TEMP_PREFIX: &str = ".icosdp-";

/// Local cache of preloaded cubes: `{root}/{output_id}` plus a JSON sidecar
/// under `{root}/metadata/`.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub source: String,
    pub data_id: String,
    pub output_id: String,
    pub format: TargetFormat,
    pub agg_mode: AggMode,
    pub time_range: Option<YearRange>,
    pub bbox: Option<[f64; 4]>,
    pub written_at: String,
    pub tool: String,
    pub resolved_path: String,
}

fn base_cache_dir() -> Result<Utf8PathBuf, IcosdpError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("icosdp")).ok())
        .ok_or_else(|| IcosdpError::Filesystem("unable to resolve cache directory".to_string()))
}

pub fn default_cache_root() -> Result<Utf8PathBuf, IcosdpError> {
    Ok(base_cache_dir()?.join("cache"))
}

pub fn default_scratch_root() -> Result<Utf8PathBuf, IcosdpError> {
    Ok(base_cache_dir()?.join("processing"))
}

/// Format implied by an output id's extension.
pub fn format_of(output_id: &str) -> Result<TargetFormat, IcosdpError> {
    match Utf8Path::new(output_id).extension() {
        Some("zarr") => Ok(TargetFormat::Zarr),
        Some("nc") => Ok(TargetFormat::Netcdf),
        _ => Err(IcosdpError::UnsupportedFormat(format!(
            "cannot infer the format of {output_id:?}"
        ))),
    }
}

impl CacheStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn artifact_path(&self, output_id: &str) -> Utf8PathBuf {
        self.root.join(output_id)
    }

    pub fn metadata_path(&self, output_id: &str) -> Utf8PathBuf {
        self.root.join("metadata").join(format!("{output_id}.json"))
    }

    pub fn ensure_root(&self) -> Result<(), IcosdpError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| IcosdpError::Filesystem(err.to_string()))
    }

    pub fn has_data(&self, output_id: &str) -> bool {
        !output_id.starts_with('.') && self.artifact_path(output_id).as_std_path().exists()
    }

    /// Output ids of all cached artifacts that have a sidecar, sorted.
    pub fn list_data_ids(&self) -> Result<Vec<String>, IcosdpError> {
        let mut ids = self
            .list_metadata()?
            .into_iter()
            .map(|metadata| metadata.output_id)
            .filter(|id| self.has_data(id))
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn list_metadata(&self) -> Result<Vec<CacheMetadata>, IcosdpError> {
        let metadata_root = self.root.join("metadata");
        if !metadata_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for path in walk_dir(metadata_root.as_std_path())? {
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                entries.push(read_metadata(&path)?);
            }
        }
        entries.sort_by(|a, b| a.output_id.cmp(&b.output_id));
        Ok(entries)
    }

    pub fn describe(&self, output_id: &str) -> Result<CacheMetadata, IcosdpError> {
        let path = self.metadata_path(output_id);
        if !self.has_data(output_id) || !path.as_std_path().exists() {
            return Err(self.unknown(output_id));
        }
        read_metadata(path.as_std_path())
    }

    pub fn open_data(&self, output_id: &str) -> Result<Cube, IcosdpError> {
        if !self.has_data(output_id) {
            return Err(self.unknown(output_id));
        }
        let format = format_of(output_id)?;
        reader_for(format).read(&self.artifact_path(output_id))
    }

    /// Builds the artifact and its sidecar in a hidden directory inside the
    /// cache root, then swaps both in for any previous artifact of the same
    /// id. On failure nothing under `output_id` changes.
    pub fn write_artifact<F>(
        &self,
        output_id: &str,
        metadata: &CacheMetadata,
        write: F,
    ) -> Result<Utf8PathBuf, IcosdpError>
    where
        F: FnOnce(&Utf8Path) -> Result<(), IcosdpError>,
    {
        self.ensure_root()?;
        let temp_dir = Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(self.root.as_std_path())
            .map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        let staged = Utf8PathBuf::from_path_buf(temp_dir.path().join(output_id))
            .map_err(|_| IcosdpError::Filesystem("invalid temp dir".to_string()))?;
        write(&staged)?;

        let staged_sidecar = temp_dir.path().join(format!("{output_id}.json"));
        write_metadata(&staged_sidecar, metadata)?;
        let sidecar = self.metadata_path(output_id);
        if let Some(parent) = sidecar.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| {
                IcosdpError::Filesystem(format!("create metadata dir {parent}: {err}"))
            })?;
        }

        let dest = self.artifact_path(output_id);
        let backup = temp_dir.path().join(format!("{output_id}.previous"));
        atomic_replace(staged.as_std_path(), dest.as_std_path(), &backup)
            .map_err(|err| IcosdpError::Filesystem(format!("replace {dest}: {err}")))?;
        if let Err(err) = fs::rename(&staged_sidecar, sidecar.as_std_path()) {
            roll_back(dest.as_std_path(), &backup);
            return Err(IcosdpError::Filesystem(format!("write {sidecar}: {err}")));
        }
        info!(%output_id, path = %dest, "cache artifact written");
        Ok(dest)
    }

    pub fn remove(&self, output_id: &str) -> Result<bool, IcosdpError> {
        if !self.has_data(output_id) {
            return Ok(false);
        }
        let path = self.artifact_path(output_id);
        let result = if path.as_std_path().is_dir() {
            fs::remove_dir_all(path.as_std_path())
        } else {
            fs::remove_file(path.as_std_path())
        };
        result.map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        let metadata = self.metadata_path(output_id);
        if metadata.as_std_path().exists() {
            fs::remove_file(metadata.as_std_path())
                .map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        }
        Ok(true)
    }

    fn unknown(&self, output_id: &str) -> IcosdpError {
        let available = self
            .list_data_ids()
            .map(|ids| format!("{ids:?}"))
            .unwrap_or_else(|_| "[]".to_string());
        IcosdpError::UnknownDataId {
            data_id: output_id.to_string(),
            available,
        }
    }
}

fn read_metadata(path: &Path) -> Result<CacheMetadata, IcosdpError> {
    let content =
        fs::read_to_string(path).map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
    serde_json::from_str(&content)
        .map_err(|err| IcosdpError::Filesystem(format!("{}: {err}", path.display())))
}

fn write_metadata(path: &Path, metadata: &CacheMetadata) -> Result<(), IcosdpError> {
    let content = serde_json::to_vec_pretty(metadata)
        .map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
    fs::write(path, &content).map_err(|err| IcosdpError::Filesystem(err.to_string()))
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, IcosdpError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

/// Moves `from` to `to`. An existing `to` is first renamed to `backup` and
/// put back if the final rename fails.
///
/// Directories cannot be exchanged in one rename, so between the two renames
/// `to` does not exist and a concurrent reader sees no artifact. Readers
/// never see a partially written one.
pub fn atomic_replace(from: &Path, to: &Path, backup: &Path) -> io::Result<()> {
    let had_previous = to.exists();
    if had_previous {
        fs::rename(to, backup)?;
    }
    if let Err(err) = fs::rename(from, to) {
        if had_previous {
            if let Err(restore) = fs::rename(backup, to) {
                warn!(path = %to.display(), %restore, "failed to restore previous artifact");
            }
        }
        return Err(err);
    }
    debug!(path = %to.display(), replaced = had_previous, "artifact swapped in");
    Ok(())
}

/// Removes the freshly swapped-in `dest` and puts `backup` back, if any.
fn roll_back(dest: &Path, backup: &Path) {
    let removed = if dest.is_dir() {
        fs::remove_dir_all(dest)
    } else {
        fs::remove_file(dest)
    };
    if let Err(err) = removed {
        warn!(path = %dest.display(), %err, "failed to remove rejected artifact");
        return;
    }
    if backup.exists() {
        if let Err(err) = fs::rename(backup, dest) {
            warn!(path = %dest.display(), %err, "failed to restore previous artifact");
        }
    }
}

pub fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
