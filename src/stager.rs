use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::error::IcosdpError;
use crate::icos::CatalogClient;
use crate::selector::SelectedObject;

/// Run-scoped staging directory. Created empty on acquisition and removed on
/// release; dropping an unreleased area removes it as well.
#[derive(Debug)]
pub struct ScratchArea {
    root: Utf8PathBuf,
    released: bool,
}

impl ScratchArea {
    pub fn acquire(root: &Utf8Path) -> Result<Self, IcosdpError> {
        remove_scratch(root)?;
        fs::create_dir_all(root.as_std_path()).map_err(|err| {
            IcosdpError::Filesystem(format!("create scratch area {root}: {err}"))
        })?;
        debug!(%root, "acquired scratch area");
        Ok(Self {
            root: root.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    pub fn release(&mut self) -> Result<(), IcosdpError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        remove_scratch(&self.root)
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(root = %self.root, %err, "failed to remove scratch area");
        }
    }
}

/// Removes `root` recursively; a missing directory is not an error.
pub fn remove_scratch(root: &Utf8Path) -> Result<(), IcosdpError> {
    if root.as_std_path().exists() {
        fs::remove_dir_all(root.as_std_path()).map_err(|err| {
            IcosdpError::Filesystem(format!("remove scratch area {root}: {err}"))
        })?;
        debug!(%root, "removed scratch area");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub local_path: Utf8PathBuf,
    pub origin_year: i32,
}

impl StagedFile {
    pub fn file_name(&self) -> &str {
        self.local_path.file_name().unwrap_or(self.local_path.as_str())
    }
}

/// Downloads `object` into the scratch area under its catalog name. The bytes
/// land in a hidden temporary file first and are renamed into place only
/// after the transfer completed. A file already staged under the same name is
/// never replaced.
pub fn stage(
    client: &dyn CatalogClient,
    object: &SelectedObject,
    scratch: &ScratchArea,
) -> Result<StagedFile, IcosdpError> {
    let name = object.object_name.trim();
    let is_plain_name = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\');
    if !is_plain_name {
        return Err(IcosdpError::Configuration(format!(
            "catalog object name {name:?} is not a plain file name"
        )));
    }

    let temp = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(scratch.path().as_std_path())
        .map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
    client.download(&object.object_reference, temp.path())?;

    let target = scratch.path().join(name);
    temp.persist_noclobber(target.as_std_path()).map_err(|err| {
        IcosdpError::Filesystem(format!("stage {target}: {}", err.error))
    })?;
    info!(year = object.year, path = %target, "staged object");
    Ok(StagedFile {
        local_path: target,
        origin_year: object.year,
    })
}
