use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheMetadata, CacheStore, iso_timestamp};
use crate::codec::CubeWriter;
use crate::config::PreloadRequest;
use crate::cube::Cube;
use crate::domain::{DATA_STORE_ID, TargetFormat};
use crate::error::IcosdpError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheArtifact {
    pub output_id: String,
    pub format: TargetFormat,
    pub storage_location: Utf8PathBuf,
}

/// Applies the requested chunking and persists `cube` under the request's
/// output id, replacing any previous artifact.
pub fn write(
    cache: &CacheStore,
    writer: &dyn CubeWriter,
    cube: Cube,
    request: &PreloadRequest,
) -> Result<CacheArtifact, IcosdpError> {
    if writer.format() != request.target_format {
        return Err(IcosdpError::Configuration(format!(
            "writer produces {} but {} was requested",
            writer.format(),
            request.target_format
        )));
    }
    let cube = match &request.chunks {
        Some(chunks) => cube.rechunk(chunks)?,
        None => cube,
    };
    let output_id = request.output_id();
    debug!(%output_id, chunks = ?cube.chunks, "writing cache artifact");

    let metadata = CacheMetadata {
        source: DATA_STORE_ID.to_string(),
        data_id: request.data_id.to_string(),
        output_id: output_id.clone(),
        format: request.target_format,
        agg_mode: request.agg_mode,
        time_range: request.years,
        bbox: request.bbox.map(|bbox| bbox.to_array()),
        written_at: iso_timestamp(),
        tool: format!("icosdp/{}", env!("CARGO_PKG_VERSION")),
        resolved_path: cache.artifact_path(&output_id).to_string(),
    };
    let storage_location =
        cache.write_artifact(&output_id, &metadata, |path| writer.write(&cube, path))?;
    Ok(CacheArtifact {
        output_id,
        format: request.target_format,
        storage_location,
    })
}
