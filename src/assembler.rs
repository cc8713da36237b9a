use regex::Regex;
use tracing::{debug, info};

use crate::codec::CubeReader;
use crate::cube::Cube;
use crate::domain::Bbox;
use crate::error::IcosdpError;
use crate::stager::StagedFile;

/// Opens the staged yearly files of `variable`, concatenates them along time
/// in ascending year order and crops the result to `bbox`.
///
/// Files whose name does not start with `{variable}_{year}` are ignored.
pub fn assemble(
    reader: &dyn CubeReader,
    variable: &str,
    staged: &[StagedFile],
    bbox: Option<&Bbox>,
) -> Result<Cube, IcosdpError> {
    let bbox = bbox
        .map(|bbox| Bbox::from_array(bbox.to_array()))
        .transpose()?;
    let pattern = Regex::new(&format!("^{}_[0-9]{{4}}", regex::escape(variable)))
        .map_err(|err| IcosdpError::Configuration(err.to_string()))?;

    let mut files = staged
        .iter()
        .filter(|file| {
            let keep = pattern.is_match(file.file_name());
            if !keep {
                debug!(path = %file.local_path, "skipping unrelated staged file");
            }
            keep
        })
        .collect::<Vec<_>>();
    if files.is_empty() {
        return Err(IcosdpError::NoDataFound(format!(
            "{variable} among {} staged files",
            staged.len()
        )));
    }
    files.sort_by_key(|file| file.origin_year);

    let mut cubes = Vec::with_capacity(files.len());
    for file in &files {
        debug!(year = file.origin_year, path = %file.local_path, "opening staged file");
        cubes.push(reader.read(&file.local_path)?.normalize_time()?);
    }
    let cube = Cube::concat_time(cubes)?;
    let cube = match bbox {
        Some(bbox) => cube.select_bbox(&bbox)?,
        None => cube,
    };
    info!(
        variable,
        years = files.len(),
        sizes = ?cube.sizes(),
        "assembled cube"
    );
    Ok(cube)
}
