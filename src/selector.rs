use tracing::{debug, warn};

use crate::domain::AggMode;
use crate::error::IcosdpError;
use crate::icos::CatalogClient;
use crate::resolver::YearlyMember;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedObject {
    pub year: i32,
    pub object_reference: String,
    pub object_name: String,
}

/// Picks the single object of `member` whose name carries both the
/// resolution and the frequency token of `mode`.
pub fn select_object(
    client: &dyn CatalogClient,
    member: &YearlyMember,
    mode: AggMode,
) -> Result<SelectedObject, IcosdpError> {
    let objects = client.collection_members(&member.collection_reference)?;
    let resolution = mode.resolution_token();
    let frequency = mode.catalog_frequency();

    let mut matches = objects
        .iter()
        .filter(|object| {
            let name = object.display_name();
            name.contains(&resolution) && name.contains(frequency)
        })
        .collect::<Vec<_>>();

    if matches.len() != 1 {
        let candidates = objects
            .iter()
            .map(|object| object.display_name().to_string())
            .collect::<Vec<_>>();
        warn!(
            year = member.year,
            %resolution,
            frequency,
            matched = matches.len(),
            ?candidates,
            "object selection failed"
        );
        return Err(IcosdpError::AmbiguousOrMissingObject {
            year: member.year,
            resolution,
            frequency: frequency.to_string(),
            matched: matches.len(),
            candidates,
        });
    }

    let object = matches.remove(0);
    debug!(year = member.year, name = object.display_name(), "selected object");
    Ok(SelectedObject {
        year: member.year,
        object_reference: object.locator.clone(),
        object_name: object.display_name().to_string(),
    })
}
