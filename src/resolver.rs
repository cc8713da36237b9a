use tracing::{debug, warn};

use crate::domain::YearRange;
use crate::error::IcosdpError;
use crate::icos::{CatalogClient, CatalogMember};

/// A yearly sub-collection of a dataset root collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearlyMember {
    pub year: i32,
    pub collection_reference: String,
}

impl YearlyMember {
    fn from_member(member: &CatalogMember) -> Option<Self> {
        Some(Self {
            year: member.year()?,
            collection_reference: member.locator.clone(),
        })
    }
}

/// Lists the yearly members of `root_locator`, ascending by year, keeping only
/// years inside `years` when given. Members whose title carries no trailing
/// year are skipped with a warning.
pub fn resolve_years(
    client: &dyn CatalogClient,
    root_locator: &str,
    years: Option<YearRange>,
) -> Result<Vec<YearlyMember>, IcosdpError> {
    let members = client.collection_members(root_locator)?;
    let mut yearly = Vec::with_capacity(members.len());
    let mut skipped = Vec::new();
    for member in &members {
        match YearlyMember::from_member(member) {
            Some(member) => yearly.push(member),
            None => skipped.push(member.display_name()),
        }
    }
    if !skipped.is_empty() {
        warn!(root_locator, ?skipped, "skipping catalog members without a year");
    }
    if let Some(range) = years {
        yearly.retain(|member| range.contains(member.year));
    }
    yearly.sort_by_key(|member| member.year);
    debug!(
        root_locator,
        years = ?yearly.iter().map(|m| m.year).collect::<Vec<_>>(),
        "resolved yearly members"
    );

    if yearly.is_empty() {
        let requested = years
            .map(|range| range.to_string())
            .unwrap_or_else(|| root_locator.to_string());
        return Err(IcosdpError::NoDataFound(requested));
    }
    Ok(yearly)
}
