//! Catalog resolver: maps wanted years to yearly package resources.
//!
//! A resource's year is the first `20xx` token found in its name followed
//! by its description. Resources without such a token, or whose year is not
//! wanted, are skipped.

use std::collections::BTreeSet;
use std::collections::btree_map::Entry;
use std::sync::LazyLock;

use regex::Regex;
use sr_trends_models::{ResourceDescriptor, YearResourceMap};

use crate::SourceError;
use crate::client::CkanClient;

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"20\d{2}").expect("valid regex"));

/// Extracts the first `20xx` year token from `text`.
#[must_use]
pub fn extract_year(text: &str) -> Option<i32> {
    YEAR_RE.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Resolves each wanted year to its resource in the client's package.
///
/// An empty `wanted_years` set resolves to an empty map without contacting
/// the catalog.
///
/// # Errors
///
/// Returns [`SourceError::CatalogUnavailable`] if the package metadata
/// cannot be fetched, or [`SourceError::AmbiguousYear`] if two distinct
/// resources match the same wanted year.
pub async fn discover_year_resources(
    client: &CkanClient,
    wanted_years: &BTreeSet<i32>,
) -> Result<YearResourceMap, SourceError> {
    if wanted_years.is_empty() {
        log::info!("No years requested, skipping catalog lookup");
        return Ok(YearResourceMap::new());
    }

    let resources = client.package_resources().await?;
    let map = select_year_resources(resources, wanted_years)?;

    log::info!(
        "Years found: {}",
        map.keys()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let missing: Vec<String> = wanted_years
        .iter()
        .filter(|y| !map.contains_key(y))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        log::warn!("No resource found for year(s): {}", missing.join(", "));
    }

    Ok(map)
}

/// Builds the year map from a resource list.
///
/// The same resource id listed twice is kept once; two different ids for
/// one year are an error.
///
/// # Errors
///
/// Returns [`SourceError::AmbiguousYear`] when two distinct resources match
/// the same wanted year.
pub fn select_year_resources(
    resources: Vec<ResourceDescriptor>,
    wanted_years: &BTreeSet<i32>,
) -> Result<YearResourceMap, SourceError> {
    let mut map = YearResourceMap::new();

    for resource in resources {
        let Some(year) = extract_year(&resource.year_haystack()) else {
            log::debug!("Skipping resource {} (no year in metadata)", resource.label());
            continue;
        };
        if !wanted_years.contains(&year) {
            log::debug!("Skipping resource {} (year {year} not wanted)", resource.label());
            continue;
        }

        match map.entry(year) {
            Entry::Vacant(slot) => {
                slot.insert(resource);
            }
            Entry::Occupied(existing) if existing.get().id == resource.id => {}
            Entry::Occupied(existing) => {
                return Err(SourceError::AmbiguousYear {
                    year,
                    first: existing.get().id.clone(),
                    second: resource.id,
                });
            }
        }
    }

    Ok(map)
}
