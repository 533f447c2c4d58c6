#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Catalog resource descriptors and the tidy aggregate rows exported by the
//! service-request pipeline.
//!
//! Every stage of the pipeline hands these values to the next one by value;
//! none of them is mutated after construction. The three row types
//! ([`CountRow`], [`TopByYearRow`], [`DailyRow`]) are also the column
//! contract of the exported CSV files, so their field order and serde names
//! must not change.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One yearly resource inside a CKAN package, as returned by
/// `package_show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Catalog-assigned opaque id. Doubles as the datastore table name.
    pub id: String,
    /// Direct download location for the raw rows.
    #[serde(default)]
    pub url: String,
    /// Free-text name, used only for year extraction.
    #[serde(default)]
    pub name: Option<String>,
    /// Free-text description, used only for year extraction.
    #[serde(default)]
    pub description: Option<String>,
    /// `true` when the resource is loaded into the queryable datastore and
    /// can be aggregated server-side.
    #[serde(default)]
    pub datastore_active: bool,
}

impl ResourceDescriptor {
    /// The text scanned for a year token: name and description joined by a
    /// single space. Missing parts contribute an empty string.
    #[must_use]
    pub fn year_haystack(&self) -> String {
        format!(
            "{} {}",
            self.name.as_deref().unwrap_or_default(),
            self.description.as_deref().unwrap_or_default()
        )
    }

    /// Human-readable label for log messages.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.id)
    }
}

/// Year → resource, restricted to the wanted years and iterated in
/// ascending year order.
pub type YearResourceMap = BTreeMap<i32, ResourceDescriptor>;

/// Count of raw requests for one `(year, type, division, ward)`
/// combination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CountRow {
    /// Calendar year of the request's creation timestamp.
    pub year: i32,
    /// Original service request type.
    #[serde(rename = "type")]
    pub request_type: String,
    /// Owning division. Empty when the source left it blank.
    pub division: String,
    /// Ward. Empty when the source left it blank.
    pub ward: String,
    /// Number of matching requests.
    pub n: u64,
}

/// Per-year total for one request type, restricted to the top N types of
/// that year.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopByYearRow {
    /// Calendar year.
    pub year: i32,
    /// Original service request type.
    #[serde(rename = "type")]
    pub request_type: String,
    /// Requests of this type in the year, summed over divisions and wards.
    pub n: u64,
}

/// Total requests created on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DailyRow {
    /// Calendar date (UTC) of creation.
    pub day: NaiveDate,
    /// Number of requests created that day.
    pub n: u64,
}

/// Output of one aggregation call together with the number of source rows
/// that were excluded because they could not be used (bad timestamp,
/// missing type, undecodable server record).
///
/// Canceled requests filtered by the exclusion toggle are not counted as
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregated<R> {
    /// Aggregate rows.
    pub rows: Vec<R>,
    /// Source rows excluded as unusable.
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_ckan_resource_with_nulls() {
        let json = r#"{
            "id": "abc-123",
            "url": "https://example.org/sr2023.csv",
            "name": "311 Service Requests - 2023",
            "description": null,
            "format": "CSV"
        }"#;
        let resource: ResourceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(resource.id, "abc-123");
        assert!(!resource.datastore_active);
        assert_eq!(resource.description, None);
        assert_eq!(resource.year_haystack(), "311 Service Requests - 2023 ");
    }

    #[test]
    fn label_falls_back_to_id() {
        let resource = ResourceDescriptor {
            id: "abc-123".to_string(),
            url: String::new(),
            name: Some(String::new()),
            description: None,
            datastore_active: true,
        };
        assert_eq!(resource.label(), "abc-123");
    }

    #[test]
    fn count_row_serializes_type_column() {
        let row = CountRow {
            year: 2024,
            request_type: "Pothole".to_string(),
            division: "Transportation".to_string(),
            ward: "Ward 1".to_string(),
            n: 2,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "Pothole");
        assert_eq!(json["n"], 2);
    }
}
