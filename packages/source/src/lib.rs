#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! CKAN catalog resolution and service-request retrieval.
//!
//! [`catalog::discover_year_resources`] maps wanted years to the yearly
//! resources of a CKAN package. Each resource is then aggregated through one
//! of two retrieval strategies ([`strategy::ResourceSource`]): a server-side
//! `datastore_search_sql` query when the resource is loaded into the
//! datastore, or a full CSV download grouped in-process when it is not. Both
//! produce the same [`sr_trends_models::CountRow`] and
//! [`sr_trends_models::DailyRow`] sets for the same underlying data.

pub mod aggregate;
pub mod catalog;
pub mod client;
pub mod csv_table;
pub mod fields;
pub mod parsing;
pub mod progress;
pub mod retry;
pub mod sql;
pub mod strategy;

#[cfg(any(test, feature = "test-utils"))]
pub mod stub_server;

use strum_macros::{AsRefStr, Display};

pub use retry::TransportError;

/// The failure categories surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum ErrorKind {
    /// The package metadata endpoint was unreachable or unsuccessful.
    CatalogUnavailable,
    /// The datastore SQL endpoint reported failure.
    QueryFailed,
    /// The raw resource download failed.
    DownloadFailed,
    /// The downloaded table had no usable rows or an unusable shape.
    ParseFailed,
    /// Two distinct resources claim the same wanted year.
    AmbiguousYear,
    /// The HTTP client could not be constructed from the settings.
    Configuration,
}

/// Errors that can occur while resolving or retrieving a resource.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The package metadata lookup failed.
    #[error("catalog unavailable: {message}")]
    CatalogUnavailable {
        /// Description of what went wrong.
        message: String,
        /// Underlying transport failure, if any.
        #[source]
        source: Option<TransportError>,
    },

    /// The datastore query failed or returned an unsuccessful payload.
    #[error("datastore query on resource {resource_id} failed: {message}")]
    QueryFailed {
        /// Resource the query targeted.
        resource_id: String,
        /// Description of what went wrong.
        message: String,
        /// Underlying transport failure, if any.
        #[source]
        source: Option<TransportError>,
    },

    /// The raw table download failed.
    #[error("download of {url} failed: {source}")]
    DownloadFailed {
        /// Download location.
        url: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The downloaded table could not be turned into usable rows.
    #[error("could not parse resource {resource_id}: {message}")]
    ParseFailed {
        /// Resource that was parsed.
        resource_id: String,
        /// Description of what went wrong.
        message: String,
    },

    /// Two distinct resources matched the same wanted year.
    #[error("year {year} is claimed by both resource {first} and resource {second}")]
    AmbiguousYear {
        /// The contested year.
        year: i32,
        /// Id of the resource seen first.
        first: String,
        /// Id of the resource seen second.
        second: String,
    },

    /// The HTTP client could not be built.
    #[error("invalid catalog client settings: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl SourceError {
    /// Returns the user-facing category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CatalogUnavailable { .. } => ErrorKind::CatalogUnavailable,
            Self::QueryFailed { .. } => ErrorKind::QueryFailed,
            Self::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Self::ParseFailed { .. } => ErrorKind::ParseFailed,
            Self::AmbiguousYear { .. } => ErrorKind::AmbiguousYear,
            Self::ClientBuild(_) => ErrorKind::Configuration,
        }
    }
}
