#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Multi-year export of tidy service-request tables.
//!
//! [`run_export`] resolves the wanted years, aggregates each year's resource
//! concurrently ([`build_exports`]), and writes three CSV tables with
//! [`writer::write_exports`]:
//!
//! * counts by `(year, type, division, ward)`,
//! * the top N request types per year,
//! * totals per calendar day across the whole range.
//!
//! Any failing year aborts the run before anything is written.

pub mod config;
pub mod writer;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt as _, TryStreamExt as _};
use sr_trends_models::{CountRow, DailyRow, TopByYearRow, YearResourceMap};
use sr_trends_source::catalog::discover_year_resources;
use sr_trends_source::client::CkanClient;
use sr_trends_source::fields::FieldMapping;
use sr_trends_source::progress::ProgressCallback;
use sr_trends_source::strategy::{AggregateSource as _, ResourceSource, YearAggregates};
use sr_trends_source::{ErrorKind, SourceError};

use crate::config::{ConfigError, ExportSettings, PipelineConfig};
use crate::writer::{ExportPaths, write_exports};

/// Errors that abort an export run.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Resolving the wanted years failed.
    #[error("resource lookup failed ({}): {source}", .source.kind())]
    Resolve {
        /// Underlying failure.
        #[source]
        source: SourceError,
    },

    /// Retrieving or aggregating one year failed.
    #[error("year {year} failed ({}): {source}", .source.kind())]
    Year {
        /// The failing year.
        year: i32,
        /// Underlying failure.
        #[source]
        source: SourceError,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A table could not be serialized.
    #[error("CSV error at {path}: {source}")]
    Csv {
        /// Path being written.
        path: String,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run was cancelled before it finished.
    #[error("export cancelled")]
    Cancelled,
}

impl ExportError {
    /// The catalog-facing error kind, when the failure came from retrieval.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Resolve { source } | Self::Year { source, .. } => Some(source.kind()),
            Self::Io { .. } | Self::Csv { .. } | Self::Config(_) | Self::Cancelled => None,
        }
    }
}

/// Cooperative cancellation shared between the CLI and the exporter.
///
/// Checked before each year starts; requests already in flight finish or
/// time out on their own.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that has not been raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The three export tables, ready to be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTables {
    /// `(year, type, division, ward) → n`, sorted for output.
    pub counts: Vec<CountRow>,
    /// The most frequent request types of each year.
    pub top_by_year: Vec<TopByYearRow>,
    /// `day → n` across every year, ascending by day.
    pub daily: Vec<DailyRow>,
    /// Unusable source rows summed over all years.
    pub dropped: u64,
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Years that had a resource, ascending.
    pub years: Vec<i32>,
    /// Data rows written to the counts file.
    pub counts_rows: usize,
    /// Data rows written to the top-by-year file.
    pub top_rows: usize,
    /// Data rows written to the daily file.
    pub daily_rows: usize,
    /// Unusable source rows summed over all years.
    pub dropped: u64,
    /// Where the three files were written.
    pub paths: ExportPaths,
}

impl ExportSummary {
    /// The written files.
    #[must_use]
    pub fn written(&self) -> Vec<PathBuf> {
        self.paths.all().iter().map(|p| p.to_path_buf()).collect()
    }
}

/// Runs the whole pipeline for `config`: resolve, aggregate, write.
///
/// # Errors
///
/// Returns [`ExportError`] if resolution or any year fails, the run is
/// cancelled, or the tables cannot be written. Nothing is written on error.
pub async fn run_export(
    config: &PipelineConfig,
    cancel: &CancelFlag,
    progress: &dyn ProgressCallback,
) -> Result<ExportSummary, ExportError> {
    config.validate()?;

    let client =
        CkanClient::new(&config.catalog).map_err(|source| ExportError::Resolve { source })?;
    let resources = discover_year_resources(&client, &config.export.wanted_years)
        .await
        .map_err(|source| ExportError::Resolve { source })?;

    let tables = build_exports(&client, &resources, &config.fields, &config.export, cancel, progress)
        .await?;

    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }

    let paths = ExportPaths::new(
        &config.export.dir,
        &config.export.file_prefix,
        &config.export.wanted_years,
    );
    write_exports(&paths, &tables)?;

    let summary = ExportSummary {
        years: resources.keys().copied().collect(),
        counts_rows: tables.counts.len(),
        top_rows: tables.top_by_year.len(),
        daily_rows: tables.daily.len(),
        dropped: tables.dropped,
        paths,
    };

    log::info!(
        "Exported {} year(s): {} count rows, {} top rows, {} daily rows ({} unusable source rows dropped)",
        summary.years.len(),
        summary.counts_rows,
        summary.top_rows,
        summary.daily_rows,
        summary.dropped
    );

    Ok(summary)
}

/// Aggregates every year in `resources` and assembles the export tables.
///
/// Years are retrieved concurrently, at most `settings.concurrency` at a
/// time. The first failing year aborts the remaining ones.
///
/// # Errors
///
/// Returns [`ExportError::Year`] for the first year that fails, or
/// [`ExportError::Cancelled`] if `cancel` is set before a year starts.
pub async fn build_exports(
    client: &CkanClient,
    resources: &YearResourceMap,
    fields: &FieldMapping,
    settings: &ExportSettings,
    cancel: &CancelFlag,
    progress: &dyn ProgressCallback,
) -> Result<ExportTables, ExportError> {
    progress.set_total(resources.len() as u64);
    progress.set_message("Aggregating years".to_string());

    let exclude_canceled = settings.exclude_canceled;
    let per_year: BTreeMap<i32, YearAggregates> =
        stream::iter(resources.iter().map(|(&year, resource)| async move {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }

            let source = ResourceSource::for_resource(client, resource, fields);
            log::info!(
                "Year {year}: aggregating {} via {}",
                resource.label(),
                source.strategy()
            );

            let aggregates = source
                .fetch_year(exclude_canceled)
                .await
                .map_err(|source| ExportError::Year { year, source })?;

            progress.inc(1);
            log::info!(
                "Year {year}: {} count rows, {} days",
                aggregates.counts.rows.len(),
                aggregates.daily.rows.len()
            );

            Ok((year, aggregates))
        }))
        .buffer_unordered(settings.concurrency.max(1))
        .try_collect()
        .await?;

    progress.finish(format!("Aggregated {} year(s)", per_year.len()));

    Ok(assemble(per_year, settings.top_n))
}

/// Concatenates per-year aggregates in year order and derives the tables.
fn assemble(per_year: BTreeMap<i32, YearAggregates>, top_n: usize) -> ExportTables {
    let mut counts = Vec::new();
    let mut daily = Vec::new();
    let mut dropped = 0;

    for aggregates in per_year.into_values() {
        dropped += aggregates.counts.dropped + aggregates.daily.dropped;
        counts.extend(aggregates.counts.rows);
        daily.extend(aggregates.daily.rows);
    }

    sort_counts(&mut counts);
    let top_by_year = top_by_year(&counts, top_n);
    let daily = regroup_daily(daily);

    ExportTables {
        counts,
        top_by_year,
        daily,
        dropped,
    }
}

/// Sorts by year ascending, then count descending, then the text columns.
pub fn sort_counts(rows: &mut [CountRow]) {
    rows.sort_by(|a, b| {
        a.year
            .cmp(&b.year)
            .then_with(|| b.n.cmp(&a.n))
            .then_with(|| a.request_type.cmp(&b.request_type))
            .then_with(|| a.division.cmp(&b.division))
            .then_with(|| a.ward.cmp(&b.ward))
    });
}

/// Sums `counts` per `(year, type)` and keeps the `top_n` largest types of
/// each year. Equal totals are ordered by type name.
#[must_use]
pub fn top_by_year(counts: &[CountRow], top_n: usize) -> Vec<TopByYearRow> {
    let mut totals: BTreeMap<(i32, &str), u64> = BTreeMap::new();
    for row in counts {
        *totals.entry((row.year, row.request_type.as_str())).or_default() += row.n;
    }

    let mut by_year: BTreeMap<i32, Vec<(&str, u64)>> = BTreeMap::new();
    for ((year, request_type), n) in totals {
        by_year.entry(year).or_default().push((request_type, n));
    }

    by_year
        .into_iter()
        .flat_map(|(year, mut types)| {
            types.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            types
                .into_iter()
                .take(top_n)
                .map(move |(request_type, n)| TopByYearRow {
                    year,
                    request_type: request_type.to_string(),
                    n,
                })
        })
        .collect()
}

/// Sums rows sharing a day and sorts ascending by day.
#[must_use]
pub fn regroup_daily(rows: impl IntoIterator<Item = DailyRow>) -> Vec<DailyRow> {
    let mut totals = BTreeMap::new();
    for row in rows {
        *totals.entry(row.day).or_insert(0u64) += row.n;
    }
    totals
        .into_iter()
        .map(|(day, n)| DailyRow { day, n })
        .collect()
}
