//! In-process grouping for resources that are not in the datastore.
//!
//! Rows without a creation timestamp are dropped from both aggregations;
//! rows without a request type are additionally dropped from the
//! `(year, type, division, ward)` counts. Drops are counted, not raised.

use std::collections::BTreeMap;

use chrono::Datelike as _;
use sr_trends_models::{Aggregated, CountRow, DailyRow};

use crate::csv_table::RawRequest;
use crate::fields::CANCELED_STATUS;

/// `true` only for the exact status `"Canceled"`. A missing status is not
/// canceled.
#[must_use]
pub fn is_canceled(status: Option<&str>) -> bool {
    status == Some(CANCELED_STATUS)
}

/// Groups raw requests by `(year, type, division, ward)`.
#[must_use]
pub fn aggregate_counts(rows: &[RawRequest], exclude_canceled: bool) -> Aggregated<CountRow> {
    let mut groups: BTreeMap<(i32, &str, &str, &str), u64> = BTreeMap::new();
    let mut dropped = 0;

    for row in rows {
        let (Some(created_at), Some(request_type)) = (row.created_at, row.request_type.as_deref())
        else {
            dropped += 1;
            continue;
        };
        if exclude_canceled && is_canceled(row.status.as_deref()) {
            continue;
        }
        *groups
            .entry((
                created_at.year(),
                request_type,
                row.division.as_str(),
                row.ward.as_str(),
            ))
            .or_default() += 1;
    }

    let rows = groups
        .into_iter()
        .map(|((year, request_type, division, ward), n)| CountRow {
            year,
            request_type: request_type.to_string(),
            division: division.to_string(),
            ward: ward.to_string(),
            n,
        })
        .collect();

    Aggregated { rows, dropped }
}

/// Groups raw requests by UTC calendar day of creation.
#[must_use]
pub fn aggregate_daily(rows: &[RawRequest], exclude_canceled: bool) -> Aggregated<DailyRow> {
    let mut groups = BTreeMap::new();
    let mut dropped = 0;

    for row in rows {
        let Some(created_at) = row.created_at else {
            dropped += 1;
            continue;
        };
        if exclude_canceled && is_canceled(row.status.as_deref()) {
            continue;
        }
        *groups.entry(created_at.date_naive()).or_insert(0u64) += 1;
    }

    let rows = groups
        .into_iter()
        .map(|(day, n)| DailyRow { day, n })
        .collect();

    Aggregated { rows, dropped }
}
