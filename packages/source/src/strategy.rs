//! The two retrieval strategies behind [`AggregateSource`].
//!
//! [`ResourceSource::for_resource`] picks the strategy from the resource's
//! `datastore_active` flag:
//!
//! * [`QueryBackedSource`] runs one `datastore_search_sql` aggregation per
//!   call and decodes the returned records.
//! * [`DownloadBackedSource`] downloads the raw CSV and groups it
//!   in-process with [`crate::aggregate`].
//!
//! For the same underlying rows both strategies return the same set of
//! `(year, type, division, ward, n)` and `(day, n)` rows.

use async_trait::async_trait;
use sr_trends_models::{Aggregated, CountRow, DailyRow, ResourceDescriptor};

use crate::SourceError;
use crate::aggregate::{aggregate_counts, aggregate_daily};
use crate::client::{CkanClient, DatastoreRecord};
use crate::csv_table::{RawRequest, read_raw_requests};
use crate::fields::FieldMapping;
use crate::parsing::{json_i64, json_text, parse_day};
use crate::sql::{counts_query, daily_query};

/// Both aggregation shapes for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearAggregates {
    /// `(year, type, division, ward) → n` rows.
    pub counts: Aggregated<CountRow>,
    /// `day → n` rows.
    pub daily: Aggregated<DailyRow>,
}

/// Capability shared by both retrieval strategies.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    /// The resource being aggregated.
    fn resource(&self) -> &ResourceDescriptor;

    /// Name of the retrieval strategy (`"datastore_sql"` or `"csv_download"`).
    fn strategy(&self) -> &'static str;

    /// Counts requests by `(year, type, division, ward)`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if retrieval or parsing fails.
    async fn fetch_counts(&self, exclude_canceled: bool) -> Result<Aggregated<CountRow>, SourceError>;

    /// Counts requests by creation day.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if retrieval or parsing fails.
    async fn fetch_daily(&self, exclude_canceled: bool) -> Result<Aggregated<DailyRow>, SourceError>;

    /// Fetches both shapes. The default issues one call per shape.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if either aggregation fails.
    async fn fetch_year(&self, exclude_canceled: bool) -> Result<YearAggregates, SourceError> {
        let counts = self.fetch_counts(exclude_canceled).await?;
        let daily = self.fetch_daily(exclude_canceled).await?;
        Ok(YearAggregates { counts, daily })
    }
}

// ── Server-side aggregation ──────────────────────────────────────────────

/// Aggregates a datastore-backed resource with SQL on the catalog.
pub struct QueryBackedSource<'a> {
    client: &'a CkanClient,
    resource: &'a ResourceDescriptor,
    fields: &'a FieldMapping,
}

impl<'a> QueryBackedSource<'a> {
    /// Creates a query-backed source for `resource`.
    #[must_use]
    pub const fn new(
        client: &'a CkanClient,
        resource: &'a ResourceDescriptor,
        fields: &'a FieldMapping,
    ) -> Self {
        Self {
            client,
            resource,
            fields,
        }
    }
}

#[async_trait]
impl AggregateSource for QueryBackedSource<'_> {
    fn resource(&self) -> &ResourceDescriptor {
        self.resource
    }

    fn strategy(&self) -> &'static str {
        "datastore_sql"
    }

    async fn fetch_counts(&self, exclude_canceled: bool) -> Result<Aggregated<CountRow>, SourceError> {
        let sql = counts_query(&self.resource.id, self.fields, exclude_canceled);
        let records = self.client.datastore_sql(&self.resource.id, &sql).await?;
        let aggregated = decode_count_records(&records);
        log_dropped(self.resource, "count", aggregated.dropped, records.len());
        Ok(aggregated)
    }

    async fn fetch_daily(&self, exclude_canceled: bool) -> Result<Aggregated<DailyRow>, SourceError> {
        let sql = daily_query(&self.resource.id, self.fields, exclude_canceled);
        let records = self.client.datastore_sql(&self.resource.id, &sql).await?;
        let aggregated = decode_daily_records(&records);
        log_dropped(self.resource, "daily", aggregated.dropped, records.len());
        Ok(aggregated)
    }
}

/// Decodes `{year, type, division, ward, n}` records. Records without a
/// usable year, type or count are dropped.
#[must_use]
pub fn decode_count_records(records: &[DatastoreRecord]) -> Aggregated<CountRow> {
    let mut rows = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        let year = record
            .get("year")
            .and_then(json_i64)
            .and_then(|y| i32::try_from(y).ok());
        let n = record
            .get("n")
            .and_then(json_i64)
            .and_then(|n| u64::try_from(n).ok());
        let request_type = json_text(record.get("type"));

        match (year, n) {
            (Some(year), Some(n)) if !request_type.is_empty() => rows.push(CountRow {
                year,
                request_type,
                division: json_text(record.get("division")),
                ward: json_text(record.get("ward")),
                n,
            }),
            _ => dropped += 1,
        }
    }

    Aggregated { rows, dropped }
}

/// Decodes `{day, n}` records. Records without a usable day or count are
/// dropped.
#[must_use]
pub fn decode_daily_records(records: &[DatastoreRecord]) -> Aggregated<DailyRow> {
    let mut rows = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        let day = record.get("day").and_then(parse_day);
        let n = record
            .get("n")
            .and_then(json_i64)
            .and_then(|n| u64::try_from(n).ok());

        match (day, n) {
            (Some(day), Some(n)) => rows.push(DailyRow { day, n }),
            _ => dropped += 1,
        }
    }

    Aggregated { rows, dropped }
}

// ── Client-side aggregation ──────────────────────────────────────────────

/// Aggregates a resource by downloading its full CSV.
pub struct DownloadBackedSource<'a> {
    client: &'a CkanClient,
    resource: &'a ResourceDescriptor,
    fields: &'a FieldMapping,
}

impl<'a> DownloadBackedSource<'a> {
    /// Creates a download-backed source for `resource`.
    #[must_use]
    pub const fn new(
        client: &'a CkanClient,
        resource: &'a ResourceDescriptor,
        fields: &'a FieldMapping,
    ) -> Self {
        Self {
            client,
            resource,
            fields,
        }
    }

    async fn fetch_raw(&self) -> Result<Vec<RawRequest>, SourceError> {
        let bytes = self.client.download(&self.resource.url).await?;
        read_raw_requests(&bytes, self.fields).map_err(|e| SourceError::ParseFailed {
            resource_id: self.resource.id.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl AggregateSource for DownloadBackedSource<'_> {
    fn resource(&self) -> &ResourceDescriptor {
        self.resource
    }

    fn strategy(&self) -> &'static str {
        "csv_download"
    }

    async fn fetch_counts(&self, exclude_canceled: bool) -> Result<Aggregated<CountRow>, SourceError> {
        let raw = self.fetch_raw().await?;
        counts_from_raw(self.resource, &raw, exclude_canceled)
    }

    async fn fetch_daily(&self, exclude_canceled: bool) -> Result<Aggregated<DailyRow>, SourceError> {
        let raw = self.fetch_raw().await?;
        daily_from_raw(self.resource, &raw, exclude_canceled)
    }

    /// Downloads once and derives both shapes from the same rows.
    async fn fetch_year(&self, exclude_canceled: bool) -> Result<YearAggregates, SourceError> {
        let raw = self.fetch_raw().await?;
        Ok(YearAggregates {
            counts: counts_from_raw(self.resource, &raw, exclude_canceled)?,
            daily: daily_from_raw(self.resource, &raw, exclude_canceled)?,
        })
    }
}

fn counts_from_raw(
    resource: &ResourceDescriptor,
    raw: &[RawRequest],
    exclude_canceled: bool,
) -> Result<Aggregated<CountRow>, SourceError> {
    let aggregated = aggregate_counts(raw, exclude_canceled);
    ensure_usable(resource, raw.len(), aggregated.dropped)?;
    log_dropped(resource, "count", aggregated.dropped, raw.len());
    Ok(aggregated)
}

fn daily_from_raw(
    resource: &ResourceDescriptor,
    raw: &[RawRequest],
    exclude_canceled: bool,
) -> Result<Aggregated<DailyRow>, SourceError> {
    let aggregated = aggregate_daily(raw, exclude_canceled);
    ensure_usable(resource, raw.len(), aggregated.dropped)?;
    log_dropped(resource, "daily", aggregated.dropped, raw.len());
    Ok(aggregated)
}

/// A table with rows but none usable means the column mapping or the
/// timestamp format does not fit this resource. A header-only table is fine.
fn ensure_usable(resource: &ResourceDescriptor, total: usize, dropped: u64) -> Result<(), SourceError> {
    if total > 0 && dropped >= total as u64 {
        return Err(SourceError::ParseFailed {
            resource_id: resource.id.clone(),
            message: format!(
                "none of {total} rows had a parseable timestamp and request type"
            ),
        });
    }
    Ok(())
}

fn log_dropped(resource: &ResourceDescriptor, shape: &str, dropped: u64, total: usize) {
    if dropped > 0 {
        log::warn!(
            "{}: dropped {dropped} of {total} rows during {shape} aggregation",
            resource.label()
        );
    }
}

// ── Strategy selection ───────────────────────────────────────────────────

/// A resource paired with the strategy its `datastore_active` flag selects.
pub enum ResourceSource<'a> {
    /// Server-side SQL aggregation.
    Query(QueryBackedSource<'a>),
    /// Full download, client-side aggregation.
    Download(DownloadBackedSource<'a>),
}

impl<'a> ResourceSource<'a> {
    /// Selects the strategy for `resource`.
    #[must_use]
    pub const fn for_resource(
        client: &'a CkanClient,
        resource: &'a ResourceDescriptor,
        fields: &'a FieldMapping,
    ) -> Self {
        if resource.datastore_active {
            Self::Query(QueryBackedSource::new(client, resource, fields))
        } else {
            Self::Download(DownloadBackedSource::new(client, resource, fields))
        }
    }

    fn inner(&self) -> &(dyn AggregateSource + 'a) {
        match self {
            Self::Query(source) => source,
            Self::Download(source) => source,
        }
    }
}

#[async_trait]
impl AggregateSource for ResourceSource<'_> {
    fn resource(&self) -> &ResourceDescriptor {
        self.inner().resource()
    }

    fn strategy(&self) -> &'static str {
        self.inner().strategy()
    }

    async fn fetch_counts(&self, exclude_canceled: bool) -> Result<Aggregated<CountRow>, SourceError> {
        self.inner().fetch_counts(exclude_canceled).await
    }

    async fn fetch_daily(&self, exclude_canceled: bool) -> Result<Aggregated<DailyRow>, SourceError> {
        self.inner().fetch_daily(exclude_canceled).await
    }

    async fn fetch_year(&self, exclude_canceled: bool) -> Result<YearAggregates, SourceError> {
        self.inner().fetch_year(exclude_canceled).await
    }
}

/// Counts requests in `resource` by `(year, type, division, ward)` using
/// whichever strategy the resource supports.
///
/// # Errors
///
/// Returns [`SourceError`] if retrieval or parsing fails.
pub async fn pull_year_counts(
    client: &CkanClient,
    resource: &ResourceDescriptor,
    fields: &FieldMapping,
    exclude_canceled: bool,
) -> Result<Aggregated<CountRow>, SourceError> {
    ResourceSource::for_resource(client, resource, fields)
        .fetch_counts(exclude_canceled)
        .await
}

/// Counts requests in `resource` by creation day using whichever strategy
/// the resource supports.
///
/// # Errors
///
/// Returns [`SourceError`] if retrieval or parsing fails.
pub async fn pull_daily(
    client: &CkanClient,
    resource: &ResourceDescriptor,
    fields: &FieldMapping,
    exclude_canceled: bool,
) -> Result<Aggregated<DailyRow>, SourceError> {
    ResourceSource::for_resource(client, resource, fields)
        .fetch_daily(exclude_canceled)
        .await
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Datelike as _;
    use serde_json::json;

    use super::*;
    use crate::client::CatalogSettings;
    use crate::fields::CANCELED_STATUS;
    use crate::parsing::parse_timestamp;
    use crate::sql::{quote_ident, quote_literal};
    use crate::stub_server::{StubResponse, StubServer, query_param};

    /// `(created, type, division, ward, status)` fixture rows. Empty strings
    /// stand for missing cells.
    const FIXTURE: &[(&str, &str, &str, &str, &str)] = &[
        ("2024-01-01 09:00:00", "Pothole", "Transportation", "Ward 1", ""),
        ("2024-01-01 10:00:00", "Pothole", "Transportation", "Ward 1", ""),
        ("2024-01-01 11:00:00", "Graffiti", "Solid Waste", "Ward 2", "Canceled"),
        ("2024-01-02 08:30:00", "Graffiti", "Solid Waste", "Ward 2", "Closed"),
        ("2024-01-02 09:30:00", "Noise", "", "Ward 3", "In-progress"),
        ("2024-01-03 00:00:00", "", "Solid Waste", "Ward 2", ""),
        ("garbage", "Pothole", "Transportation", "Ward 1", ""),
        ("2024-02-10T12:00:00", "Pothole", "Transportation", "", "canceled"),
    ];

    fn fixture_csv() -> String {
        let mut csv = String::from(
            "Service Request Creation Date and Time,Original Service Request Type,\
             Service Request Division,Service Request Ward,Service Request Status\n",
        );
        for (created, request_type, division, ward, status) in FIXTURE {
            csv.push_str(&format!("{created},{request_type},{division},{ward},{status}\n"));
        }
        csv
    }

    /// SQL `NULL` for an empty fixture cell.
    fn nullable(value: &str) -> serde_json::Value {
        if value.is_empty() { json!(null) } else { json!(value) }
    }

    /// Plays the datastore. The timestamp column is typed, so an
    /// unparseable value is stored as `NULL`; empty cells are `NULL` too.
    /// Each `WHERE` condition is applied only when its exact text appears in
    /// the received SQL, and `NULL` group keys come back as `null`. Records
    /// are returned in reverse key order with counts as strings, as CKAN does
    /// for `bigint`.
    fn simulated_datastore(sql: &str) -> StubResponse {
        let fields = FieldMapping::default();
        let requires_timestamp =
            sql.contains(&format!("{} IS NOT NULL", quote_ident(&fields.created_at)));
        let requires_type = sql.contains(&format!(
            "COALESCE({}, '') <> ''",
            quote_ident(&fields.request_type)
        ));
        let excludes_canceled = sql.contains(&format!(
            "COALESCE({}, '') <> {}",
            quote_ident(&fields.status),
            quote_literal(CANCELED_STATUS)
        ));

        let kept = FIXTURE
            .iter()
            .map(|(created, request_type, division, ward, status)| {
                (parse_timestamp(created), *request_type, *division, *ward, *status)
            })
            .filter(|(created, request_type, _, _, status)| {
                !(requires_timestamp && created.is_none()
                    || requires_type && request_type.is_empty()
                    || excludes_canceled && *status == CANCELED_STATUS)
            });

        let records: Vec<serde_json::Value> = if sql.contains("AS day") {
            let mut groups: BTreeMap<Option<String>, u64> = BTreeMap::new();
            for (created, ..) in kept {
                *groups
                    .entry(created.map(|c| c.date_naive().to_string()))
                    .or_default() += 1;
            }
            groups
                .into_iter()
                .rev()
                .map(|(day, n)| {
                    let day = day.map_or(json!(null), |d| json!(format!("{d}T00:00:00")));
                    json!({"day": day, "n": n.to_string()})
                })
                .collect()
        } else {
            let mut groups: BTreeMap<(Option<i32>, &str, &str, &str), u64> = BTreeMap::new();
            for (created, request_type, division, ward, _) in kept {
                *groups
                    .entry((created.map(|c| c.year()), request_type, division, ward))
                    .or_default() += 1;
            }
            groups
                .into_iter()
                .rev()
                .map(|((year, t, d, w), n)| {
                    json!({
                        "year": year,
                        "type": nullable(t),
                        "division": nullable(d),
                        "ward": nullable(w),
                        "n": n.to_string(),
                    })
                })
                .collect()
        };

        StubResponse::json(json!({"success": true, "result": {"records": records}}).to_string())
    }

    async fn fixture_server() -> StubServer {
        StubServer::start(|target| {
            if target.starts_with("/api/3/action/datastore_search_sql") {
                let sql = query_param(target, "sql").unwrap_or_default();
                simulated_datastore(&sql)
            } else if target == "/raw/sr2024.csv" {
                StubResponse::csv(fixture_csv())
            } else {
                StubResponse::status(404, "not found")
            }
        })
        .await
    }

    fn client_for(server: &StubServer) -> CkanClient {
        CkanClient::new(&CatalogSettings {
            base_url: server.base_url(),
            max_retries: 0,
            ..CatalogSettings::default()
        })
        .unwrap()
    }

    fn resource_for(server: &StubServer, datastore_active: bool) -> ResourceDescriptor {
        ResourceDescriptor {
            id: "sr-2024".to_string(),
            url: server.url("/raw/sr2024.csv"),
            name: Some("311 Service Requests 2024".to_string()),
            description: None,
            datastore_active,
        }
    }

    #[test]
    fn selects_strategy_from_flag() {
        let client = CkanClient::new(&CatalogSettings::default()).unwrap();
        let fields = FieldMapping::default();
        let mut resource = ResourceDescriptor {
            id: "r".to_string(),
            url: String::new(),
            name: None,
            description: None,
            datastore_active: true,
        };
        assert_eq!(
            ResourceSource::for_resource(&client, &resource, &fields).strategy(),
            "datastore_sql"
        );
        resource.datastore_active = false;
        assert_eq!(
            ResourceSource::for_resource(&client, &resource, &fields).strategy(),
            "csv_download"
        );
    }

    #[test]
    fn decodes_lenient_count_records() {
        let records: Vec<DatastoreRecord> = vec![
            json!({"year": 2024, "type": "Pothole", "division": null, "ward": 3, "n": "7"}),
            json!({"year": "2024", "type": "Noise", "division": "D", "ward": "W", "n": 1}),
            json!({"year": null, "type": "Noise", "division": "D", "ward": "W", "n": 1}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();

        let decoded = decode_count_records(&records);

        assert_eq!(decoded.rows.len(), 2);
        assert_eq!(decoded.rows[0].division, "");
        assert_eq!(decoded.rows[0].ward, "3");
        assert_eq!(decoded.rows[0].n, 7);
        assert_eq!(decoded.dropped, 1);
    }

    #[tokio::test]
    async fn both_paths_produce_the_same_rows() {
        let server = fixture_server().await;
        let client = client_for(&server);
        let fields = FieldMapping::default();

        for exclude_canceled in [true, false] {
            let query_resource = resource_for(&server, true);
            let download_resource = resource_for(&server, false);

            let via_query = pull_year_counts(&client, &query_resource, &fields, exclude_canceled)
                .await
                .unwrap();
            let via_download =
                pull_year_counts(&client, &download_resource, &fields, exclude_canceled)
                    .await
                    .unwrap();
            assert_eq!(via_query.dropped, 0, "the WHERE clause leaves no null groups");
            let query_set: BTreeSet<_> = via_query.rows.into_iter().collect();
            let download_set: BTreeSet<_> = via_download.rows.into_iter().collect();
            assert_eq!(query_set, download_set, "counts, exclude_canceled={exclude_canceled}");

            let daily_query = pull_daily(&client, &query_resource, &fields, exclude_canceled)
                .await
                .unwrap();
            let daily_download = pull_daily(&client, &download_resource, &fields, exclude_canceled)
                .await
                .unwrap();
            assert_eq!(daily_query.dropped, 0, "the WHERE clause leaves no null days");
            let query_set: BTreeSet<_> = daily_query.rows.into_iter().collect();
            let download_set: BTreeSet<_> = daily_download.rows.into_iter().collect();
            assert_eq!(query_set, download_set, "daily, exclude_canceled={exclude_canceled}");
        }
    }

    #[tokio::test]
    async fn download_path_reports_dropped_rows() {
        let server = fixture_server().await;
        let client = client_for(&server);
        let resource = resource_for(&server, false);

        let year = ResourceSource::for_resource(&client, &resource, &FieldMapping::default())
            .fetch_year(true)
            .await
            .unwrap();

        // Bad timestamp plus missing type.
        assert_eq!(year.counts.dropped, 2);
        // Only the bad timestamp.
        assert_eq!(year.daily.dropped, 1);
        // One download serves both shapes.
        assert_eq!(server.hits().len(), 1);
    }

    #[tokio::test]
    async fn query_path_sends_quoted_resource_id() {
        let server = fixture_server().await;
        let client = client_for(&server);
        let resource = resource_for(&server, true);

        pull_year_counts(&client, &resource, &FieldMapping::default(), true)
            .await
            .unwrap();

        let hits = server.hits();
        let sql = query_param(&hits[0], "sql").unwrap();
        assert!(sql.contains("FROM \"sr-2024\""));
        assert!(sql.contains("'Canceled'"));
    }

    #[tokio::test]
    async fn header_only_download_is_empty_success() {
        let server = StubServer::start(|_| {
            StubResponse::csv(
                "Service Request Creation Date and Time,Original Service Request Type,\
                 Service Request Division,Service Request Ward,Service Request Status\n",
            )
        })
        .await;
        let client = client_for(&server);
        let resource = resource_for(&server, false);

        let counts = pull_year_counts(&client, &resource, &FieldMapping::default(), true)
            .await
            .unwrap();

        assert!(counts.rows.is_empty());
        assert_eq!(counts.dropped, 0);
    }

    #[tokio::test]
    async fn all_canceled_download_is_empty_success() {
        let server = StubServer::start(|_| {
            StubResponse::csv(
                "Service Request Creation Date and Time,Original Service Request Type,\
                 Service Request Division,Service Request Ward,Service Request Status\n\
                 2024-01-01,Graffiti,D,W,Canceled\n",
            )
        })
        .await;
        let client = client_for(&server);
        let resource = resource_for(&server, false);

        let daily = pull_daily(&client, &resource, &FieldMapping::default(), true)
            .await
            .unwrap();

        assert!(daily.rows.is_empty());
    }

    #[tokio::test]
    async fn unusable_download_is_parse_failed() {
        let server = StubServer::start(|_| {
            StubResponse::csv(
                "Service Request Creation Date and Time,Original Service Request Type,\
                 Service Request Division,Service Request Ward,Service Request Status\n\
                 yesterday,Pothole,D,W,\n\
                 last week,Pothole,D,W,\n",
            )
        })
        .await;
        let client = client_for(&server);
        let resource = resource_for(&server, false);

        let err = pull_year_counts(&client, &resource, &FieldMapping::default(), true)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::ParseFailed);
    }

    #[tokio::test]
    async fn wrong_columns_are_parse_failed() {
        let server = StubServer::start(|_| StubResponse::csv("a,b\n1,2\n")).await;
        let client = client_for(&server);
        let resource = resource_for(&server, false);

        let err = pull_daily(&client, &resource, &FieldMapping::default(), true)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::ParseFailed);
    }
}
