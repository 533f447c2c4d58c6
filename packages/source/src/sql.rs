//! Datastore SQL for the server-side aggregation path.
//!
//! The `WHERE` clauses mirror the row exclusions of the client-side path
//! (missing timestamp, missing type, canceled status) so both paths count
//! exactly the same rows.

use crate::fields::{CANCELED_STATUS, FieldMapping};

/// Quotes a SQL identifier, doubling any embedded `"` so the name can never
/// close the quoted identifier early.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Builds the `(year, type, division, ward) → n` aggregation for a
/// datastore table.
#[must_use]
pub fn counts_query(resource_id: &str, fields: &FieldMapping, exclude_canceled: bool) -> String {
    let created = quote_ident(&fields.created_at);
    let request_type = quote_ident(&fields.request_type);
    let mut conditions = vec![
        format!("{created} IS NOT NULL"),
        format!("COALESCE({request_type}, '') <> ''"),
    ];
    if exclude_canceled {
        conditions.push(canceled_condition(fields));
    }

    format!(
        "SELECT date_part('year', {created})::int AS year, \
         {request_type} AS type, \
         {division} AS division, \
         {ward} AS ward, \
         COUNT(*) AS n \
         FROM {table} \
         WHERE {where_clause} \
         GROUP BY 1, 2, 3, 4",
        division = quote_ident(&fields.division),
        ward = quote_ident(&fields.ward),
        table = quote_ident(resource_id),
        where_clause = conditions.join(" AND "),
    )
}

/// Builds the `day → n` aggregation for a datastore table.
#[must_use]
pub fn daily_query(resource_id: &str, fields: &FieldMapping, exclude_canceled: bool) -> String {
    let created = quote_ident(&fields.created_at);
    let mut conditions = vec![format!("{created} IS NOT NULL")];
    if exclude_canceled {
        conditions.push(canceled_condition(fields));
    }

    format!(
        "SELECT date_trunc('day', {created})::date AS day, \
         COUNT(*) AS n \
         FROM {table} \
         WHERE {where_clause} \
         GROUP BY 1 \
         ORDER BY 1",
        table = quote_ident(resource_id),
        where_clause = conditions.join(" AND "),
    )
}

/// Null status counts as not canceled.
fn canceled_condition(fields: &FieldMapping) -> String {
    format!(
        "COALESCE({}, '') <> {}",
        quote_ident(&fields.status),
        quote_literal(CANCELED_STATUS)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_double_quotes() {
        assert_eq!(quote_ident("abc"), "\"abc\"");
        assert_eq!(quote_ident("a\"; DROP TABLE x; --"), "\"a\"\"; DROP TABLE x; --\"");
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn counts_query_filters_canceled_when_requested() {
        let fields = FieldMapping::default();
        let sql = counts_query("res-1", &fields, true);

        assert!(sql.contains("FROM \"res-1\""));
        assert!(sql.contains("COALESCE(\"Service Request Status\", '') <> 'Canceled'"));
        assert!(sql.contains("\"Service Request Creation Date and Time\" IS NOT NULL"));
        assert!(sql.contains("COALESCE(\"Original Service Request Type\", '') <> ''"));
        assert!(sql.ends_with("GROUP BY 1, 2, 3, 4"));
    }

    #[test]
    fn counts_query_keeps_canceled_when_not_excluded() {
        let sql = counts_query("res-1", &FieldMapping::default(), false);
        assert!(!sql.contains("Canceled"));
        assert!(sql.contains("WHERE"));
    }

    #[test]
    fn daily_query_groups_by_truncated_day() {
        let sql = daily_query("res-2", &FieldMapping::default(), true);
        assert!(sql.starts_with("SELECT date_trunc('day', "));
        assert!(sql.contains("::date AS day"));
        assert!(sql.contains("'Canceled'"));
        assert!(sql.ends_with("ORDER BY 1"));
    }
}
