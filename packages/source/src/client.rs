//! CKAN action API client.
//!
//! Wraps the three calls the pipeline makes against a catalog:
//! `package_show` for resource discovery, `datastore_search_sql` for
//! server-side aggregation, and a plain download of a resource URL. All of
//! them go through [`crate::retry`].

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use sr_trends_models::ResourceDescriptor;

use crate::SourceError;
use crate::retry::{self, RetryPolicy};

/// A single datastore record, keyed by the `AS` aliases of the query.
pub type DatastoreRecord = serde_json::Map<String, serde_json::Value>;

/// Connection settings for a CKAN catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Catalog root, e.g. `https://ckan0.cf.opendata.inter.prod-toronto.ca`.
    pub base_url: String,
    /// Package (dataset) id whose resources are resolved.
    pub package_id: String,
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_base_delay_ms: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            base_url: "https://ckan0.cf.opendata.inter.prod-toronto.ca".to_string(),
            package_id: "311-service-requests-customer-initiated".to_string(),
            timeout_secs: 60,
            connect_timeout_secs: 30,
            max_retries: retry.max_retries,
            retry_base_delay_ms: retry.base_delay_ms,
        }
    }
}

impl CatalogSettings {
    /// The retry policy described by these settings.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }
}

/// The `{success, result, error}` envelope of every CKAN action.
#[derive(Debug, Deserialize)]
struct ActionResponse<T> {
    success: Option<bool>,
    result: Option<T>,
    error: Option<serde_json::Value>,
}

impl<T> ActionResponse<T> {
    fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map_or_else(|| "success=false".to_string(), ToString::to_string)
    }
}

#[derive(Debug, Deserialize)]
struct PackageResult {
    #[serde(default)]
    resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SqlResult {
    #[serde(default)]
    records: Vec<DatastoreRecord>,
}

/// Client bound to one catalog and one package.
#[derive(Debug, Clone)]
pub struct CkanClient {
    http: reqwest::Client,
    base_url: String,
    package_id: String,
    retry: RetryPolicy,
}

impl CkanClient {
    /// Builds a client from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ClientBuild`] if the HTTP client cannot be
    /// constructed.
    pub fn new(settings: &CatalogSettings) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sr_trends/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(SourceError::ClientBuild)?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            package_id: settings.package_id.clone(),
            retry: settings.retry_policy(),
        })
    }

    /// The package this client resolves resources for.
    #[must_use]
    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{action}", self.base_url)
    }

    /// Lists the package's resources via `package_show`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::CatalogUnavailable`] if the endpoint is
    /// unreachable, answers with a non-success status, or reports
    /// `success: false`.
    pub async fn package_resources(&self) -> Result<Vec<ResourceDescriptor>, SourceError> {
        let url = self.action_url("package_show");
        log::info!("Fetching package metadata for {}", self.package_id);

        let body = retry::send_json(
            || self.http.get(&url).query(&[("id", self.package_id.as_str())]),
            &self.retry,
        )
        .await
        .map_err(|e| SourceError::CatalogUnavailable {
            message: format!("package_show for {} failed", self.package_id),
            source: Some(e),
        })?;

        let response: ActionResponse<PackageResult> =
            decode(body).map_err(|message| SourceError::CatalogUnavailable {
                message,
                source: None,
            })?;

        if response.success == Some(false) {
            return Err(SourceError::CatalogUnavailable {
                message: format!(
                    "package_show for {} reported failure: {}",
                    self.package_id,
                    response.error_message()
                ),
                source: None,
            });
        }

        let result = response
            .result
            .ok_or_else(|| SourceError::CatalogUnavailable {
                message: format!("package_show for {} returned no result", self.package_id),
                source: None,
            })?;

        log::debug!(
            "Package {} lists {} resources",
            self.package_id,
            result.resources.len()
        );

        Ok(result.resources)
    }

    /// Runs a `datastore_search_sql` query and returns its records.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::QueryFailed`] if the request fails or the
    /// payload does not report `success: true`.
    pub async fn datastore_sql(
        &self,
        resource_id: &str,
        sql: &str,
    ) -> Result<Vec<DatastoreRecord>, SourceError> {
        let url = self.action_url("datastore_search_sql");
        log::debug!("Datastore query on {resource_id}: {sql}");

        let query_failed = |message: String, source| SourceError::QueryFailed {
            resource_id: resource_id.to_string(),
            message,
            source,
        };

        let body = retry::send_json(|| self.http.get(&url).query(&[("sql", sql)]), &self.retry)
            .await
            .map_err(|e| query_failed("request failed".to_string(), Some(e)))?;

        let response: ActionResponse<SqlResult> =
            decode(body).map_err(|message| query_failed(message, None))?;

        if response.success != Some(true) {
            return Err(query_failed(response.error_message(), None));
        }

        let records = response.result.map(|r| r.records).unwrap_or_default();
        log::debug!("Datastore query on {resource_id} returned {} records", records.len());

        Ok(records)
    }

    /// Downloads a resource's raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::DownloadFailed`] if the download fails after
    /// retries or answers with a non-success status.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        log::info!("Downloading {url}");

        let bytes = retry::send_bytes(|| self.http.get(url), &self.retry)
            .await
            .map_err(|source| SourceError::DownloadFailed {
                url: url.to_string(),
                source,
            })?;

        log::info!("Downloaded {} bytes from {url}", bytes.len());

        Ok(bytes)
    }
}

fn decode<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(body).map_err(|e| format!("unexpected response shape: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub_server::{StubResponse, StubServer, query_param};

    fn settings_for(server: &StubServer) -> CatalogSettings {
        CatalogSettings {
            base_url: format!("{}/", server.base_url()),
            package_id: "pkg".to_string(),
            max_retries: 1,
            retry_base_delay_ms: 1,
            ..CatalogSettings::default()
        }
    }

    #[tokio::test]
    async fn lists_package_resources() {
        let server = StubServer::start(|target| {
            assert!(target.starts_with("/api/3/action/package_show"));
            assert_eq!(query_param(target, "id").as_deref(), Some("pkg"));
            StubResponse::json(
                r#"{"success": true, "result": {"resources": [
                    {"id": "r1", "name": "SR 2023", "url": "http://x/r1.csv", "datastore_active": true}
                ]}}"#,
            )
        })
        .await;
        let client = CkanClient::new(&settings_for(&server)).unwrap();

        let resources = client.package_resources().await.unwrap();

        assert_eq!(resources.len(), 1);
        assert!(resources[0].datastore_active);
    }

    #[tokio::test]
    async fn unsuccessful_package_show_is_catalog_unavailable() {
        let server =
            StubServer::start(|_| StubResponse::json(r#"{"success": false, "error": "nope"}"#))
                .await;
        let client = CkanClient::new(&settings_for(&server)).unwrap();

        let err = client.package_resources().await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::CatalogUnavailable);
    }

    #[tokio::test]
    async fn sql_failure_payload_is_query_failed() {
        let server = StubServer::start(|_| {
            StubResponse::json(r#"{"success": false, "error": {"message": "bad sql"}}"#)
        })
        .await;
        let client = CkanClient::new(&settings_for(&server)).unwrap();

        let err = client.datastore_sql("r1", "SELECT 1").await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::QueryFailed);
        assert!(err.to_string().contains("r1"));
        assert_eq!(server.hits().len(), 1);
    }

    #[tokio::test]
    async fn missing_download_is_download_failed() {
        let server = StubServer::start(|_| StubResponse::status(404, "gone")).await;
        let client = CkanClient::new(&settings_for(&server)).unwrap();

        let err = client.download(&server.url("/r1.csv")).await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::DownloadFailed);
    }
}
