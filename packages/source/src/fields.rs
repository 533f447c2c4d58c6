//! Raw column names of a yearly service-request table.
//!
//! The same names are used as quoted identifiers in datastore SQL and as
//! header lookups in downloaded CSV files, which is what keeps the two
//! retrieval paths looking at the same data.

use serde::Deserialize;

/// Status value that marks a canceled request. Compared case-sensitively.
pub const CANCELED_STATUS: &str = "Canceled";

/// Maps the pipeline's dimensions to source column names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    /// Creation timestamp column.
    pub created_at: String,
    /// Request type column. Rows without a value are unusable.
    pub request_type: String,
    /// Owning division column.
    pub division: String,
    /// Ward column.
    pub ward: String,
    /// Request status column, checked against [`CANCELED_STATUS`].
    pub status: String,
}

impl Default for FieldMapping {
    /// The City of Toronto 311 customer-initiated schema.
    fn default() -> Self {
        Self {
            created_at: "Service Request Creation Date and Time".to_string(),
            request_type: "Original Service Request Type".to_string(),
            division: "Service Request Division".to_string(),
            ward: "Service Request Ward".to_string(),
            status: "Service Request Status".to_string(),
        }
    }
}
