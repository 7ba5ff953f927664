use thiserror::Error;

/// Failures raised by the anonymisation stages.
#[derive(Debug, Error)]
pub enum AnonError {
    /// Input schema does not match the field policy, or a cell cannot be typed.
    #[error("schema error: {0}")]
    Schema(String),

    /// A categorical value has no entry in its collapse table or key table.
    #[error("no mapping for value {value:?} in field `{field}`")]
    MissingMapping { field: String, value: String },

    /// The postal or geo reference service failed after retries.
    #[error("external lookup failed for {query:?}: {reason}")]
    ExternalLookup { query: String, reason: String },

    /// A banding input fell outside every declared interval.
    #[error("value {value} in field `{field}` is outside all bands")]
    Range { field: String, value: String },

    /// Key tables and dataset disagree; nothing may be written.
    #[error("export integrity: {0}")]
    ExportIntegrity(String),
}

pub type AnonResult<T> = std::result::Result<T, AnonError>;

impl AnonError {
    pub fn missing(field: &str, value: impl Into<String>) -> Self {
        AnonError::MissingMapping {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn lookup(query: &str, reason: impl ToString) -> Self {
        AnonError::ExternalLookup {
            query: query.to_string(),
            reason: reason.to_string(),
        }
    }
}
