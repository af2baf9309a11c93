//! Error types for the strata foreign-storage subsystem.

use thiserror::Error;

/// Common result type for foreign-storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for foreign-storage operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The foreign-storage manager is a read-only buffer manager; every
    /// mutating operation of the buffer-manager capability set answers this.
    #[error("operation not supported by foreign storage: {0}")]
    Unsupported(&'static str),

    #[error("Mismatched number of logical columns: expected {expected}, found {found}: in file \"{path}\"")]
    SchemaMismatch {
        expected: usize,
        found: usize,
        path: String,
    },

    #[error("incompatible column type for \"{column}\": in file \"{path}\"")]
    SchemaTypeMismatch { column: String, path: String },

    #[error("failed to open source \"{path}\": {source}")]
    SourceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt source \"{path}\": {reason}")]
    CorruptSource { path: String, reason: String },

    #[error("Refresh of foreign table created with APPEND update mode failed as file reduced in size: \"{path}\".")]
    AppendShrank { path: String },

    #[error("Foreign table refreshed with APPEND mode missing archive entry \"{entry}\" from file \"{archive}\".")]
    AppendArchiveEntryMissing { entry: String, archive: String },

    /// A chunk re-population failure after the cache was already cleared.
    /// Callers use this to distinguish "refresh failed, your data is intact"
    /// from "refresh failed, the cache is now partial".
    #[error("refresh failed after cache eviction: {0}")]
    PostEvictionRefresh(#[source] Box<Error>),

    #[error("Invalid value \"{value}\" provided for EVICT option. Value must be either \"true\" or \"false\".")]
    InvalidRefreshOption { value: String },

    #[error("Invalid option \"{option}\" provided for refresh command. Only \"EVICT\" option is supported.")]
    UnknownRefreshOption { option: String },

    #[error("Invalid value \"{value}\" for REFRESH_UPDATE_TYPE option. Value must be \"APPEND\" or \"ALL\".")]
    InvalidRefreshUpdateType { value: String },

    #[error("Invalid value provided for the REFRESH_TIMING_TYPE option. Value must be \"MANUAL\" or \"SCHEDULED\".")]
    InvalidRefreshTimingType,

    #[error("Invalid value provided for the REFRESH_INTERVAL option.")]
    InvalidRefreshInterval,

    #[error("REFRESH_START_DATE_TIME cannot be a past date time.")]
    PastStartDateTime,

    #[error("REFRESH_START_DATE_TIME option must be provided for scheduled refreshes.")]
    MissingStartDateTime,

    #[error("Invalid DATE/TIMESTAMP string ({value})")]
    InvalidDateTime { value: String },

    #[error("foreign table not found: {name}")]
    TableNotFound { name: String },

    #[error("missing required option \"{option}\" for foreign table \"{table}\"")]
    MissingTableOption { option: String, table: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check whether cached data survived the failed operation. True for
    /// every error except a post-eviction refresh failure.
    #[must_use]
    pub fn preserves_cache(&self) -> bool {
        !matches!(self, Self::PostEvictionRefresh(_))
    }

    /// Check if this is an append-mode source regression
    #[must_use]
    pub fn is_append_violation(&self) -> bool {
        matches!(
            self,
            Self::AppendShrank { .. } | Self::AppendArchiveEntryMissing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_option_messages() {
        let err = Error::InvalidRefreshOption {
            value: "invalid".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value \"invalid\" provided for EVICT option. \
             Value must be either \"true\" or \"false\"."
        );

        let err = Error::UnknownRefreshOption {
            option: "INVALID_KEY".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid option \"INVALID_KEY\" provided for refresh command. \
             Only \"EVICT\" option is supported."
        );
    }

    #[test]
    fn test_append_violation() {
        assert!(Error::AppendShrank { path: "f.csv".into() }.is_append_violation());
        assert!(!Error::Unsupported("put_buffer").is_append_violation());
    }

    #[test]
    fn test_post_eviction_preserves_cache() {
        let inner = Error::internal("populate failed");
        let err = Error::PostEvictionRefresh(Box::new(inner));
        assert!(!err.preserves_cache());
        assert!(Error::PastStartDateTime.preserves_cache());
    }
}
