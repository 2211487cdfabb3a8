// rust/hgdata-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Boxed error returned by user-supplied hooks such as preprocessors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DataError {

    #[error("Store '{name}' not found")]
    StoreNotFound {
        name: String,
    },

    #[error("Store '{name}' is not accessible: {message}")]
    StoreAccess {
        name: String,
        message: String,
    },

    #[error("Store '{name}' already exists")]
    StoreExists {
        name: String,
    },

    #[error("Group '{group}' not found in store '{store}'")]
    GroupNotFound {
        store: String,
        group: String,
    },

    #[error("Field '{field}' not found in group '{group}'")]
    FieldNotFound {
        group: String,
        field: String,
    },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch {
        message: String,
    },

    #[error("Read of {count} samples at {start} exceeds length {len} of field '{field}'")]
    OutOfRange {
        field: String,
        start: u64,
        count: u64,
        len: u64,
    },

    #[error("Preprocessing failed for batch {batch_index}: {message}")]
    Preprocessing {
        batch_index: u64,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Format error: {message}")]
    Format {
        message: String,
    },

    #[error("{what} is closed")]
    Closed {
        what: String,
    },
}

pub type Result<T> = std::result::Result<T, DataError>;

// Convenience constructors
impl DataError {

    pub fn store_not_found(name: impl Into<String>) -> Self {
        Self::StoreNotFound { name: name.into() }
    }

    pub fn store_access(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreAccess {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn store_exists(name: impl Into<String>) -> Self {
        Self::StoreExists { name: name.into() }
    }

    pub fn group_not_found(store: impl Into<String>, group: impl Into<String>) -> Self {
        Self::GroupNotFound {
            store: store.into(),
            group: group.into(),
        }
    }

    pub fn field_not_found(group: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            group: group.into(),
            field: field.into(),
        }
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    pub fn out_of_range(field: impl Into<String>, start: u64, count: u64, len: u64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            start,
            count,
            len,
        }
    }

    pub fn preprocessing(batch_index: u64, message: impl Into<String>) -> Self {
        Self::Preprocessing {
            batch_index,
            message: message.into(),
            source: None,
        }
    }

    pub fn preprocessing_with_source(batch_index: u64, source: BoxError) -> Self {
        Self::Preprocessing {
            batch_index,
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    /// Returns true for errors that come from a missing store, group or field.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::StoreNotFound { .. } | Self::GroupNotFound { .. } | Self::FieldNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = DataError::out_of_range("X", 10, 5, 12);
        assert_eq!(
            err.to_string(),
            "Read of 5 samples at 10 exceeds length 12 of field 'X'"
        );

        let err = DataError::preprocessing(7, "bad sample");
        assert!(err.to_string().contains("batch 7"));
    }

    #[test]
    fn test_preprocessing_keeps_source() {
        let source: BoxError = "division by zero".into();
        let err = DataError::preprocessing_with_source(3, source);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(DataError::store_not_found("missing").is_not_found());
        assert!(DataError::group_not_found("s", "g").is_not_found());
        assert!(DataError::field_not_found("g", "f").is_not_found());
        assert!(!DataError::store_exists("s").is_not_found());
    }
}
