//! Error types for the delivery pipeline.

use cadence_core::EventId;

/// The result type used throughout cadence-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A broker produce or consume failed.
    #[error("broker error: {message}")]
    Broker {
        /// Description of the broker failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A delivery channel could not be constructed.
    #[error("delivery error: {message}")]
    Delivery {
        /// Description of the failure.
        message: String,
    },

    /// A configuration value is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the failure.
        message: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// An event was not found.
    #[error("event not found: {id}")]
    EventNotFound {
        /// The event ID that was not found.
        id: EventId,
    },

    /// An error from cadence-core.
    #[error("core error: {0}")]
    Core(#[from] cadence_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new broker error.
    #[must_use]
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new broker error with a source.
    #[must_use]
    pub fn broker_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Broker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new delivery error.
    #[must_use]
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::storage_with_source("database operation failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::storage_with_source("failed to reach database", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn event_not_found_display() {
        let id = cadence_core::EventId::generate();
        let err = Error::EventNotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn configuration_error_display() {
        let err = Error::configuration("missing CADENCE_DATABASE_URL");
        assert!(err.to_string().contains("CADENCE_DATABASE_URL"));
    }
}
