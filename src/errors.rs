use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a [`Store`](crate::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transaction won a write race.
    ///
    /// Raised for unique violations on the open dedup key, serialization
    /// failures and deadlocks. Callers may retry the whole operation.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Error from the database.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Error serializing a payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        // unique_violation, serialization_failure, deadlock_detected
        const CONFLICT_CODES: [&str; 3] = ["23505", "40001", "40P01"];

        let is_conflict = error
            .as_database_error()
            .and_then(|db_error| db_error.code())
            .is_some_and(|code| CONFLICT_CODES.contains(&code.as_ref()));

        if is_conflict {
            Self::Conflict(error.to_string())
        } else {
            Self::Database(error)
        }
    }
}

/// A notification could not be delivered.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DispatchError {
    message: String,
}

impl DispatchError {
    #[allow(missing_docs)]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors returned by event intake.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event payload was rejected before any mutation.
    #[error("Invalid event: {0}")]
    Validation(String),

    /// The event kept conflicting with concurrent writers.
    #[error("Event could not be applied after {attempts} attempts due to write conflicts")]
    Conflict {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Error from the store.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EventError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Errors returned by incident, escalation and job operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No incident with this id exists.
    #[error("Incident {0} not found")]
    IncidentNotFound(Uuid),

    /// No job with this id exists.
    #[error("Job {0} not found")]
    JobNotFound(i64),

    /// Error from the store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Store(error.into())
    }
}
