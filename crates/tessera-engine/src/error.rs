//! Error types for the export engine domain.
//!
//! Every error carries a stable kind (the enum variant), a human-readable
//! message and, where available, the underlying cause. No error is used for
//! control flow: completion, empty task sets and duplicate progress events
//! are all regular return values.

/// The result type used throughout tessera-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Inputs failed preconditions. Terminal for the step.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the violated precondition.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The resource manager refused the requested units.
    ///
    /// Retryable by the outer scheduler; the step stays in its current
    /// state.
    #[error("resource claim rejected for {resource}: {requested} virtual units")]
    ResourceClaimRejected {
        /// The shared resource the claim was made against.
        resource: String,
        /// The refused number of virtual units.
        requested: f64,
    },

    /// An I/O or statement failure on the database.
    ///
    /// The executor retries these internally; once surfaced here the retry
    /// budget is exhausted and the error is fatal.
    #[error("transient database error: {message}")]
    TransientDb {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The per-task query could not be constructed.
    ///
    /// Fatal; indicates a bug or malformed task data.
    #[error("failed to build task query for task {task_id}: {message}")]
    TaskQueryBuild {
        /// The task the query was built for.
        task_id: i64,
        /// Description of the failure.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tessera-core.
    #[error("core error: {0}")]
    Core(#[from] tessera_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new validation error with a cause.
    #[must_use]
    pub fn validation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new transient database error.
    #[must_use]
    pub fn transient_db(message: impl Into<String>) -> Self {
        Self::TransientDb {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient database error with a cause.
    #[must_use]
    pub fn transient_db_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientDb {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if the outer scheduler may retry the failed operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceClaimRejected { .. })
    }
}
