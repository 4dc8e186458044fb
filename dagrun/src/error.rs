//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Module '{name}' could not be resolved; suggestions: {}", .suggestions.join(", "))]
    Resolution {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("Composition error: {message}")]
    Composition { message: String, nodes: Vec<String> },

    #[error("Node '{node}' failed: {cause}")]
    Execution { node: String, cause: String },

    #[error("Unknown outputs requested: {requested:?} (available: {available:?})")]
    UnknownOutputs {
        requested: Vec<String>,
        available: Vec<String>,
    },

    #[error("Node '{node}' is missing inputs {inputs:?}; provide them as input overrides")]
    MissingInputs { node: String, inputs: Vec<String> },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }

    pub fn composition(msg: impl Into<String>, nodes: Vec<String>) -> Self {
        Self::Composition {
            message: msg.into(),
            nodes,
        }
    }

    /// Whether another attempt of the same job could succeed.
    ///
    /// Resolution, composition and planning failures are properties of the
    /// run configuration itself and fail the same way every time.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::Resolution { .. }
                | Self::Composition { .. }
                | Self::UnknownOutputs { .. }
                | Self::MissingInputs { .. }
                | Self::Validation(_)
                | Self::Configuration(_)
                | Self::Schedule(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_message_names_attempt_and_suggestion() {
        let err = Error::Resolution {
            name: "my-flow".to_string(),
            suggestions: vec!["pipelines.my-flow".to_string(), "my_flow".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'my-flow'"));
        assert!(msg.contains("pipelines.my-flow"));
        assert!(msg.contains("my_flow"));
    }

    #[test]
    fn test_retriable_classification() {
        assert!(
            Error::Execution {
                node: "total".into(),
                cause: "boom".into()
            }
            .is_retriable()
        );
        assert!(Error::queue("disk full").is_retriable());
        assert!(!Error::composition("cycle", vec!["a".into()]).is_retriable());
        assert!(!Error::validation("no targets").is_retriable());
    }
}
