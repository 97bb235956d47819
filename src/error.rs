use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TagError>;

#[derive(Debug, Error)]
pub enum TagError {
    /// The entity model could not be reached or failed to answer.
    #[error("entity oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The oracle answered with something that is not a valid token label.
    #[error("invalid oracle prediction: {0}")]
    InvalidPrediction(String),

    #[error("registry at {} is unreadable: {source}", .path.display())]
    RegistryCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist registry to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry lock {} still held after {attempts} attempts", .path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("invalid config {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TagError {
    /// Errors that leave the trigger watermark in place so the delta is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TagError::OracleUnavailable(_) | TagError::InvalidPrediction(_)
        )
    }

    /// Errors raised while writing the registry; in-memory state is still valid.
    pub fn is_persistence(&self) -> bool {
        matches!(self, TagError::Persist { .. } | TagError::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TagError::OracleUnavailable("down".into()).is_retryable());
        assert!(TagError::InvalidPrediction("X-FOO".into()).is_retryable());
        assert!(!TagError::Embedding("dims".into()).is_retryable());

        let err = TagError::LockTimeout {
            path: PathBuf::from("ner_tags.json.lock"),
            attempts: 3,
        };
        assert!(err.is_persistence());
        assert_eq!(
            err.to_string(),
            "registry lock ner_tags.json.lock still held after 3 attempts"
        );
    }
}
