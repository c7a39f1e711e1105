//! Publishing error taxonomy
//!
//! Inner stages return `anyhow::Result` and attach context; the variants here
//! are the ones the orchestrator (and callers) need to tell apart, recovered
//! with `downcast_ref` at the outermost boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    /// Another run is open; raised before anything is written.
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// The harvester repository has no file for a required table.
    #[error("{location} does not exist! Are you sure the resource has successfully finished harvesting?")]
    MissingSourceFile { file: String, location: String },

    /// Trait publishing failed; the run continues but finalizes as failed.
    #[error("Trait publishing failed: {0}")]
    TraitLoadFailure(String),

    /// A cancellation request was observed between stages or chunks.
    #[error("Publishing cancelled during {0}")]
    Cancelled(String),

    #[error("Updates limited to {limit} characters (got {size})")]
    UpdateTooLarge { size: usize, limit: usize },

    #[error("Column '{column}' does not exist on table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Unknown entity type: {0}")]
    UnsupportedEntity(String),

    #[error("Row {line} of {file} is malformed: {reason}")]
    InvalidSourceRow { file: String, line: u64, reason: String },

    #[error("Resource {0} not found")]
    ResourceNotFound(i64),

    #[error("Repository error: {0}")]
    Repo(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    /// Errors raised before the run touched anything.
    pub fn is_precondition(&self) -> bool {
        matches!(self, PublishError::AlreadyRunning(_) | PublishError::ResourceNotFound(_))
    }

    /// Whether the queue should try the job again.
    pub fn is_retryable(&self) -> bool {
        !self.is_precondition()
            && !matches!(
                self,
                PublishError::MissingSourceFile { .. }
                    | PublishError::TraitLoadFailure(_)
                    | PublishError::UnknownColumn { .. }
                    | PublishError::UnsupportedEntity(_)
                    | PublishError::InvalidSourceRow { .. }
            )
    }
}

/// Find a `PublishError` anywhere in an anyhow chain.
pub fn find_publish_error(err: &anyhow::Error) -> Option<&PublishError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PublishError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_missing_source_file_message_names_location() {
        let err = PublishError::MissingSourceFile {
            file: "nodes.tsv".to_string(),
            location: "http://harvest/resources/fish/publish/nodes.tsv".to_string(),
        };
        assert!(err
            .to_string()
            .starts_with("http://harvest/resources/fish/publish/nodes.tsv does not exist!"));
    }

    #[test]
    fn test_find_publish_error_through_context() {
        let err: anyhow::Error = Err::<(), _>(PublishError::Cancelled("loading".to_string()))
            .context("while publishing")
            .unwrap_err();

        assert!(matches!(find_publish_error(&err), Some(PublishError::Cancelled(_))));
    }

    #[test]
    fn test_precondition_errors() {
        assert!(PublishError::AlreadyRunning("x".to_string()).is_precondition());
        assert!(!PublishError::TraitLoadFailure("x".to_string()).is_precondition());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PublishError::Cancelled("loading".to_string()).is_retryable());
        assert!(PublishError::Repo("503".to_string()).is_retryable());
        assert!(!PublishError::AlreadyRunning("x".to_string()).is_retryable());
        assert!(!PublishError::TraitLoadFailure("x".to_string()).is_retryable());
    }
}
