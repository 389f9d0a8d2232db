/*!
Error types for the zbackup core engine.
*/

use thiserror::Error;

/// Result type used throughout the zbackup core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while orchestrating snapshots, transfers and diffs.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Malformed input such as a snapshot name outside the naming grammar
    #[error("Validation error: {0}")]
    Validation(String),

    /// The same entity was named twice where uniqueness is required
    #[error("Duplicate {entity_type}: {identifier}")]
    Duplicate {
        entity_type: &'static str,
        identifier: String,
    },

    /// Entity absent from the run-scoped listing of the storage engine
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// An external command exited with a nonzero status or was killed
    #[error("Command `{command}` failed ({status}){}", format_stderr(.stderr))]
    Process {
        command: String,
        status: String,
        stderr: Vec<String>,
    },

    /// Output of an external command did not have the expected shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O errors while spawning processes or walking directory trees
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The process lacks the privilege required to mutate the storage engine
    #[error("Insufficient privileges: {0}")]
    Privilege(String),
}

fn format_stderr(stderr: &[String]) -> String {
    match stderr.last() {
        Some(line) => format!(": {line}"),
        None => String::new(),
    }
}

impl BackupError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a "not found" error for filesystems
    pub fn filesystem_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Filesystem",
            identifier: identifier.into(),
        }
    }

    /// Create a "duplicate" error for command-line targets
    pub fn duplicate_target(identifier: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type: "target",
            identifier: identifier.into(),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Duplicate { .. })
    }

    /// Check if this error came from a failed external command
    pub fn is_process(&self) -> bool {
        matches!(self, Self::Process { .. })
    }
}
