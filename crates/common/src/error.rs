use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// An external command failed or timed out. `output` holds whatever the
    /// command printed, verbatim.
    #[error("{message}{}", format_output(.output))]
    Collaborator { message: String, output: String },

    /// Some cleanup steps failed but the operation's intent was honored.
    #[error("{message}")]
    PartialFailure { message: String, errors: Vec<String> },

    #[error("{0}")]
    Unsupported(String),

    #[error("Registry error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_output(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        String::new()
    } else {
        format!(": {}", output)
    }
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn collaborator(message: impl Into<String>) -> Self {
        Error::Collaborator {
            message: message.into(),
            output: String::new(),
        }
    }

    /// Prefix the error message with what was being attempted, keeping the
    /// variant (and therefore the HTTP status) intact.
    pub fn context(self, what: impl std::fmt::Display) -> Self {
        match self {
            Error::Validation(m) => Error::Validation(format!("{}: {}", what, m)),
            Error::Conflict(m) => Error::Conflict(format!("{}: {}", what, m)),
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", what, m)),
            Error::Collaborator { message, output } => Error::Collaborator {
                message: format!("{}: {}", what, message),
                output,
            },
            Error::Storage(m) => Error::Storage(format!("{}: {}", what, m)),
            other => Error::Other(anyhow::anyhow!("{}: {}", what, other)),
        }
    }

    /// Append rollback shortcomings to the original failure so the caller
    /// sees a single consolidated report.
    pub fn with_rollback_failures(self, failures: &[String]) -> Self {
        if failures.is_empty() {
            return self;
        }
        let note = failures
            .iter()
            .map(|f| format!(" (rollback failed: {})", f))
            .collect::<String>();
        match self {
            Error::Collaborator { message, output } => Error::Collaborator {
                message,
                output: format!("{}{}", output.trim(), note),
            },
            Error::Storage(m) => Error::Storage(format!("{}{}", m, note)),
            Error::Conflict(m) => Error::Conflict(format!("{}{}", m, note)),
            Error::NotFound(m) => Error::NotFound(format!("{}{}", m, note)),
            Error::Validation(m) => Error::Validation(format!("{}{}", m, note)),
            other => Error::Collaborator {
                message: other.to_string(),
                output: note.trim_start().to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_message_includes_output() {
        let err = Error::Collaborator {
            message: "zfs clone failed".to_string(),
            output: "cannot open 'pool/x@base': dataset does not exist\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "zfs clone failed: cannot open 'pool/x@base': dataset does not exist"
        );
    }

    #[test]
    fn test_rollback_failures_are_appended() {
        let err = Error::collaborator("dhcp reload failed")
            .with_rollback_failures(&["destroy nsboot0/lab01-disk: busy".to_string()]);
        let text = err.to_string();
        assert!(text.starts_with("dhcp reload failed"));
        assert!(text.contains("(rollback failed: destroy nsboot0/lab01-disk: busy)"));
        assert!(matches!(err, Error::Collaborator { .. }));
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = Error::not_found("snapshot missing").context("create lab01");
        assert!(matches!(err, Error::NotFound(ref m) if m == "create lab01: snapshot missing"));
    }
}
